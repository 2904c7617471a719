//! Shared fixture world for bridge integration tests

use kiln_types::{
    Entity, FieldFlags, GenericParamRef, MetadataStore, MethodFlags, MethodId, PrimitiveKind,
    TokenEntry, TypeFlags, TypeId, TypeKind, TypeSpec,
};

use kiln_jitbridge::backend::{BackendError, CodegenBackend, CompilationEnv};
use kiln_jitbridge::{BufferKind, BufferRequest};

/// Backend driven by a test closure
pub struct ScriptBackend<F>(pub F);

impl<F> CodegenBackend for ScriptBackend<F>
where
    F: Fn(&mut CompilationEnv<'_>) -> Result<(), BackendError>,
{
    fn name(&self) -> &str {
        "script"
    }

    fn compile_method(&self, env: &mut CompilationEnv<'_>) -> Result<(), BackendError> {
        (self.0)(env)
    }
}

/// Allocate a minimal hot buffer so the compilation can publish
pub fn emit_trap_code(env: &mut CompilationEnv<'_>) {
    env.alloc_buffers(BufferRequest {
        hot_size: 4,
        ..BufferRequest::default()
    });
    for b in env.buffer_mut(BufferKind::HotCode) {
        *b = 0xCC;
    }
    env.set_gc_map(Vec::new());
}

/// The fixture world:
///
/// ```text
/// interface IScan { virtual int Probe(Object); }
/// class Vessel : Object, IScan {
///     Object cargo; int count; Ballast ballast;
///     const int DRAFT = 7;                     // literal
///     static void Reset();
///     virtual void Render();
///     static void Tally();                     // body with tokens
/// }
/// struct Ballast { String tag; int depth; }
/// class Crate<T> {
///     static void Make();
///     void Stow();                             // body calling Make
/// }
/// ```
///
/// Tally tokens: 0x10 call Reset, 0x20 call IScan.Probe, 0x30 literal
/// DRAFT, 0x40 type Vessel, string 0x50 "ahoy".
/// Stow tokens: 0x10 call Crate<!0>.Make.
pub struct Fixture {
    pub store: MetadataStore,
    pub vessel: TypeId,
    pub ballast: TypeId,
    pub iscan: TypeId,
    pub probe: MethodId,
    pub reset: MethodId,
    pub render: MethodId,
    pub tally: MethodId,
    pub crate_def: TypeId,
    pub make_def: MethodId,
    pub stow_shared: MethodId,
}

pub fn fixture() -> Fixture {
    let mut store = MetadataStore::new(8);
    let object = store.well_known().object;
    let string = store.well_known().string;
    let canon = store.well_known().canon;
    let void = store.primitive(PrimitiveKind::Void);
    let i32t = store.primitive(PrimitiveKind::I32);

    let iscan = store.define_type(TypeSpec {
        name: "IScan".to_string(),
        kind: TypeKind::Interface,
        base: None,
        interfaces: vec![],
        generic_arity: 0,
        flags: TypeFlags {
            is_abstract: true,
            ..TypeFlags::default()
        },
    });
    let probe = store.add_method(
        iscan,
        "Probe",
        vec![object],
        i32t,
        MethodFlags {
            is_virtual: true,
            is_abstract: true,
            ..MethodFlags::default()
        },
        0,
    );

    let ballast = store.define_type(TypeSpec {
        name: "Ballast".to_string(),
        kind: TypeKind::ValueType,
        base: None,
        interfaces: vec![],
        generic_arity: 0,
        flags: TypeFlags::default(),
    });
    store.add_field(ballast, "tag", string, FieldFlags::default(), None);
    store.add_field(ballast, "depth", i32t, FieldFlags::default(), None);
    store.finish_layout(ballast).unwrap();

    let vessel = store.define_type(TypeSpec {
        name: "Vessel".to_string(),
        kind: TypeKind::Class,
        base: Some(object),
        interfaces: vec![iscan],
        generic_arity: 0,
        flags: TypeFlags::default(),
    });
    store.add_field(vessel, "cargo", object, FieldFlags::default(), None);
    store.add_field(vessel, "count", i32t, FieldFlags::default(), None);
    store.add_field(vessel, "ballast", ballast, FieldFlags::default(), None);
    let draft = store.add_field(
        vessel,
        "DRAFT",
        i32t,
        FieldFlags {
            is_static: true,
            is_literal: true,
            ..FieldFlags::default()
        },
        None,
    );
    store.finish_layout(vessel).unwrap();

    let reset = store.add_method(
        vessel,
        "Reset",
        vec![],
        void,
        MethodFlags {
            is_static: true,
            ..MethodFlags::default()
        },
        0,
    );
    let render = store.add_method(
        vessel,
        "Render",
        vec![],
        void,
        MethodFlags {
            is_virtual: true,
            ..MethodFlags::default()
        },
        0,
    );
    let tally = store.add_method(
        vessel,
        "Tally",
        vec![],
        void,
        MethodFlags {
            is_static: true,
            ..MethodFlags::default()
        },
        0,
    );
    let body = store.set_body(
        tally,
        vec![
            (
                0x10,
                TokenEntry {
                    entity: Entity::Method(reset),
                    as_array: false,
                },
            ),
            (
                0x20,
                TokenEntry {
                    entity: Entity::Method(probe),
                    as_array: false,
                },
            ),
            (
                0x30,
                TokenEntry {
                    entity: Entity::Field(draft),
                    as_array: false,
                },
            ),
            (
                0x40,
                TokenEntry {
                    entity: Entity::Type(vessel),
                    as_array: false,
                },
            ),
        ],
        vec![],
    );
    store.add_body_string(body, 0x50, "ahoy");

    let crate_def = store.define_type(TypeSpec {
        name: "Crate".to_string(),
        kind: TypeKind::Class,
        base: Some(object),
        interfaces: vec![],
        generic_arity: 1,
        flags: TypeFlags::default(),
    });
    let make_def = store.add_method(
        crate_def,
        "Make",
        vec![],
        void,
        MethodFlags {
            is_static: true,
            ..MethodFlags::default()
        },
        0,
    );
    let stow_def = store.add_method(crate_def, "Stow", vec![], void, MethodFlags::default(), 0);

    let t0 = store.param_type(GenericParamRef {
        index: 0,
        from_method: false,
    });
    let crate_open = store.instantiate_type(crate_def, &[t0]).unwrap();
    let make_open = store.instantiate_method(make_def, crate_open, &[]).unwrap();
    store.set_body(
        stow_def,
        vec![(
            0x10,
            TokenEntry {
                entity: Entity::Method(make_open),
                as_array: false,
            },
        )],
        vec![],
    );

    let crate_canon = store.instantiate_type(crate_def, &[canon]).unwrap();
    let stow_shared = store.instantiate_method(stow_def, crate_canon, &[]).unwrap();

    Fixture {
        store,
        vessel,
        ballast,
        iscan,
        probe,
        reset,
        render,
        tally,
        crate_def,
        make_def,
        stow_shared,
    }
}
