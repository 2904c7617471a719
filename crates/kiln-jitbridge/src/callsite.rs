//! Call-site resolution
//!
//! Given a resolved call token, the calling context, an optional
//! constraint type, and the call-site flags, decide how the backend must
//! emit the call and produce the exact symbol or lookup recipe. The
//! decision is an ordered guard sequence; every branch builds a complete,
//! immutable [`CallDescriptor`] so a partially-initialized result can
//! never leak to the backend.

use kiln_types::{Entity, MetadataStore, MethodId, SigId, TypeId};

use crate::error::CompileError;
use crate::helpers::HelperId;
use crate::lookup::{compute_lookup, context_source, LookupDescriptor, LookupKind, ResourceKind};
use crate::query::TypeQueryEngine;
use crate::symbol::Symbol;

/// The dispatch strategy chosen for a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Call the target's entry point (or helper) directly
    Direct,
    /// Indirect call through the receiver's virtual table slot
    VTableSlot,
    /// Dispatch through an interface dispatch cell
    InterfaceStub,
    /// Generic virtual call: resolve a method handle at execution time
    DispatchByHandle,
    /// The address materialized is a descriptor carrying both code
    /// pointer and hidden context argument
    FatPointer,
}

/// Receiver adjustment required before the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThisTransform {
    None,
    /// Box the value-type receiver (unresolved value-type constraint)
    BoxValue,
    /// Dereference the receiver address (unresolved reference-type
    /// constraint)
    DerefAddress,
}

/// Everything a call-site resolution request carries
#[derive(Debug, Clone, Copy)]
pub struct CallSiteRequest {
    /// The token's nominal method, in the context's instantiation
    pub method: Entity,
    /// Its runtime-determined form
    pub runtime_method: Entity,
    /// Constraint type of a `constrained.` call site
    pub constraint: Option<TypeId>,
    /// The call site is a virtual dispatch
    pub virtual_call: bool,
    /// The call is being materialized as a value (address-of) rather
    /// than invoked immediately
    pub materialize_address: bool,
}

/// The resolution of "how to call method M from context C"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub kind: CallKind,
    /// Effective target, possibly different from the token's nominal
    /// method after constraint resolution or intrinsic substitution
    pub target: MethodId,
    pub this_transform: ThisTransform,
    /// Effective generic context entity
    pub context: Entity,
    /// Code-address lookup: constant symbol or runtime recipe
    pub lookup: LookupDescriptor,
    pub needs_null_check: bool,
    /// Populated for v-table dispatch only
    pub vtable_slot: Option<u16>,
    /// Class attribute snapshot of the effective owner
    pub class_attribs: u32,
    /// Method attribute snapshot of the resolved target
    pub method_attribs: u32,
    /// The target's signature
    pub sig: SigId,
}

/// Resolve one call site. Deterministic: a fixed (token, context, flags)
/// tuple always yields the same descriptor.
pub fn resolve_call(
    store: &mut MetadataStore,
    queries: &mut TypeQueryEngine,
    enclosing: MethodId,
    req: &CallSiteRequest,
) -> Result<CallDescriptor, CompileError> {
    let nominal = req.method.as_method().ok_or_else(|| invalid(
        store,
        enclosing,
        format!("call token names a {}", req.method.kind_name()),
    ))?;
    let nominal_desc = store.method(nominal).clone();

    // Step 1: a virtual-call token must not land on a static method
    if req.virtual_call && nominal_desc.flags.is_static {
        return Err(invalid(
            store,
            enclosing,
            format!(
                "virtual call to static method `{}`",
                store.entity_name(req.method)
            ),
        ));
    }
    // Step 2: native-only methods may be address-taken, never invoked
    // from managed code
    if nominal_desc.flags.native_only && !req.materialize_address {
        return Err(invalid(
            store,
            enclosing,
            format!(
                "managed call to native-only method `{}`",
                store.entity_name(req.method)
            ),
        ));
    }

    // Step 3: constraint resolution
    let mut target = nominal;
    let mut runtime_entity = req.runtime_method;
    let mut this_transform = ThisTransform::None;
    let mut constrained_resolved = false;
    let mut effective_owner = nominal_desc.owner;
    if let Some(ct) = req.constraint {
        if let Some(m2) = find_constrained_target(store, ct, nominal) {
            // A resolved target skips any this-transform and rebinds the
            // effective receiver type to the constraint type
            target = m2;
            runtime_entity = Entity::Method(m2);
            constrained_resolved = true;
            effective_owner = ct;
        } else if store.type_desc(ct).is_value_type() {
            if store.type_desc(ct).flags.is_byref_like {
                return Err(invalid(
                    store,
                    enclosing,
                    format!("boxing stack-only type `{}`", store.type_name(ct)),
                ));
            }
            this_transform = ThisTransform::BoxValue;
        } else {
            this_transform = ThisTransform::DerefAddress;
        }
    }

    let target_desc = store.method(target).clone();
    let owner_is_interface = store.type_desc(target_desc.owner).is_interface();

    // Step 4: direct classification. The finality clause never applies to
    // interface-owned targets: their implementations live elsewhere.
    let direct = target_desc.flags.is_static
        || !req.virtual_call
        || constrained_resolved
        || (!owner_is_interface && store.is_effectively_final(target));

    let canonical_target = store.canonical_method(target)?;
    let requires_inst_arg = matches!(
        context_source(store, canonical_target),
        Some(LookupKind::TypeParam) | Some(LookupKind::MethodParam)
    );

    let canonical_entity = Entity::Method(canonical_target);
    let (kind, lookup, needs_null_check, vtable_slot);
    if direct && requires_inst_arg && req.materialize_address {
        // Step 5: one address must carry both code pointer and hidden
        // context — only legal when materialized as a value
        kind = CallKind::FatPointer;
        lookup = compute_lookup(
            store,
            enclosing,
            canonical_entity,
            runtime_entity,
            ResourceKind::FatPointer,
        )?;
        needs_null_check = false;
        vtable_slot = None;
    } else if direct {
        // Step 6: direct call to the canonical target form
        kind = CallKind::Direct;
        lookup = if target_desc.flags.is_ctor
            && target_desc.owner == store.well_known().string
        {
            // String construction is an allocation, not a constructor call
            LookupDescriptor::Constant(Symbol::Helper(HelperId::NewString))
        } else if target_desc.flags.is_intrinsic {
            match HelperId::for_intrinsic(&target_desc.name) {
                Some(h) => LookupDescriptor::Constant(Symbol::Helper(h)),
                None => compute_lookup(
                    store,
                    enclosing,
                    canonical_entity,
                    runtime_entity,
                    ResourceKind::MethodEntry,
                )?,
            }
        } else {
            compute_lookup(
                store,
                enclosing,
                canonical_entity,
                runtime_entity,
                ResourceKind::MethodEntry,
            )?
        };
        // A devirtualized virtual site still checks the receiver
        needs_null_check = req.virtual_call && !target_desc.flags.is_static;
        vtable_slot = None;
    } else if target_desc.generic_arity > 0 {
        // Step 7: generic virtual call
        kind = CallKind::DispatchByHandle;
        lookup = compute_lookup(
            store,
            enclosing,
            canonical_entity,
            runtime_entity,
            ResourceKind::MethodHandle,
        )?;
        needs_null_check = true;
        vtable_slot = None;
    } else if owner_is_interface {
        // Step 8: interface dispatch cell (the stub checks the receiver)
        kind = CallKind::InterfaceStub;
        lookup = compute_lookup(
            store,
            enclosing,
            canonical_entity,
            runtime_entity,
            ResourceKind::DispatchCell,
        )?;
        needs_null_check = false;
        vtable_slot = None;
    } else {
        // Step 9: ordinary virtual call through a stable v-table layout
        kind = CallKind::VTableSlot;
        lookup = compute_lookup(
            store,
            enclosing,
            canonical_entity,
            runtime_entity,
            ResourceKind::MethodEntry,
        )?;
        needs_null_check = true;
        vtable_slot = target_desc.vtable_slot;
    }

    let context = if target_desc.generic_arity > 0 || !target_desc.generic_args.is_empty() {
        Entity::Method(target)
    } else {
        Entity::Type(effective_owner)
    };

    Ok(CallDescriptor {
        kind,
        target,
        this_transform,
        context,
        lookup,
        needs_null_check,
        vtable_slot,
        class_attribs: queries.class_attribs(store, effective_owner),
        method_attribs: queries.method_attribs(store, target),
        sig: target_desc.sig,
    })
}

fn invalid(store: &MetadataStore, enclosing: MethodId, reason: String) -> CompileError {
    CompileError::InvalidProgram {
        method: store.entity_name(Entity::Method(enclosing)),
        reason,
    }
}

/// Approximate constrained-call resolution: the first matching method on
/// the constraint type's class hierarchy. Interface declarations do not
/// count as implementations.
fn find_constrained_target(
    store: &MetadataStore,
    constraint: TypeId,
    nominal: MethodId,
) -> Option<MethodId> {
    let nominal_desc = store.method(nominal);
    let name = nominal_desc.name.clone();
    let param_count = store.sig(nominal_desc.sig).params.len();
    let mut cur = Some(constraint);
    while let Some(t) = cur {
        if !store.type_desc(t).is_interface() {
            if let Some(m) = store.find_method_matching(t, &name, param_count) {
                return Some(m);
            }
        }
        cur = store.type_desc(t).base;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{MethodFlags, PrimitiveKind, TypeFlags, TypeKind, TypeSpec};

    struct World {
        store: MetadataStore,
        queries: TypeQueryEngine,
        caller: MethodId,
        static_sum: MethodId,
        virtual_draw: MethodId,
        final_close: MethodId,
        iface_compare: MethodId,
        generic_virtual: MethodId,
        native_only: MethodId,
        meter: TypeId,
        meter_compare: MethodId,
    }

    /// IComparer { virtual int Compare(Object) }
    /// Widget : Object, IComparer {
    ///     static void Sum(); virtual void Draw(); final virtual void Close();
    ///     virtual void Visit<T>(); [native-only] void Blit();
    /// }
    /// Meter (value type) : IComparer via Compare(Object)
    fn world() -> World {
        let mut store = MetadataStore::new(8);
        let object = store.well_known().object;
        let void = store.primitive(PrimitiveKind::Void);
        let i32t = store.primitive(PrimitiveKind::I32);

        let icomparer = store.define_type(TypeSpec {
            name: "IComparer".to_string(),
            kind: TypeKind::Interface,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags {
                is_abstract: true,
                ..TypeFlags::default()
            },
        });
        let iface_compare = store.add_method(
            icomparer,
            "Compare",
            vec![object],
            i32t,
            MethodFlags {
                is_virtual: true,
                is_abstract: true,
                ..MethodFlags::default()
            },
            0,
        );

        let widget = store.define_type(TypeSpec {
            name: "Widget".to_string(),
            kind: TypeKind::Class,
            base: Some(object),
            interfaces: vec![icomparer],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });
        let static_sum = store.add_method(
            widget,
            "Sum",
            vec![],
            void,
            MethodFlags {
                is_static: true,
                ..MethodFlags::default()
            },
            0,
        );
        let virtual_draw = store.add_method(
            widget,
            "Draw",
            vec![],
            void,
            MethodFlags {
                is_virtual: true,
                ..MethodFlags::default()
            },
            0,
        );
        let final_close = store.add_method(
            widget,
            "Close",
            vec![],
            void,
            MethodFlags {
                is_virtual: true,
                is_final: true,
                ..MethodFlags::default()
            },
            0,
        );
        let generic_virtual = store.add_method(
            widget,
            "Visit",
            vec![],
            void,
            MethodFlags {
                is_virtual: true,
                ..MethodFlags::default()
            },
            1,
        );
        let native_only = store.add_method(
            widget,
            "Blit",
            vec![],
            void,
            MethodFlags {
                native_only: true,
                ..MethodFlags::default()
            },
            0,
        );
        let caller = store.add_method(widget, "Caller", vec![], void, MethodFlags::default(), 0);

        let meter = store.define_type(TypeSpec {
            name: "Meter".to_string(),
            kind: TypeKind::ValueType,
            base: None,
            interfaces: vec![icomparer],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });
        let meter_compare = store.add_method(
            meter,
            "Compare",
            vec![object],
            i32t,
            MethodFlags {
                is_virtual: true,
                is_final: true,
                ..MethodFlags::default()
            },
            0,
        );
        store.finish_layout(meter).unwrap();

        World {
            store,
            queries: TypeQueryEngine::new(),
            caller,
            static_sum,
            virtual_draw,
            final_close,
            iface_compare,
            generic_virtual,
            native_only,
            meter,
            meter_compare,
        }
    }

    fn plain_request(m: MethodId, virtual_call: bool) -> CallSiteRequest {
        CallSiteRequest {
            method: Entity::Method(m),
            runtime_method: Entity::Method(m),
            constraint: None,
            virtual_call,
            materialize_address: false,
        }
    }

    #[test]
    fn test_direct_static_call() {
        let mut w = world();
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.static_sum, false),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::Direct);
        assert_eq!(
            d.lookup,
            LookupDescriptor::Constant(Symbol::MethodEntry(w.static_sum))
        );
        assert!(!d.needs_null_check);
    }

    #[test]
    fn test_vtable_call() {
        let mut w = world();
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.virtual_draw, true),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::VTableSlot);
        assert!(d.needs_null_check);
        assert!(d.vtable_slot.is_some());
    }

    #[test]
    fn test_final_virtual_devirtualized() {
        let mut w = world();
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.final_close, true),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::Direct);
        // Devirtualized, but the receiver is still checked
        assert!(d.needs_null_check);
    }

    #[test]
    fn test_interface_stub() {
        let mut w = world();
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.iface_compare, true),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::InterfaceStub);
        assert_eq!(
            d.lookup,
            LookupDescriptor::Constant(Symbol::DispatchCell(w.iface_compare))
        );
    }

    #[test]
    fn test_generic_virtual_dispatch_by_handle() {
        let mut w = world();
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.generic_virtual, true),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::DispatchByHandle);
        assert!(d.needs_null_check);
        assert_eq!(d.context, Entity::Method(w.generic_virtual));
    }

    #[test]
    fn test_constrained_resolved_skips_transform() {
        let mut w = world();
        let req = CallSiteRequest {
            method: Entity::Method(w.iface_compare),
            runtime_method: Entity::Method(w.iface_compare),
            constraint: Some(w.meter),
            virtual_call: true,
            materialize_address: false,
        };
        let d = resolve_call(&mut w.store, &mut w.queries, w.caller, &req).unwrap();
        assert_eq!(d.kind, CallKind::Direct);
        assert_eq!(d.target, w.meter_compare);
        assert_eq!(d.this_transform, ThisTransform::None);
        assert_eq!(d.context, Entity::Type(w.meter));
    }

    #[test]
    fn test_constrained_unresolved_value_type_boxes() {
        let mut w = world();
        // A value type with no matching implementation falls back to boxing
        let gauge = w.store.define_type(TypeSpec {
            name: "Gauge".to_string(),
            kind: TypeKind::ValueType,
            base: None,
            interfaces: vec![],
            generic_arity: 0,
            flags: TypeFlags::default(),
        });
        w.store.finish_layout(gauge).unwrap();
        let req = CallSiteRequest {
            method: Entity::Method(w.iface_compare),
            runtime_method: Entity::Method(w.iface_compare),
            constraint: Some(gauge),
            virtual_call: true,
            materialize_address: false,
        };
        let d = resolve_call(&mut w.store, &mut w.queries, w.caller, &req).unwrap();
        assert_eq!(d.this_transform, ThisTransform::BoxValue);
        assert_eq!(d.kind, CallKind::InterfaceStub);
    }

    #[test]
    fn test_constrained_reference_type_derefs() {
        let mut w = world();
        let string = w.store.well_known().string;
        let req = CallSiteRequest {
            method: Entity::Method(w.iface_compare),
            runtime_method: Entity::Method(w.iface_compare),
            constraint: Some(string),
            virtual_call: true,
            materialize_address: false,
        };
        let d = resolve_call(&mut w.store, &mut w.queries, w.caller, &req).unwrap();
        assert_eq!(d.this_transform, ThisTransform::DerefAddress);
    }

    #[test]
    fn test_virtual_call_to_static_rejected() {
        let mut w = world();
        let err = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.static_sum, true),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidProgram { .. }));
    }

    #[test]
    fn test_native_only_call_rejected_but_address_allowed() {
        let mut w = world();
        let err = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.native_only, false),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidProgram { .. }));

        let req = CallSiteRequest {
            materialize_address: true,
            ..plain_request(w.native_only, false)
        };
        assert!(resolve_call(&mut w.store, &mut w.queries, w.caller, &req).is_ok());
    }

    #[test]
    fn test_string_ctor_is_allocation_helper() {
        let mut w = world();
        let string = w.store.well_known().string;
        let void = w.store.primitive(PrimitiveKind::Void);
        let ctor = w.store.add_method(
            string,
            ".ctor",
            vec![],
            void,
            MethodFlags {
                is_ctor: true,
                ..MethodFlags::default()
            },
            0,
        );
        let d = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(ctor, false),
        )
        .unwrap();
        assert_eq!(d.kind, CallKind::Direct);
        assert_eq!(
            d.lookup,
            LookupDescriptor::Constant(Symbol::Helper(HelperId::NewString))
        );
    }

    #[test]
    fn test_resolution_deterministic() {
        let mut w = world();
        let a = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.virtual_draw, true),
        )
        .unwrap();
        let b = resolve_call(
            &mut w.store,
            &mut w.queries,
            w.caller,
            &plain_request(w.virtual_draw, true),
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
