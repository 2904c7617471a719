//! Type and field queries: attributes, layout, GC tracing, relations
//!
//! Everything the backend asks about a type or member that is not a call:
//! attribute flag words, sizes and alignment, instance-field enumeration,
//! the per-slot GC-pointer layout, and the cast/equality/merge relations.
//!
//! Relation queries give a definite answer only when both sides are fully
//! concrete. With a canonical placeholder on either side the engine
//! prefers "unknown" over a wrong definite answer, with two exceptions
//! that no instantiation can contradict (see [`TypeQueryEngine::can_cast`]
//! and [`TypeQueryEngine::types_equal`]).

use rustc_hash::FxHashMap;

use kiln_types::{FieldId, MetadataStore, MethodId, TypeId, TypeKind};

use crate::config::CastPolicy;
use crate::error::CompileError;
use crate::lookup::{context_source, LookupKind};

/// Class attribute flag word bits (stable backend ABI)
pub mod class_attribs {
    pub const VALUE_TYPE: u32 = 0x0001;
    pub const INTERFACE: u32 = 0x0002;
    pub const ABSTRACT: u32 = 0x0004;
    pub const SEALED: u32 = 0x0008;
    pub const DELEGATE: u32 = 0x0010;
    pub const CONTAINS_GC_PTR: u32 = 0x0020;
    pub const EXPLICIT_LAYOUT: u32 = 0x0040;
    pub const BEFORE_FIELD_INIT: u32 = 0x0080;
    pub const BYREF_LIKE: u32 = 0x0100;
    pub const INTRINSIC: u32 = 0x0200;
    pub const ARRAY: u32 = 0x0400;
    pub const SHARED_INST: u32 = 0x0800;
}

/// Method attribute flag word bits (stable backend ABI)
pub mod method_attribs {
    pub const STATIC: u32 = 0x0001;
    pub const VIRTUAL: u32 = 0x0002;
    pub const FINAL: u32 = 0x0004;
    pub const ABSTRACT: u32 = 0x0008;
    pub const CTOR: u32 = 0x0010;
    pub const INTRINSIC: u32 = 0x0020;
    pub const NATIVE_ONLY: u32 = 0x0040;
    pub const GENERIC: u32 = 0x0080;
    pub const SHARED_INST: u32 = 0x0100;
    pub const REQUIRES_INST_ARG: u32 = 0x0200;
}

/// Three-valued answer for relation queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    Yes,
    No,
    Unknown,
}

/// Per-slot GC classification. One byte per pointer-sized slot, in layout
/// order — the backend consumes this bitmap byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcSlot {
    None = 0,
    /// An object reference the collector traces
    Ref = 1,
    /// A managed pointer into an object or stack slot
    ByRef = 2,
    /// An interior pointer kept alive without being retargeted
    Interior = 3,
}

/// Answers type/field/method queries over the metadata store
pub struct TypeQueryEngine {
    gc_cache: FxHashMap<TypeId, Vec<u8>>,
}

impl TypeQueryEngine {
    pub fn new() -> Self {
        TypeQueryEngine {
            gc_cache: FxHashMap::default(),
        }
    }

    /// The class attribute flag word for a type
    pub fn class_attribs(&mut self, store: &MetadataStore, ty: TypeId) -> u32 {
        let desc = store.type_desc(ty);
        let mut flags = 0u32;
        if desc.is_value_type() {
            flags |= class_attribs::VALUE_TYPE;
        }
        if desc.is_interface() {
            flags |= class_attribs::INTERFACE;
        }
        if desc.flags.is_abstract {
            flags |= class_attribs::ABSTRACT;
        }
        if store.is_effectively_sealed(ty) {
            flags |= class_attribs::SEALED;
        }
        if matches!(desc.kind, TypeKind::Delegate) {
            flags |= class_attribs::DELEGATE;
        }
        if desc.flags.explicit_layout {
            flags |= class_attribs::EXPLICIT_LAYOUT;
        }
        if desc.flags.before_field_init {
            flags |= class_attribs::BEFORE_FIELD_INIT;
        }
        if desc.flags.is_byref_like {
            flags |= class_attribs::BYREF_LIKE;
        }
        if desc.flags.is_intrinsic {
            flags |= class_attribs::INTRINSIC;
        }
        if desc.is_array() {
            flags |= class_attribs::ARRAY;
        }
        if store.contains_canon(ty) {
            flags |= class_attribs::SHARED_INST;
        }
        if desc.instance_size.is_some() {
            if let Ok(layout) = self.gc_layout(store, ty) {
                if layout.iter().any(|&b| b != GcSlot::None as u8) {
                    flags |= class_attribs::CONTAINS_GC_PTR;
                }
            }
        }
        flags
    }

    /// The method attribute flag word for a method
    pub fn method_attribs(&self, store: &MetadataStore, m: MethodId) -> u32 {
        let mdesc = store.method(m);
        let mut flags = 0u32;
        if mdesc.flags.is_static {
            flags |= method_attribs::STATIC;
        }
        if mdesc.flags.is_virtual {
            flags |= method_attribs::VIRTUAL;
        }
        if mdesc.flags.is_final {
            flags |= method_attribs::FINAL;
        }
        if mdesc.flags.is_abstract {
            flags |= method_attribs::ABSTRACT;
        }
        if mdesc.flags.is_ctor {
            flags |= method_attribs::CTOR;
        }
        if mdesc.flags.is_intrinsic {
            flags |= method_attribs::INTRINSIC;
        }
        if mdesc.flags.native_only {
            flags |= method_attribs::NATIVE_ONLY;
        }
        if mdesc.generic_arity > 0 {
            flags |= method_attribs::GENERIC;
        }
        if store.is_shared_method(m) {
            flags |= method_attribs::SHARED_INST;
        }
        if matches!(
            context_source(store, m),
            Some(LookupKind::TypeParam) | Some(LookupKind::MethodParam)
        ) {
            flags |= method_attribs::REQUIRES_INST_ARG;
        }
        flags
    }

    /// Byte size of a type's instance data
    pub fn instance_size(&self, store: &MetadataStore, ty: TypeId) -> Result<u32, CompileError> {
        store
            .type_desc(ty)
            .instance_size
            .ok_or_else(|| {
                CompileError::Type(kiln_types::TypeError::NoLayout {
                    name: store.type_name(ty).to_string(),
                })
            })
    }

    /// Byte size of a type when used as a field or array element
    pub fn element_size(&self, store: &MetadataStore, ty: TypeId) -> Result<u32, CompileError> {
        Ok(store.type_size_align(ty)?.0)
    }

    /// Alignment of a type when used as a field or array element
    pub fn alignment(&self, store: &MetadataStore, ty: TypeId) -> Result<u32, CompileError> {
        Ok(store.type_size_align(ty)?.1)
    }

    /// Number of instance fields (inherited included, statics and
    /// literals skipped)
    pub fn instance_field_count(&self, store: &MetadataStore, ty: TypeId) -> u32 {
        store.instance_fields(ty).len() as u32
    }

    /// Zero-based lookup over instance fields only
    pub fn field_by_index(
        &self,
        store: &MetadataStore,
        ty: TypeId,
        index: u32,
    ) -> Option<FieldId> {
        store.instance_fields(ty).get(index as usize).copied()
    }

    /// The GC-pointer layout of a type's instance data: one byte per
    /// pointer-sized slot, each a [`GcSlot`] discriminant.
    ///
    /// Computed recursively: reference and managed-pointer fields
    /// contribute a tracked slot at their offset; value-type fields
    /// recurse at their base offset.
    ///
    /// # Panics
    ///
    /// Panics if overlapping fields (explicit layout) disagree on a
    /// slot's classification, or a tracked field sits at a misaligned
    /// offset. Both are metadata inconsistencies no caller can recover
    /// from.
    pub fn gc_layout(
        &mut self,
        store: &MetadataStore,
        ty: TypeId,
    ) -> Result<Vec<u8>, CompileError> {
        if let Some(cached) = self.gc_cache.get(&ty) {
            return Ok(cached.clone());
        }
        let size = self.instance_size(store, ty)?;
        let ptr = store.pointer_size();
        let slots = size.div_ceil(ptr) as usize;
        let mut layout = vec![GcSlot::None as u8; slots];
        mark_gc_slots(store, ty, 0, &mut layout);
        self.gc_cache.insert(ty, layout.clone());
        Ok(layout)
    }

    /// Cast compatibility of `from` to `to`.
    ///
    /// Definite for concrete pairs. With a canonical side, the only
    /// definite answer is a positive for a shared source against an
    /// uninstantiated interface target — variance or instantiation can
    /// never turn that positive into a negative.
    pub fn can_cast(
        &self,
        store: &MetadataStore,
        from: TypeId,
        to: TypeId,
        policy: CastPolicy,
    ) -> TriState {
        if store.is_concrete(from) && store.is_concrete(to) {
            if store.is_subtype_of(from, to) {
                return TriState::Yes;
            }
            return match policy {
                CastPolicy::Exact => TriState::No,
                CastPolicy::VersionBubble => TriState::Unknown,
            };
        }
        let to_desc = store.type_desc(to);
        if to_desc.is_interface() && to_desc.generic_args.is_empty() {
            let implements = store.interface_closure(from).iter().any(|&i| {
                i == to || store.type_desc(i).generic_def == Some(to)
            });
            if implements {
                return TriState::Yes;
            }
        }
        TriState::Unknown
    }

    /// Type equality.
    ///
    /// Definite for concrete pairs. With a canonical side, the only
    /// definite answer is a negative against a non-canonical value type
    /// of a different type definition — the placeholder only ever stands
    /// for reference types.
    pub fn types_equal(&self, store: &MetadataStore, a: TypeId, b: TypeId) -> TriState {
        if store.is_concrete(a) && store.is_concrete(b) {
            return if a == b { TriState::Yes } else { TriState::No };
        }
        let (shared, concrete) = if store.contains_canon(a) && store.is_concrete(b) {
            (a, b)
        } else if store.contains_canon(b) && store.is_concrete(a) {
            (b, a)
        } else {
            return TriState::Unknown;
        };
        let concrete_desc = store.type_desc(concrete);
        if concrete_desc.is_value_type() {
            let def_of = |t: TypeId| store.type_desc(t).generic_def.unwrap_or(t);
            if def_of(concrete) != def_of(shared) {
                return TriState::No;
            }
        }
        TriState::Unknown
    }

    /// Common-ancestor computation for two stack types.
    ///
    /// Commutative whenever the result is a class; may be order-dependent
    /// only across multiple candidate interfaces. Returns `None` when the
    /// types have no merge (distinct value types).
    pub fn merge(&self, store: &MetadataStore, a: TypeId, b: TypeId) -> Option<TypeId> {
        if a == b {
            return Some(a);
        }
        let object = store.well_known().object;
        if !store.is_concrete(a) || !store.is_concrete(b) {
            // Canonical references still merge at the root
            if store.is_reference_type(a) && store.is_reference_type(b) {
                return Some(object);
            }
            return None;
        }
        if store.type_desc(a).is_value_type() || store.type_desc(b).is_value_type() {
            return None;
        }
        if store.is_subtype_of(a, b) {
            return Some(b);
        }
        if store.is_subtype_of(b, a) {
            return Some(a);
        }
        // Deepest common ancestor class
        let mut cur = store.type_desc(a).base;
        while let Some(t) = cur {
            if t != object && store.is_subtype_of(b, t) {
                return Some(t);
            }
            cur = store.type_desc(t).base;
        }
        // Candidate interfaces, first match wins
        for i in store.interface_closure(a) {
            if store.is_subtype_of(b, i) {
                return Some(i);
            }
        }
        Some(object)
    }

    /// Drop cached layouts (between compilations)
    pub fn reset(&mut self) {
        self.gc_cache.clear();
    }
}

impl Default for TypeQueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn set_slot(layout: &mut [u8], store: &MetadataStore, offset: u32, slot: GcSlot) {
    let ptr = store.pointer_size();
    assert!(
        offset % ptr == 0,
        "misaligned GC pointer at offset {offset}"
    );
    let index = (offset / ptr) as usize;
    let old = layout[index];
    assert!(
        old == GcSlot::None as u8 || old == slot as u8,
        "inconsistent GC layout at slot {index}: {old} vs {}",
        slot as u8
    );
    layout[index] = slot as u8;
}

fn mark_gc_slots(store: &MetadataStore, ty: TypeId, base: u32, layout: &mut [u8]) {
    for f in store.instance_fields(ty) {
        let fdesc = store.field(f);
        let offset = base + fdesc.offset;
        match &store.type_desc(fdesc.ty).kind {
            TypeKind::Class
            | TypeKind::Interface
            | TypeKind::Delegate
            | TypeKind::Array { .. }
            | TypeKind::Canon => set_slot(layout, store, offset, GcSlot::Ref),
            TypeKind::ByRef { .. } => set_slot(layout, store, offset, GcSlot::ByRef),
            TypeKind::ValueType => mark_gc_slots(store, fdesc.ty, offset, layout),
            TypeKind::Primitive(_) | TypeKind::Pointer { .. } => {}
            TypeKind::Param(p) => panic!(
                "GC layout over open parameter !{}", p.index
            ),
        }
    }
}
