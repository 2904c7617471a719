//! Kiln type-system substrate
//!
//! Entity descriptions and the metadata store consumed by the rest of the
//! compiler. The store registers types, methods, fields, signatures, and
//! method bodies, interns every constructed form (arrays, by-refs,
//! pointers, generic instantiations), and answers the provider queries the
//! JIT bridge depends on: bodies, layout, sealedness, canonical forms, and
//! RVA initializer data.

pub mod entity;
pub mod error;
pub mod store;

pub use entity::{
    BodyId, Entity, FieldDesc, FieldFlags, FieldId, GenericParamRef, MethodBody, MethodDesc,
    MethodFlags, MethodId, PrimitiveKind, SigDesc, SigId, TokenEntry, TypeDesc, TypeFlags, TypeId,
    TypeKind,
};
pub use error::TypeError;
pub use store::{MetadataStore, TypeSpec, WellKnownTypes};
