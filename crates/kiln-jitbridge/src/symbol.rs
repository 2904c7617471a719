//! Symbols: the externally-visible things generated code can reference
//!
//! A symbol stands for an address the output writer will materialize:
//! a method entry point, a runtime helper, a dispatch cell, a handle, or
//! pinned literal bytes. Call descriptors and relocations refer to
//! symbols; they never leak host-side object identity to the backend.

use kiln_types::{FieldId, MetadataStore, MethodId, TypeId};

use crate::helpers::HelperId;

/// An externally-referenced address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Entry point of a method's compiled code
    MethodEntry(MethodId),
    /// Runtime helper entry point
    Helper(HelperId),
    /// Interface dispatch cell for calls to the given interface method
    DispatchCell(MethodId),
    /// Descriptor carrying both a code pointer and its hidden
    /// generic-context argument, used when a generic-aware method is
    /// materialized as a plain address
    FatPointer(MethodId),
    /// Embedded handle of a type
    TypeHandle(TypeId),
    /// Embedded handle of a method
    MethodHandle(MethodId),
    /// Embedded handle of a field
    FieldHandle(FieldId),
    /// Address of a static field's storage
    StaticFieldAddress(FieldId),
    /// Pinned literal bytes, identified by pin index within the current
    /// compilation
    PinnedLiteral(u32),
}

impl Symbol {
    /// Render the symbol as the name the output writer keys on
    pub fn describe(&self, store: &MetadataStore) -> String {
        match *self {
            Symbol::MethodEntry(m) => {
                format!("method:{}", store.entity_name(kiln_types::Entity::Method(m)))
            }
            Symbol::Helper(h) => format!("helper:{}", h.name()),
            Symbol::DispatchCell(m) => {
                format!("cell:{}", store.entity_name(kiln_types::Entity::Method(m)))
            }
            Symbol::FatPointer(m) => {
                format!("fatptr:{}", store.entity_name(kiln_types::Entity::Method(m)))
            }
            Symbol::TypeHandle(t) => format!("typehandle:{}", store.type_name(t)),
            Symbol::MethodHandle(m) => {
                format!("methodhandle:{}", store.entity_name(kiln_types::Entity::Method(m)))
            }
            Symbol::FieldHandle(f) => {
                format!("fieldhandle:{}", store.entity_name(kiln_types::Entity::Field(f)))
            }
            Symbol::StaticFieldAddress(f) => {
                format!("static:{}", store.entity_name(kiln_types::Entity::Field(f)))
            }
            Symbol::PinnedLiteral(i) => format!("literal:{i}"),
        }
    }
}
