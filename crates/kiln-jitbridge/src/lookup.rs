//! Generic lookup computation
//!
//! Decides, for any handle generated code needs, whether it is known at
//! compile time or must be fetched from a generic dictionary at execution
//! time — and synthesizes the recipe for the latter. A descriptor is
//! always exactly one of the two forms; the enum makes a half-filled
//! descriptor unrepresentable.

use kiln_types::{Entity, MetadataStore, MethodId};

use crate::error::CompileError;
use crate::helpers::HelperId;
use crate::symbol::Symbol;

/// How a shared method obtains its generic context at execution time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Implicitly from the receiver object's type
    ThisObject,
    /// From the hidden type-context argument
    TypeParam,
    /// From the hidden method-context argument
    MethodParam,
}

/// A recipe for fetching a compile-time-unknown value at execution time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLookup {
    /// Where the dictionary is reachable from
    pub kind: LookupKind,
    /// The helper that performs the fetch
    pub helper: HelperId,
    /// The runtime-determined entity the dictionary slot holds
    pub subject: Entity,
}

/// Either a compile-time-known symbol or a runtime lookup recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupDescriptor {
    Constant(Symbol),
    Dynamic(RuntimeLookup),
}

impl LookupDescriptor {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, LookupDescriptor::Dynamic(_))
    }
}

/// What resource the backend wants materialized for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    TypeHandle,
    MethodHandle,
    FieldHandle,
    /// A method's code entry point
    MethodEntry,
    /// An interface dispatch cell
    DispatchCell,
    /// A code-pointer-plus-context descriptor
    FatPointer,
}

/// How a shared method obtains its generic context, or `None` when the
/// method is not shared.
///
/// Shared method instantiations carry the context in the hidden method
/// argument; shared statics and value-type methods carry it in the hidden
/// type argument; shared instance methods on reference types read it from
/// the receiver.
pub fn context_source(store: &MetadataStore, m: MethodId) -> Option<LookupKind> {
    if !store.is_shared_method(m) {
        return None;
    }
    let mdesc = store.method(m);
    if mdesc.generic_args.iter().any(|&a| store.contains_canon(a)) {
        return Some(LookupKind::MethodParam);
    }
    if mdesc.flags.is_static || store.type_desc(mdesc.owner).is_value_type() {
        return Some(LookupKind::TypeParam);
    }
    Some(LookupKind::ThisObject)
}

/// Compute the lookup descriptor for an entity needed by generated code.
///
/// `canonical` is the compile-time form used for constant symbols;
/// `runtime` is the runtime-determined form a dictionary slot would hold.
/// The result is dynamic only when the enclosing method is shared and the
/// runtime form actually depends on the instantiation.
pub fn compute_lookup(
    store: &MetadataStore,
    enclosing: MethodId,
    canonical: Entity,
    runtime: Entity,
    want: ResourceKind,
) -> Result<LookupDescriptor, CompileError> {
    let instantiation_dependent =
        store.is_shared_method(enclosing) && mentions_param(store, runtime);
    if !instantiation_dependent {
        return Ok(LookupDescriptor::Constant(constant_symbol(
            store, canonical, want,
        )));
    }
    let kind = context_source(store, enclosing)
        .expect("instantiation-dependent lookup in an unshared method");
    let helper = match kind {
        LookupKind::ThisObject => HelperId::RuntimeLookupThisObject,
        LookupKind::TypeParam => HelperId::RuntimeLookupClass,
        LookupKind::MethodParam => HelperId::RuntimeLookupMethod,
    };
    Ok(LookupDescriptor::Dynamic(RuntimeLookup {
        kind,
        helper,
        subject: runtime,
    }))
}

/// The constant form of a descriptor, bypassing runtime-lookup
/// computation. Used when evaluating a call site on behalf of an inline
/// candidate, where dictionary computation must not run.
pub fn constant_lookup(store: &MetadataStore, e: Entity, want: ResourceKind) -> LookupDescriptor {
    LookupDescriptor::Constant(constant_symbol(store, e, want))
}

fn mentions_param(store: &MetadataStore, e: Entity) -> bool {
    match e {
        Entity::Type(t) => store.contains_param(t),
        Entity::Method(m) => {
            let mdesc = store.method(m);
            store.contains_param(mdesc.owner)
                || mdesc.generic_args.iter().any(|&a| store.contains_param(a))
        }
        Entity::Field(f) => store.contains_param(store.field(f).owner),
        Entity::Signature(_) | Entity::Locals(_) => false,
    }
}

/// The constant symbol for an entity.
///
/// # Panics
///
/// Panics when the resource kind does not fit the entity kind — a
/// backend asking for, say, a type handle of a field is a contract
/// violation, never answered with a guess.
fn constant_symbol(store: &MetadataStore, e: Entity, want: ResourceKind) -> Symbol {
    match (want, e) {
        (ResourceKind::TypeHandle, Entity::Type(t)) => Symbol::TypeHandle(t),
        (ResourceKind::MethodHandle, Entity::Method(m)) => Symbol::MethodHandle(m),
        (ResourceKind::FieldHandle, Entity::Field(f)) => Symbol::FieldHandle(f),
        (ResourceKind::MethodEntry, Entity::Method(m)) => Symbol::MethodEntry(m),
        (ResourceKind::DispatchCell, Entity::Method(m)) => Symbol::DispatchCell(m),
        (ResourceKind::FatPointer, Entity::Method(m)) => Symbol::FatPointer(m),
        (want, e) => panic!(
            "resource kind {:?} cannot be materialized for a {} ({})",
            want,
            e.kind_name(),
            store.entity_name(e)
        ),
    }
}
