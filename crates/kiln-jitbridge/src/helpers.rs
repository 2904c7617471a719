//! Runtime helper entry points and the helper-symbol cache
//!
//! Generated code never calls into the runtime directly; it goes through a
//! fixed set of well-known helper functions. The bridge hands the backend
//! helper identities as symbols, and the output writer turns them into
//! imports against the runtime.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Well-known runtime helper functions that generated code calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperId {
    NewObject,
    NewArray,
    NewString,
    Box,
    Unbox,
    CastClass,
    IsInstanceOf,
    Throw,
    Rethrow,
    InitClass,
    GetGcStaticBase,
    GetNonGcStaticBase,
    GetRuntimeTypeHandle,
    GetRuntimeMethodHandle,
    GetRuntimeFieldHandle,
    ResolveVirtualFuncPtr,
    ResolveGenericVirtual,
    MemCpy,
    /// Fetch a handle from a dictionary reachable through the receiver's
    /// type
    RuntimeLookupThisObject,
    /// Fetch a handle from a dictionary reachable through a hidden
    /// type-context argument
    RuntimeLookupClass,
    /// Fetch a handle from a dictionary reachable through a hidden
    /// method-context argument
    RuntimeLookupMethod,
}

impl HelperId {
    /// Stable linkage name of the helper
    pub fn name(self) -> &'static str {
        match self {
            HelperId::NewObject => "kiln_new_object",
            HelperId::NewArray => "kiln_new_array",
            HelperId::NewString => "kiln_new_string",
            HelperId::Box => "kiln_box",
            HelperId::Unbox => "kiln_unbox",
            HelperId::CastClass => "kiln_cast_class",
            HelperId::IsInstanceOf => "kiln_is_instance_of",
            HelperId::Throw => "kiln_throw",
            HelperId::Rethrow => "kiln_rethrow",
            HelperId::InitClass => "kiln_init_class",
            HelperId::GetGcStaticBase => "kiln_get_gc_static_base",
            HelperId::GetNonGcStaticBase => "kiln_get_non_gc_static_base",
            HelperId::GetRuntimeTypeHandle => "kiln_get_runtime_type_handle",
            HelperId::GetRuntimeMethodHandle => "kiln_get_runtime_method_handle",
            HelperId::GetRuntimeFieldHandle => "kiln_get_runtime_field_handle",
            HelperId::ResolveVirtualFuncPtr => "kiln_resolve_virtual_func_ptr",
            HelperId::ResolveGenericVirtual => "kiln_resolve_generic_virtual",
            HelperId::MemCpy => "kiln_memcpy",
            HelperId::RuntimeLookupThisObject => "kiln_runtime_lookup_this_object",
            HelperId::RuntimeLookupClass => "kiln_runtime_lookup_class",
            HelperId::RuntimeLookupMethod => "kiln_runtime_lookup_method",
        }
    }

    const ALL: [HelperId; 21] = [
        HelperId::NewObject,
        HelperId::NewArray,
        HelperId::NewString,
        HelperId::Box,
        HelperId::Unbox,
        HelperId::CastClass,
        HelperId::IsInstanceOf,
        HelperId::Throw,
        HelperId::Rethrow,
        HelperId::InitClass,
        HelperId::GetGcStaticBase,
        HelperId::GetNonGcStaticBase,
        HelperId::GetRuntimeTypeHandle,
        HelperId::GetRuntimeMethodHandle,
        HelperId::GetRuntimeFieldHandle,
        HelperId::ResolveVirtualFuncPtr,
        HelperId::ResolveGenericVirtual,
        HelperId::MemCpy,
        HelperId::RuntimeLookupThisObject,
        HelperId::RuntimeLookupClass,
        HelperId::RuntimeLookupMethod,
    ];

    /// Look a helper up by its linkage name
    pub fn from_name(name: &str) -> Option<HelperId> {
        static BY_NAME: Lazy<FxHashMap<&'static str, HelperId>> = Lazy::new(|| {
            HelperId::ALL.iter().map(|&h| (h.name(), h)).collect()
        });
        BY_NAME.get(name).copied()
    }

    /// The helper recognized intrinsic methods lower to, if any
    pub fn for_intrinsic(method_name: &str) -> Option<HelperId> {
        match method_name {
            "GetTypeFromHandle" => Some(HelperId::GetRuntimeTypeHandle),
            "Box" => Some(HelperId::Box),
            "Unbox" => Some(HelperId::Unbox),
            "MemoryCopy" => Some(HelperId::MemCpy),
            _ => None,
        }
    }
}

/// Cache of helper-symbol ordinals handed to the output writer.
///
/// Populated lazily as helpers are first referenced, never cleared during
/// a compilation run. One cache per bridge instance by default; a driver
/// may share one across instances through an `Arc` — reads vastly
/// outnumber writes, so a read-write lock fits.
pub struct HelperSymbolCache {
    ordinals: RwLock<FxHashMap<HelperId, u32>>,
}

impl HelperSymbolCache {
    pub fn new() -> Self {
        HelperSymbolCache {
            ordinals: RwLock::new(FxHashMap::default()),
        }
    }

    /// The stable ordinal for a helper, assigning the next free one on
    /// first use.
    pub fn ordinal(&self, helper: HelperId) -> u32 {
        if let Some(&ord) = self.ordinals.read().get(&helper) {
            return ord;
        }
        let mut map = self.ordinals.write();
        let next = map.len() as u32;
        *map.entry(helper).or_insert(next)
    }

    /// Number of helpers referenced so far
    pub fn len(&self) -> usize {
        self.ordinals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.read().is_empty()
    }
}

impl Default for HelperSymbolCache {
    fn default() -> Self {
        Self::new()
    }
}
