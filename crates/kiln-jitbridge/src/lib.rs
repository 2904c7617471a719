//! Kiln JIT/AOT bridge
//!
//! The bridge between the Kiln type system and a native code-generation
//! backend that compiles one method at a time. The backend knows nothing
//! about the host object model: it exchanges opaque handles, token-keyed
//! resolutions, and raw memory buffers through the callback surface in
//! [`backend::CompilationEnv`], and the bridge answers every query —
//! token meaning, call emission strategy, GC layout, relocation placement
//! — deterministically, without leaking host-side identity.
//!
//! Component map:
//! - [`handle`]: entity/handle bijection and buffer pinning
//! - [`token`]: token resolution, including runtime-determined forms
//! - [`query`]: attribute, layout, GC-tracing, and type-relation queries
//! - [`callsite`]: call-site resolution (direct, v-table, interface stub,
//!   dispatch-by-handle, fat pointer)
//! - [`lookup`]: compile-time-constant vs runtime-dictionary decisions
//! - [`assembly`]: buffers, relocations, exception/frame/GC metadata,
//!   artifact packaging
//! - [`lifecycle`]: one-method orchestration, error translation, scoped
//!   cleanup

pub mod assembly;
pub mod backend;
pub mod callsite;
pub mod config;
pub mod error;
pub mod handle;
pub mod helpers;
pub mod lifecycle;
pub mod lookup;
pub mod query;
pub mod symbol;
pub mod token;

pub use assembly::{
    BufferKind, BufferRequest, EhClause, EhClauseKind, FrameRecord, FuncRegion, MethodArtifact,
    RelocKind, RelocTarget, Relocation,
};
pub use backend::{
    BackendError, CodegenBackend, CompilationEnv, EhClauseSpec, EhClauseSpecKind, FieldInfo,
    NullBackend, RelocTargetRef, TokenInfo, TokenKind,
};
pub use callsite::{CallDescriptor, CallKind, CallSiteRequest, ThisTransform};
pub use config::{BridgeConfig, CastPolicy};
pub use error::CompileError;
pub use handle::{Handle, HandleArena, PinnedSlice};
pub use helpers::{HelperId, HelperSymbolCache};
pub use lifecycle::{BridgeState, JitBridge};
pub use lookup::{LookupDescriptor, LookupKind, ResourceKind, RuntimeLookup};
pub use query::{GcSlot, TriState, TypeQueryEngine};
pub use symbol::Symbol;
pub use token::{ResolvedToken, TokenResolver};
