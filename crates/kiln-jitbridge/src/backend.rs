//! Backend protocol: the compile entry point and the callback surface
//!
//! The backend compiles one method at a time and knows nothing about the
//! host object model. It receives a [`CompilationEnv`] — the fixed set of
//! query/command entry points it may call back into synchronously — and
//! returns success or a [`BackendError`]. Every argument and result shape
//! here is a stable contract; a query outside the implemented surface
//! fails loudly instead of returning a plausible-looking wrong answer.

use thiserror::Error;

use kiln_types::{Entity, FieldId, MetadataStore, MethodId, TypeId};

use crate::assembly::{
    AllocatedBuffers, BufferKind, BufferRequest, CodeAssembly, EhClause, EhClauseKind, FuncRegion,
    MethodArtifact, RelocKind, RelocTarget,
};
use crate::callsite::{resolve_call, CallDescriptor, CallSiteRequest};
use crate::config::BridgeConfig;
use crate::error::CompileError;
use crate::handle::{Handle, HandleArena, PinnedSlice};
use crate::helpers::{HelperId, HelperSymbolCache};
use crate::lookup::{compute_lookup, constant_lookup, LookupDescriptor, ResourceKind};
use crate::query::{TriState, TypeQueryEngine};
use crate::symbol::Symbol;
use crate::token::TokenResolver;

/// Errors the backend reports from its compile entry point
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// The backend rejected its own generated output
    #[error("backend rejected its generated code: {0}")]
    BadCode(String),
    /// A bridge callback failed; the condition is captured in the
    /// environment and rethrown by the lifecycle
    #[error("backend aborted after a bridge callback failed")]
    Aborted,
    /// Any other backend failure
    #[error("backend failure: {0}")]
    Internal(String),
}

/// A pluggable native code generator
pub trait CodegenBackend {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Compile the environment's method, calling back into `env` for
    /// every query and buffer operation.
    fn compile_method(&self, env: &mut CompilationEnv<'_>) -> Result<(), BackendError>;
}

/// Classification of a resolved token for the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Type,
    Method,
    Field,
}

/// Result shape of a token resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub kind: TokenKind,
    pub handle: Handle,
    /// Handle of the runtime-determined form (equals `handle` outside
    /// shared code)
    pub runtime_handle: Handle,
}

/// Result shape of a field-by-position lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub handle: Handle,
    pub offset: u32,
    pub type_handle: Handle,
    pub is_static: bool,
}

/// How the backend names a relocation target
#[derive(Debug, Clone, Copy)]
pub enum RelocTargetRef {
    /// A raw address: inside one of the method's own buffers, a handle
    /// previously issued by this compilation, or a pinned buffer
    Address(usize),
    /// A symbol taken from a call descriptor or lookup
    Symbol(Symbol),
}

/// Backend-side exception clause, before symbol resolution
#[derive(Debug, Clone, Copy)]
pub enum EhClauseSpecKind {
    /// Catch of the type behind the handle
    Typed(Handle),
    Filter { filter_offset: u32 },
    Finally,
    Fault,
}

/// One exception clause as the backend reports it
#[derive(Debug, Clone, Copy)]
pub struct EhClauseSpec {
    pub kind: EhClauseSpecKind,
    pub try_offset: u32,
    pub try_len: u32,
    pub handler_offset: u32,
    pub handler_len: u32,
}

/// Per-compilation state and the backend's callback surface.
///
/// Owns the handle arena, token cache, query engine, and assembly for
/// exactly one method. Dropped (and therefore torn down) on every exit
/// path of the compilation.
pub struct CompilationEnv<'a> {
    store: &'a mut MetadataStore,
    config: &'a BridgeConfig,
    helper_cache: &'a HelperSymbolCache,
    method: MethodId,
    fallback_body: bool,
    arena: HandleArena,
    resolver: TokenResolver,
    queries: TypeQueryEngine,
    assembly: CodeAssembly,
    captured: Option<CompileError>,
}

impl<'a> CompilationEnv<'a> {
    pub(crate) fn new(
        store: &'a mut MetadataStore,
        config: &'a BridgeConfig,
        helper_cache: &'a HelperSymbolCache,
        method: MethodId,
        fallback_body: bool,
    ) -> Self {
        CompilationEnv {
            store,
            config,
            helper_cache,
            method,
            fallback_body,
            arena: HandleArena::new(),
            resolver: TokenResolver::new(),
            queries: TypeQueryEngine::new(),
            assembly: CodeAssembly::new(),
            captured: None,
        }
    }

    fn capture<T>(&mut self, r: Result<T, CompileError>) -> Result<T, BackendError> {
        r.map_err(|e| {
            self.captured = Some(e);
            BackendError::Aborted
        })
    }

    pub(crate) fn take_captured(&mut self) -> Option<CompileError> {
        self.captured.take()
    }

    pub(crate) fn into_artifact(mut self) -> Result<MethodArtifact, CompileError> {
        let name = self.method_name();
        self.assembly.finish(name)
    }

    // -------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------

    /// The method being compiled
    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn method_name(&self) -> String {
        self.store.entity_name(Entity::Method(self.method))
    }

    /// Handle of the method being compiled
    pub fn method_handle(&mut self) -> Handle {
        self.arena.to_handle(Entity::Method(self.method))
    }

    /// True in fallback/substitute-body compilation mode
    pub fn is_fallback_body(&self) -> bool {
        self.fallback_body
    }

    /// Map an entity handle back; panics on a handle this compilation
    /// never issued.
    pub fn entity(&self, handle: Handle) -> Entity {
        self.arena.entity(handle)
    }

    /// Map an entity to its opaque handle
    pub fn to_handle(&mut self, entity: Entity) -> Handle {
        self.arena.to_handle(entity)
    }

    /// A backend query this bridge does not implement. Never returns.
    pub fn unsupported(&self, what: &str) -> ! {
        panic!("unsupported backend query: {what}");
    }

    fn expect_type(&self, handle: Handle) -> TypeId {
        match self.arena.entity(handle) {
            Entity::Type(t) => t,
            e => panic!("expected a type handle, got a {} handle", e.kind_name()),
        }
    }

    fn expect_method(&self, handle: Handle) -> MethodId {
        match self.arena.entity(handle) {
            Entity::Method(m) => m,
            e => panic!("expected a method handle, got a {} handle", e.kind_name()),
        }
    }

    fn expect_field(&self, handle: Handle) -> FieldId {
        match self.arena.entity(handle) {
            Entity::Field(f) => f,
            e => panic!("expected a field handle, got a {} handle", e.kind_name()),
        }
    }

    // -------------------------------------------------------------------
    // Token resolution
    // -------------------------------------------------------------------

    /// Resolve a token of the compiled method's body
    pub fn resolve_token(&mut self, token: u32) -> Result<TokenInfo, BackendError> {
        let r = self.resolver.resolve(self.store, self.method, token);
        let resolved = self.capture(r)?;
        let kind = match resolved.entity {
            Entity::Type(_) => TokenKind::Type,
            Entity::Method(_) => TokenKind::Method,
            Entity::Field(_) => TokenKind::Field,
            e => {
                let err = CompileError::InvalidProgram {
                    method: self.method_name(),
                    reason: format!("token {token:#010x} names a {}", e.kind_name()),
                };
                return self.capture(Err(err));
            }
        };
        Ok(TokenInfo {
            kind,
            handle: self.arena.to_handle(resolved.entity),
            runtime_handle: self.arena.to_handle(resolved.runtime_entity),
        })
    }

    // -------------------------------------------------------------------
    // Type and member queries
    // -------------------------------------------------------------------

    /// Class attribute flag word
    pub fn class_attribs(&mut self, handle: Handle) -> u32 {
        let t = self.expect_type(handle);
        self.queries.class_attribs(self.store, t)
    }

    /// Method attribute flag word
    pub fn method_attribs(&self, handle: Handle) -> u32 {
        let m = self.expect_method(handle);
        self.queries.method_attribs(self.store, m)
    }

    /// Byte size of the type's instance data
    pub fn instance_size(&mut self, handle: Handle) -> Result<u32, BackendError> {
        let t = self.expect_type(handle);
        let r = self.queries.instance_size(self.store, t);
        self.capture(r)
    }

    /// Byte size of the type as a field or array element
    pub fn element_size(&mut self, handle: Handle) -> Result<u32, BackendError> {
        let t = self.expect_type(handle);
        let r = self.queries.element_size(self.store, t);
        self.capture(r)
    }

    /// Alignment of the type as a field or array element
    pub fn alignment(&mut self, handle: Handle) -> Result<u32, BackendError> {
        let t = self.expect_type(handle);
        let r = self.queries.alignment(self.store, t);
        self.capture(r)
    }

    /// Number of instance fields, inherited included
    pub fn instance_field_count(&self, handle: Handle) -> u32 {
        let t = self.expect_type(handle);
        self.queries.instance_field_count(self.store, t)
    }

    /// Zero-based instance-field lookup (statics and literals skipped)
    pub fn field_by_index(&mut self, handle: Handle, index: u32) -> Option<FieldInfo> {
        let t = self.expect_type(handle);
        let f = self.queries.field_by_index(self.store, t, index)?;
        let fdesc = self.store.field(f);
        let (offset, ty, is_static) = (fdesc.offset, fdesc.ty, fdesc.flags.is_static);
        Some(FieldInfo {
            handle: self.arena.to_handle(Entity::Field(f)),
            offset,
            type_handle: self.arena.to_handle(Entity::Type(ty)),
            is_static,
        })
    }

    /// Byte offset of a field within its owner's instance layout
    pub fn field_offset(&self, handle: Handle) -> u32 {
        let f = self.expect_field(handle);
        self.store.field(f).offset
    }

    /// The GC-pointer layout of the type's instance data, one byte per
    /// pointer-sized slot
    pub fn gc_layout(&mut self, handle: Handle) -> Result<Vec<u8>, BackendError> {
        let t = self.expect_type(handle);
        let r = self.queries.gc_layout(self.store, t);
        self.capture(r)
    }

    /// Does the type require lazy static-initialization triggering?
    pub fn has_lazy_static_init(&self, handle: Handle) -> bool {
        let t = self.expect_type(handle);
        self.store.has_lazy_static_init(t)
    }

    /// Image initializer data for an RVA-mapped static field, pinned for
    /// the duration of the compilation
    pub fn field_rva_data(&mut self, handle: Handle) -> Option<PinnedSlice> {
        let f = self.expect_field(handle);
        let data = self.store.field_rva_data(f)?.to_vec();
        Some(self.arena.pin_bytes(data))
    }

    // -------------------------------------------------------------------
    // Type relations
    // -------------------------------------------------------------------

    /// Cast compatibility, definite only when soundly answerable
    pub fn can_cast(&self, from: Handle, to: Handle) -> TriState {
        let (f, t) = (self.expect_type(from), self.expect_type(to));
        self.queries
            .can_cast(self.store, f, t, self.config.cast_policy)
    }

    /// Type equality, definite only when soundly answerable
    pub fn types_equal(&self, a: Handle, b: Handle) -> TriState {
        let (a, b) = (self.expect_type(a), self.expect_type(b));
        self.queries.types_equal(self.store, a, b)
    }

    /// Common-ancestor merge of two stack types
    pub fn merge_types(&mut self, a: Handle, b: Handle) -> Option<Handle> {
        let (a, b) = (self.expect_type(a), self.expect_type(b));
        let merged = self.queries.merge(self.store, a, b)?;
        Some(self.arena.to_handle(Entity::Type(merged)))
    }

    // -------------------------------------------------------------------
    // Call-site resolution and generic lookups
    // -------------------------------------------------------------------

    /// Resolve how to emit a call.
    ///
    /// `caller` is the method containing the call site. Runtime-lookup
    /// recipes are computed only when that is the method being compiled;
    /// for an inline candidate the descriptor carries the canonical
    /// constant symbol instead — an abandoned inline attempt must not
    /// force dictionary computation.
    pub fn call_info(
        &mut self,
        caller: Handle,
        token: u32,
        constraint: Option<Handle>,
        virtual_call: bool,
        materialize_address: bool,
    ) -> Result<CallDescriptor, BackendError> {
        let caller_m = self.expect_method(caller);
        let constraint_t = constraint.map(|h| self.expect_type(h));
        let r = self.resolver.resolve(self.store, caller_m, token);
        let resolved = self.capture(r)?;
        let req = CallSiteRequest {
            method: resolved.entity,
            runtime_method: resolved.runtime_entity,
            constraint: constraint_t,
            virtual_call,
            materialize_address,
        };
        let r = resolve_call(self.store, &mut self.queries, caller_m, &req);
        let mut desc = self.capture(r)?;
        if caller_m != self.method {
            if let LookupDescriptor::Dynamic(_) = desc.lookup {
                let r = self
                    .store
                    .canonical_method(desc.target)
                    .map_err(CompileError::from);
                let canonical = self.capture(r)?;
                desc.lookup = constant_lookup(
                    self.store,
                    Entity::Method(canonical),
                    ResourceKind::MethodEntry,
                );
            }
        }
        Ok(desc)
    }

    /// The lookup descriptor for embedding an entity handle in generated
    /// code
    pub fn embed_handle(
        &mut self,
        token: u32,
        want: ResourceKind,
    ) -> Result<LookupDescriptor, BackendError> {
        let r = self.resolver.resolve(self.store, self.method, token);
        let resolved = self.capture(r)?;
        let r = compute_lookup(
            self.store,
            self.method,
            resolved.entity,
            resolved.runtime_entity,
            want,
        );
        self.capture(r)
    }

    /// Pin a string literal's UTF-16 bytes at a stable address
    pub fn string_literal(&mut self, token: u32) -> Result<PinnedSlice, BackendError> {
        let body = self.store.method_body(self.method);
        let value = body.and_then(|b| b.strings.get(&token)).cloned();
        match value {
            Some(s) => {
                let bytes: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
                Ok(self.arena.pin_bytes(bytes))
            }
            None => {
                let err = CompileError::InvalidProgram {
                    method: self.method_name(),
                    reason: format!("no string literal at token {token:#010x}"),
                };
                self.capture(Err(err))
            }
        }
    }

    /// The output-writer ordinal for a runtime helper
    pub fn helper_ordinal(&self, helper: HelperId) -> u32 {
        self.helper_cache.ordinal(helper)
    }

    /// Render a symbol the way the artifact will name it
    pub fn symbol_name(&self, symbol: Symbol) -> String {
        symbol.describe(self.store)
    }

    // -------------------------------------------------------------------
    // Buffers, relocations, and metadata assembly
    // -------------------------------------------------------------------

    /// Allocate the method's code/data buffers (once per compilation)
    pub fn alloc_buffers(&mut self, req: BufferRequest) -> AllocatedBuffers {
        self.assembly
            .alloc_buffers(req, self.config.pointer_size, self.config.max_rodata_align)
    }

    /// Mutable view of an allocated buffer
    pub fn buffer_mut(&mut self, kind: BufferKind) -> &mut [u8] {
        self.assembly.buffer_mut(kind)
    }

    /// Record a relocation at `at` (which must lie inside one of the
    /// method's buffers).
    ///
    /// An address target inside the method's own buffers becomes a
    /// self-relocation (block + offset); anything else must be a handle
    /// this compilation issued or a pinned buffer, and is resolved to an
    /// external symbol.
    pub fn record_relocation(&mut self, at: usize, kind: RelocKind, target: RelocTargetRef) {
        let resolved = match target {
            RelocTargetRef::Symbol(s) => RelocTarget::External {
                symbol: s.describe(self.store),
            },
            RelocTargetRef::Address(addr) => {
                if let Some((block, offset)) = self.assembly.classify_address(addr) {
                    RelocTarget::Block { block, offset }
                } else if let Some(e) =
                    Handle::from_raw(addr as u64).and_then(|h| self.arena.try_entity(h))
                {
                    RelocTarget::External {
                        symbol: self.entity_symbol(e).describe(self.store),
                    }
                } else if let Some(pin) = self.arena.find_pin(addr) {
                    RelocTarget::External {
                        symbol: Symbol::PinnedLiteral(pin).describe(self.store),
                    }
                } else {
                    panic!(
                        "relocation target {addr:#x} is neither a method buffer, \
                         an issued handle, nor a pinned buffer"
                    );
                }
            }
        };
        self.assembly.record_relocation(at, kind, resolved);
    }

    fn entity_symbol(&self, e: Entity) -> Symbol {
        match e {
            Entity::Type(t) => Symbol::TypeHandle(t),
            Entity::Method(m) => Symbol::MethodEntry(m),
            Entity::Field(f) => Symbol::StaticFieldAddress(f),
            other => panic!("a {} cannot be a relocation target", other.kind_name()),
        }
    }

    /// Install the finalized exception clauses (count fixed by the
    /// buffer request)
    pub fn set_eh_clauses(&mut self, clauses: Vec<EhClauseSpec>) {
        let converted: Vec<EhClause> = clauses
            .into_iter()
            .map(|c| EhClause {
                kind: match c.kind {
                    EhClauseSpecKind::Typed(h) => {
                        let t = self.expect_type(h);
                        EhClauseKind::Typed {
                            class_symbol: Symbol::TypeHandle(t).describe(self.store),
                        }
                    }
                    EhClauseSpecKind::Filter { filter_offset } => {
                        EhClauseKind::Filter { filter_offset }
                    }
                    EhClauseSpecKind::Finally => EhClauseKind::Finally,
                    EhClauseSpecKind::Fault => EhClauseKind::Fault,
                },
                try_offset: c.try_offset,
                try_len: c.try_len,
                handler_offset: c.handler_offset,
                handler_len: c.handler_len,
            })
            .collect();
        self.assembly.set_eh_clauses(converted);
    }

    /// Append frame/unwind info for one function region
    pub fn add_frame_info(&mut self, region: FuncRegion, unwind: Vec<u8>) {
        self.assembly.add_frame_info(region, unwind);
    }

    /// Install the finalized GC-pointer map for the method
    pub fn set_gc_map(&mut self, map: Vec<u8>) {
        self.assembly.set_gc_map(map);
    }
}

/// A backend that emits placeholder trap code. Verifies the bridge
/// end-to-end without a real code generator.
pub struct NullBackend;

impl CodegenBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn compile_method(&self, env: &mut CompilationEnv<'_>) -> Result<(), BackendError> {
        env.alloc_buffers(BufferRequest {
            hot_size: 4,
            ..BufferRequest::default()
        });
        for b in env.buffer_mut(BufferKind::HotCode) {
            *b = 0xCC; // INT3
        }
        env.set_gc_map(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{MethodFlags, PrimitiveKind};

    fn fixture() -> (MetadataStore, BridgeConfig, HelperSymbolCache, MethodId) {
        let mut store = MetadataStore::new(8);
        let object = store.well_known().object;
        let void = store.primitive(PrimitiveKind::Void);
        let m = store.add_method(object, "Main", vec![], void, MethodFlags::default(), 0);
        let body = store.set_body(m, vec![], vec![]);
        store.add_body_string(body, 0x70, "hello");
        (store, BridgeConfig::default(), HelperSymbolCache::new(), m)
    }

    #[test]
    fn test_null_backend_compiles() {
        let (mut store, config, cache, m) = fixture();
        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        NullBackend.compile_method(&mut env).unwrap();
        let artifact = env.into_artifact().unwrap();
        assert_eq!(artifact.hot_code, vec![0xCC; 4]);
    }

    #[test]
    fn test_string_literal_pinned_utf16() {
        let (mut store, config, cache, m) = fixture();
        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        let pin = env.string_literal(0x70).unwrap();
        assert_eq!(pin.len, 10); // 5 UTF-16 code units
        assert_ne!(pin.addr, 0);

        // Unknown literal token is captured as invalid-program
        let err = env.string_literal(0x71).unwrap_err();
        assert_eq!(err, BackendError::Aborted);
        assert!(matches!(
            env.take_captured(),
            Some(CompileError::InvalidProgram { .. })
        ));
    }

    #[test]
    fn test_relocation_against_handle_target() {
        let (mut store, config, cache, m) = fixture();
        let string = store.well_known().string;
        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);

        let addrs = env.alloc_buffers(BufferRequest {
            hot_size: 16,
            ..BufferRequest::default()
        });
        let h = env.to_handle(Entity::Type(string));
        env.record_relocation(
            addrs.hot + 8,
            RelocKind::Abs64,
            RelocTargetRef::Address(h.raw() as usize),
        );
        let artifact = env.into_artifact().unwrap();
        assert_eq!(
            artifact.relocations[0].target,
            RelocTarget::External {
                symbol: "typehandle:String".to_string()
            }
        );
    }

    #[test]
    fn test_relocation_against_pin_target() {
        let (mut store, config, cache, m) = fixture();
        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        let addrs = env.alloc_buffers(BufferRequest {
            hot_size: 16,
            ..BufferRequest::default()
        });
        let pin = env.string_literal(0x70).unwrap();
        env.record_relocation(
            addrs.hot,
            RelocKind::Abs64,
            RelocTargetRef::Address(pin.addr),
        );
        let artifact = env.into_artifact().unwrap();
        assert_eq!(
            artifact.relocations[0].target,
            RelocTarget::External {
                symbol: "literal:0".to_string()
            }
        );
    }

    #[test]
    fn test_field_rva_data_pinned() {
        let (mut store, config, cache, m) = fixture();
        let object = store.well_known().object;
        let i32t = store.primitive(PrimitiveKind::I32);
        let f = store.add_field(
            object,
            "Table",
            i32t,
            kiln_types::FieldFlags {
                is_static: true,
                has_rva: true,
                ..kiln_types::FieldFlags::default()
            },
            None,
        );
        store.set_rva_data(f, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        let h = env.to_handle(Entity::Field(f));
        let pin = env.field_rva_data(h).unwrap();
        assert_eq!(pin.len, 4);
        assert_ne!(pin.addr, 0);
    }

    #[test]
    #[should_panic(expected = "expected a type handle")]
    fn test_kind_confused_handle_panics() {
        let (mut store, config, cache, m) = fixture();
        let mut env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        let h = env.method_handle();
        let _ = env.class_attribs(h);
    }

    #[test]
    #[should_panic(expected = "unsupported backend query")]
    fn test_unsupported_query_panics() {
        let (mut store, config, cache, m) = fixture();
        let env = CompilationEnv::new(&mut store, &config, &cache, m, false);
        env.unsupported("getVarArgsHandle");
    }
}
