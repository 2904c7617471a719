//! Compilation lifecycle
//!
//! Orchestrates one method compilation end-to-end: validate the body,
//! drive the backend, translate backend failures into host-side error
//! conditions, and guarantee cleanup regardless of outcome. The bridge
//! moves idle → compiling → {published, fallback-published, failed} →
//! idle; per-method state lives in a [`CompilationEnv`] dropped on every
//! exit path, and the state transition back to idle rides a scoped guard.

use std::sync::Arc;

use kiln_types::{Entity, MetadataStore, MethodId};

use crate::assembly::MethodArtifact;
use crate::backend::{BackendError, CodegenBackend, CompilationEnv};
use crate::config::BridgeConfig;
use crate::error::CompileError;
use crate::helpers::HelperSymbolCache;

/// Lifecycle state of a bridge instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Compiling,
}

/// Resets the bridge to idle on every exit path
struct StateGuard<'a> {
    state: &'a mut BridgeState,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.state = BridgeState::Idle;
    }
}

/// One bridge instance: compiles one method at a time against a pluggable
/// backend. Instances are independent; only the helper-symbol cache may
/// be shared between them.
pub struct JitBridge<B> {
    backend: B,
    config: BridgeConfig,
    helper_cache: Arc<HelperSymbolCache>,
    state: BridgeState,
}

impl<B: CodegenBackend> JitBridge<B> {
    /// Create a bridge with default configuration
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, BridgeConfig::default())
    }

    /// Create a bridge with custom configuration
    pub fn with_config(backend: B, config: BridgeConfig) -> Self {
        Self::with_helper_cache(backend, config, Arc::new(HelperSymbolCache::new()))
    }

    /// Create a bridge sharing a helper-symbol cache with other instances
    pub fn with_helper_cache(
        backend: B,
        config: BridgeConfig,
        helper_cache: Arc<HelperSymbolCache>,
    ) -> Self {
        JitBridge {
            backend,
            config,
            helper_cache,
            state: BridgeState::Idle,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn helper_cache(&self) -> &Arc<HelperSymbolCache> {
        &self.helper_cache
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Compile one method and hand back its artifact
    pub fn compile_method(
        &mut self,
        store: &mut MetadataStore,
        method: MethodId,
    ) -> Result<MethodArtifact, CompileError> {
        self.compile(store, method, false)
    }

    /// Compile a substitute (fallback) body for a method whose normal
    /// compilation failed. Only expected conditions propagate; anything
    /// else here is a bridge bug and is wrapped.
    pub fn compile_fallback_body(
        &mut self,
        store: &mut MetadataStore,
        method: MethodId,
    ) -> Result<MethodArtifact, CompileError> {
        self.compile(store, method, true)
    }

    fn compile(
        &mut self,
        store: &mut MetadataStore,
        method: MethodId,
        fallback_body: bool,
    ) -> Result<MethodArtifact, CompileError> {
        assert!(
            self.state == BridgeState::Idle,
            "bridge is already compiling a method"
        );
        self.state = BridgeState::Compiling;
        let _scope = StateGuard {
            state: &mut self.state,
        };

        let name = store.entity_name(Entity::Method(method));
        let mdesc = store.method(method).clone();
        if store.sig(mdesc.sig).is_vararg {
            return Err(CompileError::InvalidProgram {
                method: name,
                reason: "vararg calling convention".to_string(),
            });
        }
        if store.method_body(method).is_none() {
            return Err(CompileError::InvalidProgram {
                method: name,
                reason: "extern method with no implementation".to_string(),
            });
        }

        let mut env = CompilationEnv::new(
            store,
            &self.config,
            &self.helper_cache,
            method,
            fallback_body,
        );
        match self.backend.compile_method(&mut env) {
            // Published: assemble and forward the artifact
            Ok(()) => env.into_artifact(),
            // The backend rejected its own generated output
            Err(BackendError::BadCode(msg)) => Err(CompileError::InvalidProgram {
                method: name,
                reason: format!("backend rejected generated code: {msg}"),
            }),
            Err(other) => match env.take_captured() {
                // Rethrow the original host-side condition; in fallback
                // mode only expected conditions pass through unchanged
                Some(captured) if !fallback_body || captured.expected_in_fallback() => {
                    Err(captured)
                }
                Some(captured) => Err(CompileError::CodeGenFailed {
                    method: name,
                    reason: captured.to_string(),
                }),
                None => Err(CompileError::CodeGenFailed {
                    method: name,
                    reason: other.to_string(),
                }),
            },
        }
        // StateGuard returns the bridge to idle; dropping the env tears
        // down the handle map, pins, buffers, and relocation list.
    }
}
