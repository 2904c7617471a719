//! Bridge configuration

/// How definite negative answers to cast and equality queries are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastPolicy {
    /// Report every definite answer the type system can prove
    Exact,
    /// Downgrade definite negative answers to "unknown". Used when types
    /// outside the current compilation unit may gain relationships at
    /// runtime that the compile-time view cannot see.
    VersionBubble,
}

/// Configuration for a bridge instance
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Target pointer width in bytes (default: 8)
    pub pointer_size: u32,
    /// Negative cast/equality answer policy (default: `Exact`)
    pub cast_policy: CastPolicy,
    /// Largest alignment a read-only data buffer may request (default: 16)
    pub max_rodata_align: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            pointer_size: 8,
            cast_policy: CastPolicy::Exact,
            max_rodata_align: 16,
        }
    }
}
