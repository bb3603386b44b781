//! The two standard allocation scopes of a dissection engine.
//!
//! "Packet" scope lives for one unit of work (one packet dissected);
//! "capture" scope lives for one loaded capture session. The embedding
//! drives the cadence: it calls [`ScopeSet::end_work_unit`] between packets
//! and [`ScopeSet::end_session`] when the capture closes.

use super::pool::{PoolConfig, ScopePool};
use super::usage::UsageRegistry;

/// The packet and capture pools of one engine instance.
///
/// Constructed explicitly and passed where needed; there is no process
/// global. Like the pools it holds, a `ScopeSet` belongs to one thread.
pub struct ScopeSet {
    packet: ScopePool,
    capture: ScopePool,
}

impl ScopeSet {
    /// Build both scopes with debug switches read once from the process
    /// environment. This is the normal startup path.
    pub fn from_env() -> Self {
        Self::with_config(PoolConfig::from_env())
    }

    /// Build both scopes from an explicit configuration.
    pub fn with_config(cfg: PoolConfig) -> Self {
        Self {
            packet: ScopePool::new("packet", cfg.clone()),
            capture: ScopePool::new("capture", cfg),
        }
    }

    /// Scope for allocations that die with the current unit of work.
    pub fn packet(&self) -> &ScopePool {
        &self.packet
    }

    /// Scope for allocations that die with the current session.
    pub fn capture(&self) -> &ScopePool {
        &self.capture
    }

    /// Invalidate everything allocated during the current unit of work.
    ///
    /// # Panics
    ///
    /// Panics if canary verification detects heap corruption.
    pub fn end_work_unit(&self) {
        self.packet.reset_all();
    }

    /// Invalidate everything allocated for the current session. The caller
    /// is expected to have ended the last work unit first; packet-scope
    /// allocations are not touched here.
    ///
    /// # Panics
    ///
    /// Panics if canary verification detects heap corruption.
    pub fn end_session(&self) {
        self.capture.reset_all();
    }

    /// Register both pools with a usage registry.
    pub fn register_usage(&self, registry: &mut UsageRegistry) {
        registry.register_pool(&self.packet);
        registry.register_pool(&self.capture);
    }

    /// Verify canary chains in both scopes and drop the pools, returning
    /// every chunk to the OS. Dropping the set without calling this is
    /// fine too; teardown only adds the final integrity check.
    ///
    /// # Panics
    ///
    /// Panics if canary verification detects heap corruption.
    pub fn teardown(self) {
        self.packet.reset_all();
        self.capture.reset_all();
        tracing::debug!("allocation scopes torn down");
    }
}
