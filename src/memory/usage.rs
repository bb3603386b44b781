//! Memory-usage accounting across registered components.
//!
//! A statistics view or a "what is eating my RAM" diagnostic wants one
//! number per component, cheap enough to poll every refresh. Components
//! register a name and a byte-count probe; pools register through their
//! handle. Probes must be O(chunks), never O(allocations).

use super::pool::ScopePool;

/// One polled component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageReport {
    pub name: String,
    pub bytes: usize,
}

struct Component {
    name: String,
    probe: Box<dyn Fn() -> usize>,
}

/// Registry of byte-count probes, polled on demand.
///
/// Single-threaded like the pools it reports on; an embedding with multiple
/// workers keeps one registry per worker.
#[derive(Default)]
pub struct UsageRegistry {
    components: Vec<Component>,
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arbitrary component with its byte-count probe.
    pub fn register(&mut self, name: impl Into<String>, probe: impl Fn() -> usize + 'static) {
        self.components.push(Component {
            name: name.into(),
            probe: Box::new(probe),
        });
    }

    /// Register a pool under its own name. The registry holds a cheap
    /// handle clone, not a copy of the pool.
    pub fn register_pool(&mut self, pool: &ScopePool) {
        let handle = pool.clone();
        self.register(pool.name(), move || handle.memory_usage());
    }

    /// Snapshot every registered component, in registration order.
    pub fn poll(&self) -> Vec<UsageReport> {
        self.components
            .iter()
            .map(|c| UsageReport {
                name: c.name.clone(),
                bytes: (c.probe)(),
            })
            .collect()
    }
}

impl std::fmt::Debug for UsageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRegistry")
            .field("components", &self.components.len())
            .finish()
    }
}
