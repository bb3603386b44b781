pub(crate) mod canary;
pub(crate) mod chunk;
pub(crate) mod pool;
pub(crate) mod scopes;
pub(crate) mod stats;
pub(crate) mod strings;
pub(crate) mod usage;
pub(crate) mod vm;
