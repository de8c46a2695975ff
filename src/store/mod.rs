//! Persistent key-value store abstraction.
//!
//! Everything the gateway persists (job records, conversation history,
//! stream buffers) goes through [`KvStore`]. The trait is deliberately
//! small — get/set/delete/scan plus an atomic set-if-absent — so any
//! store with per-key TTL can back it. The in-process [`MemoryStore`]
//! is the default; a networked backend plugs in behind the same trait.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Minimal key-value contract the gateway relies on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a value, replacing any existing one. `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically store a value only if the key is absent.
    ///
    /// Returns `true` when this caller created the key. Across all
    /// concurrent callers exactly one observes `true` — producer
    /// election in the stream multiplexer depends on this.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// List all live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Builds namespaced store keys for one deployment.
///
/// Every key carries the deployment namespace so several gateways can
/// share one store without colliding.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            prefix: namespace.into(),
        }
    }

    /// Key of a job record.
    pub fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Prefix under which all job records live (for sweeping).
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Key of a conversation history.
    pub fn context(&self, context_key: &str) -> String {
        format!("{}:context:{}", self.prefix, context_key)
    }

    /// Key of a stream buffer.
    pub fn buffer(&self, job_id: &str) -> String {
        format!("{}:buffer:{}", self.prefix, job_id)
    }
}
