//! Per-descriptor connection pool.
//!
//! "Connection" here is the resolved `McpTransport` plus any warm state the
//! client wants to keep (currently none beyond the shared `reqwest::Client`,
//! since HTTP/SSE transports are already connectionless at this layer —
//! but the pool still exists to satisfy the invalidation contract: pool
//! entries are keyed by `(descriptor_id, version)`, so a config edit that
//! bumps the version counter transparently discards stale entries on next
//! acquire, and idle entries are evicted after a TTL.
//!
//! Grounded on the MCP registry's version-counter invalidation rule and the
//! teacher's reuse of one shared `McpClient` across requests
//! (`mcp_client.clone()` in `routes::mcp_proxy::handle_mcp_request`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::types::McpTransport;

#[derive(Clone, Copy, Hash, PartialEq, Eq)]
struct PoolKey {
    descriptor_id: Uuid,
    version: i64,
}

struct PoolEntry {
    transport: McpTransport,
    last_used: Instant,
}

const IDLE_EVICTION: Duration = Duration::from_secs(300);

/// Bounded by the number of distinct `(descriptor, version)` pairs seen
/// recently; idle entries older than [`IDLE_EVICTION`] are dropped on the
/// next sweep rather than held forever.
pub struct ConnectionPool {
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the pooled transport for this descriptor version, inserting
    /// `build` if it's the first acquire (or the version changed and the
    /// old entry was already discarded).
    pub fn acquire_or_insert_with(
        &self,
        descriptor_id: Uuid,
        version: i64,
        build: impl FnOnce() -> McpTransport,
    ) -> McpTransport {
        let key = PoolKey {
            descriptor_id,
            version,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        // Any stale version for this descriptor is no longer reachable
        // once a fresh key is requested; drop it so the map doesn't grow
        // unboundedly across config edits.
        entries.retain(|k, _| k.descriptor_id != descriptor_id || k.version == version);

        let entry = entries.entry(key).or_insert_with(|| PoolEntry {
            transport: build(),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        entry.transport.clone()
    }

    pub fn sweep_idle(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.last_used.elapsed() < IDLE_EVICTION);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transport() -> McpTransport {
        McpTransport::Http {
            endpoint_url: "https://example.test/mcp".to_string(),
            auth: super::super::types::McpAuth::None,
        }
    }

    #[test]
    fn acquiring_same_version_twice_reuses_entry() {
        let pool = ConnectionPool::new();
        let id = Uuid::new_v4();
        let mut build_calls = 0;
        pool.acquire_or_insert_with(id, 1, || {
            build_calls += 1;
            sample_transport()
        });
        pool.acquire_or_insert_with(id, 1, || {
            build_calls += 1;
            sample_transport()
        });
        assert_eq!(build_calls, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn version_bump_discards_stale_entry() {
        let pool = ConnectionPool::new();
        let id = Uuid::new_v4();
        pool.acquire_or_insert_with(id, 1, sample_transport);
        assert_eq!(pool.len(), 1);
        pool.acquire_or_insert_with(id, 2, sample_transport);
        assert_eq!(pool.len(), 1);
    }
}
