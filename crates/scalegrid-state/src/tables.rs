//! redb table definitions for the coordination store.
//!
//! All records live in one `kv` table so prefix scans cover the whole key
//! layout. Lease bookkeeping is kept beside it.

use redb::TableDefinition;

/// Every user-visible key, e.g. `policies/p1` → JSON.
pub const KV: TableDefinition<&str, &str> = TableDefinition::new("kv");

/// Lease id → JSON `LeaseRecord`.
pub const LEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("leases");

/// Key → lease id, for keys attached to a lease.
pub const KEY_LEASES: TableDefinition<&str, u64> = TableDefinition::new("key_leases");

/// Counters: `revision`, `next_lease`.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const META_REVISION: &str = "revision";
pub const META_NEXT_LEASE: &str = "next_lease";
