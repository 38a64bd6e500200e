//! scalegrid-state — the coordination store for scalegrid.
//!
//! Every node of a scalegrid cluster shares one transactional key-value
//! store. It holds the durable policy specs, the per-policy run state,
//! silences, and the lease-scoped ownership locks that guarantee a policy
//! is evaluated by at most one node at a time.
//!
//! # Architecture
//!
//! ```text
//! KvStore (async trait)
//!   ├── StateStore   — embedded redb (on-disk or in-memory)
//!   │     ├── kv / leases / key_leases / meta tables
//!   │     └── bounded event log + Notify for long-poll watches
//!   └── RemoteStore  — HTTP client for a StateStore served elsewhere
//!
//! RecordStore (extension trait) — typed JSON records over any KvStore
//! ```
//!
//! Key layout:
//!
//! ```text
//! policies/<policy-id>   ScalingPolicy (JSON)
//! locks/<policy-id>      owner node name, attached to a lease
//! runstate/<policy-id>   RunState (JSON)
//! silences/<silence-id>  Silence (JSON)
//! ```

pub mod clock;
pub mod duration;
pub mod error;
pub mod keys;
pub mod kv;
pub mod records;
pub mod remote;
pub mod store;
pub mod tables;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult, ValidationError};
pub use kv::{EventBatch, EventKind, KvStore, LeaseId, PrefixSnapshot, WatchEvent};
pub use records::RecordStore;
pub use remote::RemoteStore;
pub use store::StateStore;
pub use types::*;
