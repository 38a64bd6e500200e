//! scalegrid-coord — per-policy ownership on top of the coordination store.
//!
//! Membership (from `scalegrid-cluster`) only tells a node who is around.
//! Who runs a policy is decided by the store: the holder of the lease-scoped
//! key `locks/<policy>` owns it, and the store's compare-and-swap is the
//! only tie-break.
//!
//! # Architecture
//!
//! - **`adapter`** — `CoordinationAdapter`: acquire / renew / release
//!   leases, owner-guarded run-state writes, typed loads
//! - **`watch`** — `PrefixWatch`: restartable change stream over a prefix
//! - **`resolver`** — `OwnershipResolver`: the single task that acquires,
//!   renews and gives up leases and starts or stops workers accordingly

pub mod adapter;
pub mod error;
pub mod resolver;
pub mod watch;

pub use adapter::{CoordConfig, CoordinationAdapter, LeaseOutcome};
pub use error::{CoordError, CoordResult};
pub use resolver::{Ownership, OwnershipResolver, PolicyRunner};
pub use watch::PrefixWatch;
