//! scalegridd — the scalegrid daemon.
//!
//! `scalegridd run` starts a control-plane node: it joins the cluster,
//! competes for policy ownership in the shared coordination store and
//! evaluates the policies it owns. `scalegridd store` hosts that shared
//! store for multi-host clusters.
//!
//! The library half exposes the assembly so integration tests can run
//! several nodes in one process.

pub mod config;
pub mod node;
pub mod store;

pub use config::{FileConfig, NodeConfig, RunArgs, StoreTarget};
pub use node::{Components, Node};
