//! scalegrid-autoscale — the per-policy reconciliation loop.
//!
//! For every policy this node owns, a worker queries the policy's metric
//! on a timer, compares it against the scale-out and scale-in thresholds,
//! and dispatches a scale action unless the policy is cooling down or the
//! action is silenced.
//!
//! # Cycle
//!
//! ```text
//! value = metrics.query(policy.query)
//!
//! value > scale_out.threshold → ScaleOut(scale_out.magnitude)
//! value < scale_in.threshold  → ScaleIn(scale_in.magnitude)
//!
//! inside cooldown        → Cooling, nothing sent
//! silence matches action → Silenced, nothing sent, no cooldown
//! otherwise              → persist Pending + cooldown_until
//!                          dispatch with retry
//!                          persist Succeeded | Failed, Cooling
//! ```
//!
//! Action identity is `{fleet}/{policy}/{direction}`; silences match it.

pub mod action;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod silence;

pub use action::{ActionExecutor, ActionRequest, HttpActionExecutor, action_id};
pub use error::{ActionError, MetricError, MetricResult};
pub use evaluator::{Decision, evaluate};
pub use manager::AutoscaleManager;
pub use metrics::{MetricSource, PrometheusSource};
pub use retry::{RetryPolicy, retry};
pub use silence::SilenceSet;
