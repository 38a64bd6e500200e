//! Threshold evaluation.
//!
//! ```text
//! value > scale_out.threshold  →  scale out by scale_out.magnitude
//! value < scale_in.threshold   →  scale in by scale_in.magnitude
//! otherwise                    →  no action
//! ```
//!
//! A crossing inside the cooldown window yields `Cooling` instead.

use scalegrid_state::{Direction, RunState, ScalingPolicy};

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    NoAction,
    /// A threshold was crossed but the last action is too recent.
    Cooling { until: u64 },
    Scale { direction: Direction, magnitude: u32 },
}

/// Compare `value` against the policy's thresholds.
pub fn evaluate(policy: &ScalingPolicy, value: f64, state: &RunState, now_ms: u64) -> Decision {
    if !value.is_finite() {
        return Decision::NoAction;
    }
    let wanted = match (&policy.scale_out, &policy.scale_in) {
        (Some(out), _) if value > out.threshold => Some((Direction::ScaleOut, out.magnitude)),
        (_, Some(inn)) if value < inn.threshold => Some((Direction::ScaleIn, inn.magnitude)),
        _ => None,
    };
    let Some((direction, magnitude)) = wanted else {
        return Decision::NoAction;
    };
    match state.cooldown_until {
        Some(until) if now_ms < until => Decision::Cooling { until },
        _ => Decision::Scale {
            direction,
            magnitude,
        },
    }
}
