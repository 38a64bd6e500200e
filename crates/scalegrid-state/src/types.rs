//! Domain types persisted in the coordination store.
//!
//! These types represent scaling policies, the run state of each policy,
//! and silences. All types are JSON-serialized into the `kv` table.
//! Timestamps are Unix epoch milliseconds.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::duration::parse_duration;
use crate::error::ValidationError;

/// Unique identifier for a scaling policy.
pub type PolicyId = String;

/// Unique name of a cluster node.
pub type NodeId = String;

// ── Scaling policy ─────────────────────────────────────────────────

/// A metric-driven scaling policy for one fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    pub id: PolicyId,
    /// Selector for the fleet the actions target.
    pub fleet: String,
    /// Metric query expression, evaluated by the metric source.
    pub query: String,
    /// Scale out when the metric rises above the threshold.
    pub scale_out: Option<ScaleRule>,
    /// Scale in when the metric drops below the threshold.
    pub scale_in: Option<ScaleRule>,
    /// Minimum time between two actions (e.g. "5m").
    pub cooldown: String,
    /// Evaluation interval (e.g. "30s").
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Where and how scale actions are delivered.
    pub action: ActionHttp,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// Threshold and step size for one scaling direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScaleRule {
    pub threshold: f64,
    /// Number of instances to add or remove.
    pub magnitude: u32,
}

/// HTTP action descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionHttp {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub auth: Option<ActionAuth>,
    /// Extra JSON fields sent with the action.
    #[serde(default)]
    pub body: Option<HashMap<String, serde_json::Value>>,
    /// Total attempts, including the first one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base delay between attempts (e.g. "100ms").
    #[serde(default = "default_delay")]
    pub delay: String,
    #[serde(default)]
    pub delay_type: DelayType,
}

/// Credentials attached to an action request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionAuth {
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// Delay strategy between dispatch attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelayType {
    #[default]
    Fixed,
    Backoff,
}

fn default_interval() -> String {
    "30s".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_delay() -> String {
    "100ms".to_string()
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

impl ScalingPolicy {
    /// Check every field. A policy that fails validation is never stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_id("policy id", &self.id)?;
        if self.fleet.trim().is_empty() {
            return Err(ValidationError::Empty("fleet"));
        }
        if self.query.trim().is_empty() {
            return Err(ValidationError::Empty("query"));
        }

        if self.scale_out.is_none() && self.scale_in.is_none() {
            return Err(ValidationError::invalid(
                "rules",
                "at least one of scale_out or scale_in is required",
            ));
        }
        for (field, rule) in [("scale_out", self.scale_out), ("scale_in", self.scale_in)] {
            if let Some(rule) = rule {
                if !rule.threshold.is_finite() {
                    return Err(ValidationError::invalid(field, "threshold must be finite"));
                }
                if rule.magnitude == 0 {
                    return Err(ValidationError::invalid(field, "magnitude must be positive"));
                }
            }
        }
        if let (Some(out), Some(inn)) = (self.scale_out, self.scale_in)
            && inn.threshold >= out.threshold
        {
            return Err(ValidationError::invalid(
                "scale_in",
                "threshold must be below the scale_out threshold",
            ));
        }

        self.cooldown_duration()?;
        if self.interval_duration()?.is_zero() {
            return Err(ValidationError::invalid("interval", "must be positive"));
        }
        self.action.validate()
    }

    pub fn cooldown_duration(&self) -> Result<Duration, ValidationError> {
        parse_duration(&self.cooldown).map_err(|e| ValidationError::invalid("cooldown", e))
    }

    pub fn interval_duration(&self) -> Result<Duration, ValidationError> {
        parse_duration(&self.interval).map_err(|e| ValidationError::invalid("interval", e))
    }
}

impl ActionHttp {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.trim().is_empty() {
            return Err(ValidationError::Empty("action.url"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ValidationError::invalid(
                "action.url",
                "must be an http:// or https:// URL",
            ));
        }
        const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];
        if !METHODS.contains(&self.method.to_ascii_uppercase().as_str()) {
            return Err(ValidationError::invalid(
                "action.method",
                format!("unsupported method {}", self.method),
            ));
        }
        if self.attempts == 0 {
            return Err(ValidationError::invalid("action.attempts", "must be at least 1"));
        }
        self.delay_duration()?;
        match &self.auth {
            Some(ActionAuth::ApiKey { header, key }) if header.is_empty() || key.is_empty() => {
                Err(ValidationError::Empty("action.auth api key"))
            }
            Some(ActionAuth::Basic { username, .. }) if username.is_empty() => {
                Err(ValidationError::Empty("action.auth username"))
            }
            _ => Ok(()),
        }
    }

    pub fn delay_duration(&self) -> Result<Duration, ValidationError> {
        parse_duration(&self.delay).map_err(|e| ValidationError::invalid("action.delay", e))
    }
}

/// Ids become store keys and URL path segments.
fn validate_id(field: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::invalid(
            field,
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ));
    }
    Ok(())
}

// ── Run state ──────────────────────────────────────────────────────

/// Scaling direction of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    ScaleOut,
    ScaleIn,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ScaleOut => f.write_str("scale-out"),
            Direction::ScaleIn => f.write_str("scale-in"),
        }
    }
}

/// Where a policy's evaluation loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Evaluating,
    NoAction,
    Cooling,
    Acting,
}

/// Result of the most recent action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Recorded before dispatch; the action may or may not have been sent.
    Pending,
    Succeeded,
    Failed { error: String },
    Silenced { silence_id: String },
}

/// One scale action taken (or suppressed) for a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action identity, `{fleet}/{policy}/{direction}`.
    pub id: String,
    pub direction: Direction,
    pub magnitude: u32,
    pub outcome: ActionOutcome,
    pub at: u64,
}

/// Per-policy evaluation state. Written only by the lease holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub policy_id: PolicyId,
    /// Node that wrote this state.
    pub owner: NodeId,
    pub phase: Phase,
    pub last_evaluated_at: Option<u64>,
    pub last_value: Option<f64>,
    /// No action may be taken before this instant.
    pub cooldown_until: Option<u64>,
    pub last_action: Option<ActionRecord>,
}

impl RunState {
    pub fn new(policy_id: &str, owner: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            owner: owner.to_string(),
            phase: Phase::Idle,
            last_evaluated_at: None,
            last_value: None,
            cooldown_until: None,
            last_action: None,
        }
    }

    /// Whether the cooldown window is still open at `now_ms`.
    pub fn cooling(&self, now_ms: u64) -> bool {
        self.cooldown_until.is_some_and(|until| now_ms < until)
    }
}

// ── Silence ────────────────────────────────────────────────────────

/// Temporary suppression of actions whose identity matches `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Regular expression matched against action identities.
    pub pattern: String,
    /// Lifetime, e.g. "1h".
    pub ttl: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub expired_at: u64,
}

impl Silence {
    /// Validate the silence and stamp its timestamps and derived id.
    pub fn validate(&mut self, now_ms: u64) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::Empty("silence name"));
        }
        if self.pattern.is_empty() {
            return Err(ValidationError::Empty("silence pattern"));
        }
        if self.ttl.is_empty() {
            return Err(ValidationError::Empty("silence ttl"));
        }
        Regex::new(&self.pattern).map_err(|e| ValidationError::invalid("silence pattern", e))?;
        let ttl = parse_duration(&self.ttl).map_err(|e| ValidationError::invalid("silence ttl", e))?;

        let expired_at = u64::try_from(ttl.as_millis())
            .ok()
            .and_then(|ttl_ms| now_ms.checked_add(ttl_ms))
            .ok_or_else(|| ValidationError::invalid("silence ttl", "expiry is out of range"))?;
        self.created_at = now_ms;
        self.expired_at = expired_at;
        self.id = silence_id(&self.pattern, self.expired_at);
        Ok(())
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expired_at
    }
}

/// Content hash identity of a silence.
fn silence_id(pattern: &str, expired_at: u64) -> String {
    let digest = Sha256::digest(format!("{pattern}-{expired_at}").as_bytes());
    hex::encode(digest)
}
