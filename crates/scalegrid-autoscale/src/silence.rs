//! Silence matching.

use regex::Regex;
use scalegrid_state::Silence;
use tracing::warn;

/// Silences with their patterns compiled, ready to test action ids.
#[derive(Debug, Default)]
pub struct SilenceSet {
    entries: Vec<(Silence, Regex)>,
}

impl SilenceSet {
    /// Compile every silence. A pattern that fails to compile is skipped;
    /// stored silences were validated, so this only happens on tampering.
    pub fn new(silences: impl IntoIterator<Item = Silence>) -> Self {
        let mut entries = Vec::new();
        for silence in silences {
            match Regex::new(&silence.pattern) {
                Ok(re) => entries.push((silence, re)),
                Err(e) => warn!(silence_id = %silence.id, error = %e, "skipping silence with bad pattern"),
            }
        }
        Self { entries }
    }

    /// First unexpired silence whose pattern matches anywhere in `action_id`.
    pub fn matching(&self, action_id: &str, now_ms: u64) -> Option<&Silence> {
        self.entries
            .iter()
            .find(|(silence, re)| silence.is_active(now_ms) && re.is_match(action_id))
            .map(|(silence, _)| silence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(pattern: &str, ttl: &str, now: u64) -> Silence {
        let mut s = Silence {
            id: String::new(),
            name: "maintenance".into(),
            pattern: pattern.into(),
            ttl: ttl.into(),
            tags: vec![],
            description: String::new(),
            created_at: 0,
            expired_at: 0,
        };
        s.validate(now).unwrap();
        s
    }

    #[test]
    fn matches_unanchored_until_expiry() {
        let set = SilenceSet::new([silence("web/.*/scale-out", "10m", 0)]);
        assert!(set.matching("web/p1/scale-out", 1_000).is_some());
        assert!(set.matching("web/p1/scale-in", 1_000).is_none());
        assert!(set.matching("db/p1/scale-out", 1_000).is_none());
        // Patterns are unanchored.
        assert!(set.matching("eu-web/p1/scale-out-now", 1_000).is_some());

        assert!(set.matching("web/p1/scale-out", 10 * 60_000).is_none());
    }

    #[test]
    fn bad_patterns_are_skipped() {
        let mut broken = silence("x", "1m", 0);
        broken.pattern = "(".into();
        let set = SilenceSet::new([broken, silence("^api/", "1m", 0)]);
        assert_eq!(set.len(), 1);
        assert!(set.matching("api/p1/scale-in", 10).is_some());
    }
}
