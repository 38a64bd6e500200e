//! Key layout of the coordination store.

pub const POLICIES: &str = "policies/";
pub const LOCKS: &str = "locks/";
pub const RUN_STATE: &str = "runstate/";
pub const SILENCES: &str = "silences/";

pub fn policy(id: &str) -> String {
    format!("{POLICIES}{id}")
}

pub fn lock(policy_id: &str) -> String {
    format!("{LOCKS}{policy_id}")
}

pub fn run_state(policy_id: &str) -> String {
    format!("{RUN_STATE}{policy_id}")
}

pub fn silence(id: &str) -> String {
    format!("{SILENCES}{id}")
}

/// Strip a known prefix from a key, yielding the record id.
pub fn id_of<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(policy("p1"), "policies/p1");
        assert_eq!(lock("p1"), "locks/p1");
        assert_eq!(run_state("p1"), "runstate/p1");
        assert_eq!(id_of(LOCKS, "locks/p1"), Some("p1"));
        assert_eq!(id_of(LOCKS, "locks/"), None);
        assert_eq!(id_of(LOCKS, "policies/p1"), None);
    }
}
