//! Hub agent identifier validation.
//!
//! A `hub_agent_id` is both the lookup key across every subsystem and a
//! path segment on disk, so traversal-hostile input must be rejected at
//! every entry point (save, load, delete, exists).

use crate::error::{Error, Result};

/// Maximum identifier length (exclusive).
pub const MAX_AGENT_ID_LEN: usize = 256;

/// Returns `true` if `id` is a well-formed hub agent identifier:
/// non-empty, shorter than 256 characters, and restricted to
/// `[A-Za-z0-9_-]`.
pub fn is_valid_agent_id(id: &str) -> bool {
    if id.is_empty() || id.len() >= MAX_AGENT_ID_LEN {
        return false;
    }
    id.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Validate an agent identifier, returning a storage error naming the
/// offending id when it is malformed.
pub fn validate_agent_id(id: &str) -> Result<()> {
    if is_valid_agent_id(id) {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid agent id: {id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(is_valid_agent_id("agent-1"));
        assert!(is_valid_agent_id("A_b-C9"));
        assert!(is_valid_agent_id("x"));
    }

    #[test]
    fn rejects_traversal_hostile_ids() {
        assert!(!is_valid_agent_id(""));
        assert!(!is_valid_agent_id(".."));
        assert!(!is_valid_agent_id("a/b"));
        assert!(!is_valid_agent_id("a\\b"));
        assert!(!is_valid_agent_id("a\0b"));
        assert!(!is_valid_agent_id("a b"));
        assert!(!is_valid_agent_id("a.b"));
    }

    #[test]
    fn rejects_overlong_ids() {
        let long = "a".repeat(MAX_AGENT_ID_LEN);
        assert!(!is_valid_agent_id(&long));
        let ok = "a".repeat(MAX_AGENT_ID_LEN - 1);
        assert!(is_valid_agent_id(&ok));
    }
}
