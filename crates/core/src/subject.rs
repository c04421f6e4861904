//! Subject naming.
//!
//! Every subject is `[prefix.]<family>.<segments...>`. The prefix gives
//! environment/tenant isolation without callers having to know about it:
//!
//! ```text
//! [publishPrefix.]changes.<eventType>.<topic>
//! [publishPrefix.]events.<eventType>.<topic>
//! [publishPrefix.]auth.relationships.<action>.<topic>
//! ```
//!
//! Subscribe subjects use the same families under the subscribe prefix, with
//! a caller topic that may contain the broker wildcards `*` and `>`.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Token delimiter used by the broker.
pub const DELIMITER: char = '.';

/// Wildcard matching exactly one token.
pub const WILDCARD_ONE: &str = "*";

/// Wildcard matching one or more trailing tokens.
pub const WILDCARD_TAIL: &str = ">";

/// Hex characters of the subject digest kept in a durable consumer name.
const DURABLE_HASH_LEN: usize = 16;

/// Fixed subject families.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SubjectFamily {
    Changes,
    Events,
    AuthRelationships,
}

impl SubjectFamily {
    fn segments(self) -> &'static [&'static str] {
        match self {
            Self::Changes => &["changes"],
            Self::Events => &["events"],
            Self::AuthRelationships => &["auth", "relationships"],
        }
    }
}

/// A fully-qualified broker subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    /// Join an optional prefix and segments with the broker delimiter.
    ///
    /// Empty prefix and empty segments are skipped, so `join("", ["a", "b"])`
    /// is `a.b`. Prefixes may themselves contain delimiters.
    pub fn join<'a>(prefix: &str, segments: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = String::from(prefix.trim_matches(DELIMITER));
        for segment in segments {
            let segment = segment.trim_matches(DELIMITER);
            if segment.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(DELIMITER);
            }
            out.push_str(segment);
        }
        Self(out)
    }

    /// Subject for publishing `kind` (event type or action) on `topic`.
    ///
    /// Wildcards are rejected: a concrete message needs a concrete subject.
    pub fn publish(prefix: &str, family: SubjectFamily, kind: &str, topic: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        validate_tokens("kind", kind, false)?;
        validate_tokens("topic", topic, false)?;

        let segments = family.segments().iter().copied().chain([kind, topic]);
        Ok(Self::join(prefix, segments))
    }

    /// Subject for subscribing to `topic` within a family.
    pub fn subscribe(prefix: &str, family: SubjectFamily, topic: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        validate_tokens("topic", topic, true)?;

        let segments = family.segments().iter().copied().chain([topic]);
        Ok(Self::join(prefix, segments))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for Subject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Subject> for String {
    fn from(value: Subject) -> Self {
        value.0
    }
}

/// A prefix is optional, but when present it must be literal tokens only.
///
/// Leading and trailing delimiters are tolerated, as [`Subject::join`] trims
/// them.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    let trimmed = prefix.trim_matches(DELIMITER);
    if trimmed.is_empty() {
        return Ok(());
    }
    validate_tokens("prefix", trimmed, false)
}

fn validate_tokens(what: &str, value: &str, allow_wildcards: bool) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }

    let tokens: Vec<&str> = value.split(DELIMITER).collect();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(Error::validation(format!("{what} `{value}` has an empty token")));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!("{what} `{value}` contains whitespace")));
        }

        let is_wildcard = *token == WILDCARD_ONE || *token == WILDCARD_TAIL;
        let has_wildcard_char = token.contains('*') || token.contains('>');
        if has_wildcard_char && !(allow_wildcards && is_wildcard) {
            return Err(Error::validation(format!(
                "{what} `{value}` contains an invalid wildcard"
            )));
        }
        if *token == WILDCARD_TAIL && idx + 1 != tokens.len() {
            return Err(Error::validation(format!(
                "{what} `{value}`: `>` must be the last token"
            )));
        }
    }

    Ok(())
}

/// Whether `subject` is matched by `filter`, honoring `*` and `>`.
pub fn matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split(DELIMITER);
    let mut subject_tokens = subject.split(DELIMITER);

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Deterministic durable consumer name for a queue group on a subject.
///
/// The same `(group, subject)` always yields the same name, so a restarted
/// subscriber resumes the same broker-side cursor. An empty group yields an
/// empty name, meaning the subscription is ephemeral.
pub fn durable_consumer_name(group: &str, subject: &str) -> String {
    if group.is_empty() {
        return String::new();
    }

    let sanitized: String = group
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let digest = hex::encode(Sha256::digest(subject.as_bytes()));
    format!("{sanitized}-{}", &digest[..DURABLE_HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn join_skips_empty_prefix() {
        assert_eq!(Subject::join("", ["changes", "create", "test"]).as_str(), "changes.create.test");
        assert_eq!(
            Subject::join("prod.tenant1", ["changes", "create"]).as_str(),
            "prod.tenant1.changes.create"
        );
        assert_eq!(Subject::join("prefix.", ["", "events"]).as_str(), "prefix.events");
    }

    #[test]
    fn publish_subjects_follow_taxonomy() {
        let s = Subject::publish("com.example", SubjectFamily::Changes, "create", "loadbalancer").unwrap();
        assert_eq!(s.as_str(), "com.example.changes.create.loadbalancer");

        let s = Subject::publish("", SubjectFamily::Events, "ip-address.assigned", "lb").unwrap();
        assert_eq!(s.as_str(), "events.ip-address.assigned.lb");

        let s = Subject::publish("p", SubjectFamily::AuthRelationships, "write", "tenants").unwrap();
        assert_eq!(s.as_str(), "p.auth.relationships.write.tenants");
    }

    #[test]
    fn publish_rejects_wildcards_and_empty_tokens() {
        assert!(Subject::publish("", SubjectFamily::Changes, "", "t").is_err());
        assert!(Subject::publish("", SubjectFamily::Changes, "create", ">").is_err());
        assert!(Subject::publish("", SubjectFamily::Changes, "create", "a..b").is_err());
        assert!(Subject::publish("", SubjectFamily::Events, "with space", "t").is_err());
    }

    #[test]
    fn wildcard_prefix_is_rejected() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("prod.tenant1.").is_ok());
        assert!(validate_prefix("prod.*").is_err());
        assert!(validate_prefix(">").is_err());
        assert!(validate_prefix("a..b").is_err());
        assert!(Subject::publish("prod.>", SubjectFamily::Changes, "create", "lb").is_err());
        assert!(Subject::subscribe("*", SubjectFamily::Events, ">").is_err());
    }

    #[test]
    fn subscribe_accepts_wildcards() {
        let s = Subject::subscribe("com.example", SubjectFamily::Changes, ">").unwrap();
        assert_eq!(s.as_str(), "com.example.changes.>");

        let s = Subject::subscribe("", SubjectFamily::Events, "*.loadbalancer").unwrap();
        assert_eq!(s.as_str(), "events.*.loadbalancer");
    }

    #[test]
    fn subscribe_rejects_misplaced_tail_wildcard() {
        assert!(Subject::subscribe("", SubjectFamily::Changes, ">.test").is_err());
        assert!(Subject::subscribe("", SubjectFamily::Changes, "cre*").is_err());
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("changes.>", "changes.create.test"));
        assert!(matches("changes.*.test", "changes.create.test"));
        assert!(!matches("changes.*.test", "changes.create.other"));
        assert!(!matches("changes.>", "changes"));
        assert!(matches("events.update.lb", "events.update.lb"));
        assert!(!matches("events.update", "events.update.lb"));
    }

    #[test]
    fn durable_name_is_empty_without_group() {
        assert_eq!(durable_consumer_name("", "changes.>"), "");
    }

    #[test]
    fn durable_name_sanitizes_group() {
        let name = durable_consumer_name("lb.api workers", "changes.>");
        assert!(name.starts_with("lb_api_workers-"));
        assert!(!name.contains('.'));
        assert_eq!(name.len(), "lb_api_workers-".len() + DURABLE_HASH_LEN);
    }

    #[test]
    fn durable_name_differs_per_subject() {
        assert_ne!(
            durable_consumer_name("workers", "changes.>"),
            durable_consumer_name("workers", "events.>")
        );
    }

    proptest! {
        #[test]
        fn durable_name_is_pure(group in "[a-z0-9._-]{1,24}", subject in "[a-z.>*]{1,40}") {
            let first = durable_consumer_name(&group, &subject);
            let second = durable_consumer_name(&group, &subject);
            prop_assert_eq!(&first, &second);
            prop_assert!(!first.is_empty());
            prop_assert!(!first.contains('.'));
        }
    }
}
