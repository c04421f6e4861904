use std::future::Future;

use serde::{Deserialize, Serialize};

/// Actor recorded when no identity was propagated.
pub const UNKNOWN_ACTOR: &str = "unknown-actor";

tokio::task_local! {
    static CURRENT_ACTOR: ActorId;
}

/// Identity of whoever caused a change (user, service account, ...).
///
/// Opaque string; the auth layer decides its format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_ACTOR.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl core::fmt::Display for ActorId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ActorId> for String {
    fn from(value: ActorId) -> Self {
        value.0
    }
}

/// Run `fut` with `actor` as the current identity.
///
/// The identity is visible to everything awaited inside `fut` on the same
/// task; spawned tasks must be wrapped again.
pub async fn with_actor<F>(actor: ActorId, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_ACTOR.scope(actor, fut).await
}

/// Identity propagated to the current task, if any.
pub fn current_actor() -> Option<ActorId> {
    CURRENT_ACTOR
        .try_with(|actor| actor.clone())
        .ok()
        .filter(|actor| !actor.is_empty())
}

/// Actor to stamp on an outbound message.
///
/// An explicit, non-empty `explicit` wins; otherwise the propagated identity;
/// otherwise [`UNKNOWN_ACTOR`].
pub fn resolve_actor(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    current_actor()
        .map(String::from)
        .unwrap_or_else(|| UNKNOWN_ACTOR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_scope_means_no_actor() {
        assert_eq!(current_actor(), None);
        assert_eq!(resolve_actor(""), UNKNOWN_ACTOR);
    }

    #[test]
    fn unknown_actor_default_is_stable() {
        let first = resolve_actor("");
        let second = resolve_actor("");
        assert_eq!(first, second);
        assert_eq!(first, "unknown-actor");
    }

    #[tokio::test]
    async fn scoped_actor_is_visible() {
        let actor = ActorId::new("idntusr-abc123");
        let seen = with_actor(actor.clone(), async { current_actor() }).await;
        assert_eq!(seen, Some(actor));
    }

    #[tokio::test]
    async fn explicit_actor_beats_scope() {
        let resolved = with_actor(ActorId::new("idntusr-scope"), async {
            resolve_actor("idntusr-explicit")
        })
        .await;
        assert_eq!(resolved, "idntusr-explicit");
    }

    #[tokio::test]
    async fn empty_scoped_actor_falls_back_to_unknown() {
        let resolved = with_actor(ActorId::new(""), async { resolve_actor("") }).await;
        assert_eq!(resolved, UNKNOWN_ACTOR);
    }
}
