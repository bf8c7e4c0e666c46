//! Live sandbox sessions keyed by owner and project.

use crate::model::SandboxSession;
use dashmap::DashMap;

/// At most one session per project is tracked; inserting replaces the old one.
///
/// Entries are keyed by `(owner_id, project_id)` so a lookup on behalf of
/// one owner never sees a session recorded for another.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<(String, String), SandboxSession>,
}

fn key(owner_id: &str, project_id: &str) -> (String, String) {
    (owner_id.to_string(), project_id.to_string())
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner_id: &str, project_id: &str) -> Option<SandboxSession> {
        self.sessions
            .get(&key(owner_id, project_id))
            .map(|s| s.value().clone())
    }

    /// Track `session` for the project, returning the session it replaced.
    pub fn insert(
        &self,
        owner_id: &str,
        project_id: &str,
        session: SandboxSession,
    ) -> Option<SandboxSession> {
        self.sessions.insert(key(owner_id, project_id), session)
    }

    pub fn remove(&self, owner_id: &str, project_id: &str) -> Option<SandboxSession> {
        self.sessions
            .remove(&key(owner_id, project_id))
            .map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(id: &str) -> SandboxSession {
        let now = Utc::now();
        SandboxSession {
            session_id: id.into(),
            preview_url: None,
            start_time: now,
            end_time: now,
        }
    }

    #[test]
    fn one_session_per_project() {
        let registry = SessionRegistry::new();
        assert!(registry.insert("alice", "p1", session("sb-1")).is_none());
        let replaced = registry.insert("alice", "p1", session("sb-2")).unwrap();
        assert_eq!(replaced.session_id, "sb-1");
        registry.insert("alice", "p2", session("sb-3"));

        assert_eq!(registry.get("alice", "p1").unwrap().session_id, "sb-2");
        assert_eq!(registry.remove("alice", "p2").unwrap().session_id, "sb-3");
        assert!(registry.get("alice", "p2").is_none());
    }

    #[test]
    fn other_owners_do_not_see_the_session() {
        let registry = SessionRegistry::new();
        registry.insert("alice", "p1", session("sb-1"));

        assert!(registry.get("mallory", "p1").is_none());
        assert!(registry.remove("mallory", "p1").is_none());
        assert_eq!(registry.get("alice", "p1").unwrap().session_id, "sb-1");
    }
}
