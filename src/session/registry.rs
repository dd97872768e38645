//! Live sessions keyed by client id

use std::sync::Arc;

use dashmap::DashMap;

use super::Session;

/// Maps client ids to their live sessions
///
/// At most one live session exists per client id on this broker.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Arc<str>, Arc<Session>, ahash::RandomState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, returning the session it replaced
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.client_id().clone(), session)
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    /// Remove the entry for `client_id` only if it still belongs to `session_id`
    ///
    /// A session that was taken over must not unregister its successor.
    pub fn remove_if(&self, client_id: &str, session_id: u64) -> bool {
        self.sessions
            .remove_if(client_id, |_, s| s.session_id() == session_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all live sessions
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolVersion;
    use crate::queue::TransientQueue;
    use crate::session::SessionInfo;

    fn session(client_id: &str, session_id: u64) -> Arc<Session> {
        let client_id: Arc<str> = Arc::from(client_id);
        let info = SessionInfo {
            client_id: client_id.clone(),
            session_id,
            broker_id: Arc::from("test"),
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            keep_alive: 0,
            username: None,
        };
        let queue = Arc::new(TransientQueue::new(client_id, 8));
        Arc::new(Session::new(info, queue, None, 8).0)
    }

    #[test]
    fn test_register_replaces_previous() {
        let registry = SessionRegistry::new();
        assert!(registry.register(session("c1", 1)).is_none());

        let old = registry.register(session("c1", 2)).unwrap();
        assert_eq!(old.session_id(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("c1").unwrap().session_id(), 2);
    }

    #[test]
    fn test_remove_if_ignores_stale_session() {
        let registry = SessionRegistry::new();
        registry.register(session("c1", 1));
        registry.register(session("c1", 2));

        assert!(!registry.remove_if("c1", 1));
        assert!(registry.get("c1").is_some());
        assert!(registry.remove_if("c1", 2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_snapshots_sessions() {
        let registry = SessionRegistry::new();
        registry.register(session("a", 1));
        registry.register(session("b", 2));
        let mut ids: Vec<_> = registry.all().iter().map(|s| s.client_id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
