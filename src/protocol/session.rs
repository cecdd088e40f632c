//! Logical sessions multiplexed over one physical connection.

use std::sync::Arc;

use dashmap::DashMap;

use super::header::Attributes;

/// A negotiated session: supplies default plugin ids for its messages.
#[derive(Debug)]
pub struct Session {
    id: i32,
    serialization: u8,
    compression: u8,
    attributes: Attributes,
}

impl Session {
    pub fn new(id: i32, serialization: u8, compression: u8) -> Self {
        Self {
            id,
            serialization,
            compression,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn serialization(&self) -> u8 {
        self.serialization
    }

    #[inline]
    pub fn compression(&self) -> u8 {
        self.compression
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// Per-transport session table.
///
/// Consulted by the codec when resolving `session_id`; owned by the
/// transport, never by a header.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<i32, Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous one with the same id.
    pub fn add(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.insert(session.id(), Arc::clone(&session));
        session
    }

    pub fn get(&self, id: i32) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: i32) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mgr = SessionManager::new();
        assert!(mgr.is_empty());

        let s = mgr.add(Session::new(5, 3, 1));
        assert_eq!(s.serialization(), 3);
        assert_eq!(mgr.get(5).map(|s| s.compression()), Some(1));
        assert!(mgr.get(6).is_none());

        mgr.add(Session::new(5, 9, 0));
        assert_eq!(mgr.len(), 1);
        assert_eq!(mgr.get(5).map(|s| s.serialization()), Some(9));

        assert!(mgr.remove(5).is_some());
        assert!(mgr.is_empty());
    }
}
