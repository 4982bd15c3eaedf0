use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::{
    error::RegistryError,
    session::{Session, SessionId},
};

/// Shared map of every live session, keyed by id.
///
/// Ids come from a monotonically increasing counter, so iteration order (and
/// therefore roster order) is connection order.
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn add(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.entry(session.id()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub async fn remove(&self, id: SessionId) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).ok_or(RegistryError::NotFound(id))
    }

    /// Point-in-time copy. The lock is released before the caller does any
    /// I/O with the returned sessions.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::codec::FrameCodec;

    fn session(id: SessionId) -> Arc<Session> {
        Arc::new(Session::new(
            id,
            None,
            tokio::io::sink(),
            FrameCodec::default(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let registry = Registry::new();
        let first = registry.next_id();
        let second = registry.next_id();
        assert!(first < second);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_overwriting() {
        let registry = Registry::new();
        let id = registry.next_id();
        let original = session(id);
        registry.add(Arc::clone(&original)).await.expect("first add");

        let result = registry.add(session(id)).await;
        assert_eq!(result, Err(RegistryError::DuplicateId(id)));

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(&snapshot[0], &original));
    }

    #[tokio::test]
    async fn remove_reports_missing_ids() {
        let registry = Registry::new();
        let id = registry.next_id();
        registry.add(session(id)).await.expect("add");

        assert!(registry.remove(id).await.is_ok());
        assert_eq!(
            registry.remove(id).await.map(|s| s.id()),
            Err(RegistryError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn snapshot_follows_connection_order_and_is_detached() {
        let registry = Registry::new();
        let ids: Vec<_> = (0..3).map(|_| registry.next_id()).collect();
        // Insert out of order; iteration still follows id order.
        for id in ids.iter().rev() {
            registry.add(session(*id)).await.expect("add");
        }

        let snapshot = registry.snapshot().await;
        registry.remove(ids[1]).await.expect("remove");

        let seen: Vec<_> = snapshot.iter().map(|s| s.id()).collect();
        assert_eq!(seen, ids);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_adds_and_removes_stay_consistent() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = registry.next_id();
                registry.add(session(id)).await.expect("add");
                if id.get() % 2 == 0 {
                    registry.remove(id).await.expect("remove");
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 32);
        assert!(snapshot.iter().all(|s| s.id().get() % 2 == 1));
    }
}
