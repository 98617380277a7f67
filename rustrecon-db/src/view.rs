use std::collections::BTreeMap;
use std::sync::Arc;

use rustrecon_types::{
    AttemptRecord, DisplayStats, Host, QueueItem, QueueStatus, StatusSnapshot, UpcomingAction,
};

use crate::error::DbError;
use crate::store::Store;

/// Read-only handle for dashboards and other display consumers.
///
/// Exposes the queue and inventory lookups without any of the `Store`
/// methods that mutate queue state.
#[derive(Debug, Clone)]
pub struct ReadView {
    store: Arc<Store>,
}

impl ReadView {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn list_action_queue(&self, statuses: &[QueueStatus]) -> Result<Vec<QueueItem>, DbError> {
        self.store.list_action_queue(statuses)
    }

    pub fn get_upcoming_actions_summary(&self) -> Result<Vec<UpcomingAction>, DbError> {
        self.store.get_upcoming_actions_summary()
    }

    /// Peek at the next pending item without claiming it.
    pub fn next_pending(&self) -> Result<Option<QueueItem>, DbError> {
        self.store.get_next()
    }

    pub fn get_display_stats(&self) -> Result<DisplayStats, DbError> {
        self.store.get_display_stats()
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, DbError> {
        self.store.list_hosts()
    }

    pub fn attempt_history(
        &self,
        action: &str,
        mac: &str,
        port: Option<u16>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, DbError> {
        self.store.attempt_history(action, mac, port, limit)
    }

    pub fn last_statuses_for_mac(
        &self,
        mac: &str,
    ) -> Result<BTreeMap<String, StatusSnapshot>, DbError> {
        self.store.last_statuses_for_mac(mac)
    }
}

impl From<Arc<Store>> for ReadView {
    fn from(store: Arc<Store>) -> Self {
        Self::new(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustrecon_types::NewQueueItem;

    #[test]
    fn view_sees_writes_through_shared_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let view = ReadView::from(Arc::clone(&store));
        assert!(view.next_pending().unwrap().is_none());
        store
            .enqueue_immediate(NewQueueItem::immediate("PortScan", "aa:bb:cc:dd:ee:ff", None))
            .unwrap();
        assert_eq!(view.list_action_queue(&[QueueStatus::Pending]).unwrap().len(), 1);
        assert_eq!(view.get_display_stats().unwrap().pending_count, 1);
        // Peeking never claims.
        assert!(view.next_pending().unwrap().is_some());
        assert!(view.next_pending().unwrap().is_some());
    }
}
