use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

use uuid::Uuid;

/// State owned by a single gateway connection: which groups it listens to
/// and which groups it announces presence in. Dropped with the connection.
#[derive(Debug)]
pub struct ConnectionContext {
    pub conn_id: Uuid,
    pub user_id: i64,
    subscriptions: RwLock<HashSet<i64>>,
    tracked: Mutex<HashSet<i64>>,
}

impl ConnectionContext {
    pub fn new(conn_id: Uuid, user_id: i64) -> Self {
        Self {
            conn_id,
            user_id,
            subscriptions: RwLock::new(HashSet::new()),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_subscribed(&self, group_id: i64) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&group_id)
    }

    pub fn subscribe(&self, group_id: i64) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id);
    }

    pub fn unsubscribe(&self, group_id: i64) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id);
    }

    /// Returns true if the group was not tracked yet.
    pub fn start_tracking(&self, group_id: i64) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id)
    }

    /// Returns true if the group was tracked.
    pub fn stop_tracking(&self, group_id: i64) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id)
    }

    /// Empty the tracked set, returning what was in it.
    pub fn take_tracked(&self) -> Vec<i64> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_is_idempotent_per_connection() {
        let ctx = ConnectionContext::new(Uuid::new_v4(), 1);
        assert!(ctx.start_tracking(5));
        assert!(!ctx.start_tracking(5));
        assert!(ctx.stop_tracking(5));
        assert!(!ctx.stop_tracking(5));
    }

    #[test]
    fn take_tracked_empties_the_set() {
        let ctx = ConnectionContext::new(Uuid::new_v4(), 1);
        ctx.start_tracking(1);
        ctx.start_tracking(2);
        let mut taken = ctx.take_tracked();
        taken.sort();
        assert_eq!(taken, vec![1, 2]);
        assert!(ctx.take_tracked().is_empty());
    }
}
