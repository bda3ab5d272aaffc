use std::collections::BTreeSet;

use studybuddy_types::events::GatewayEvent;

/// Who is currently viewing one group, as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSet {
    group_id: i64,
    online: BTreeSet<i64>,
}

impl PresenceSet {
    pub fn new(group_id: i64) -> Self {
        Self {
            group_id,
            online: BTreeSet::new(),
        }
    }

    /// Apply a presence event. Returns true if the set changed.
    pub fn apply(&mut self, event: &GatewayEvent) -> bool {
        match event {
            GatewayEvent::PresenceSync { group_id, user_ids } if *group_id == self.group_id => {
                let next: BTreeSet<i64> = user_ids.iter().copied().collect();
                let changed = next != self.online;
                self.online = next;
                changed
            }
            GatewayEvent::PresenceJoin { group_id, user_id } if *group_id == self.group_id => {
                self.online.insert(*user_id)
            }
            GatewayEvent::PresenceLeave { group_id, user_id } if *group_id == self.group_id => {
                self.online.remove(user_id)
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.online.contains(&user_id)
    }

    pub fn online(&self) -> impl Iterator<Item = i64> + '_ {
        self.online.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_replaces_then_join_and_leave_adjust() {
        let mut presence = PresenceSet::new(5);
        assert!(presence.apply(&GatewayEvent::PresenceSync { group_id: 5, user_ids: vec![1, 2] }));
        assert!(presence.apply(&GatewayEvent::PresenceJoin { group_id: 5, user_id: 3 }));
        assert!(!presence.apply(&GatewayEvent::PresenceJoin { group_id: 5, user_id: 3 }));
        assert!(presence.apply(&GatewayEvent::PresenceLeave { group_id: 5, user_id: 1 }));

        assert_eq!(presence.online().collect::<Vec<_>>(), vec![2, 3]);
        assert!(presence.is_online(3));
        assert!(!presence.is_online(1));
    }

    #[test]
    fn other_groups_are_ignored() {
        let mut presence = PresenceSet::new(5);
        assert!(!presence.apply(&GatewayEvent::PresenceJoin { group_id: 6, user_id: 3 }));
        assert!(!presence.apply(&GatewayEvent::MessagesChanged { group_id: 5 }));
        assert!(presence.is_empty());
    }
}
