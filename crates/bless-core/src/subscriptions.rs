//! Central subscription tracking
//!
//! Maps each connected central to the characteristics it has enabled
//! notifications or indications on. A central with no remaining
//! subscriptions is removed, so `is_connected` is simply "non-empty".

use std::collections::{BTreeSet, HashMap};

use tracing::debug;
use uuid::Uuid;

/// Central identifier → subscribed characteristic UUIDs
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    centrals: HashMap<String, BTreeSet<Uuid>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription; returns false if it was already present
    pub fn subscribe(&mut self, central: &str, characteristic: Uuid) -> bool {
        let added = self
            .centrals
            .entry(central.to_string())
            .or_default()
            .insert(characteristic);
        if added {
            debug!(central, %characteristic, "Central subscribed");
        } else {
            debug!(central, %characteristic, "Central already subscribed");
        }
        added
    }

    /// Remove a subscription; returns false if it was not present
    pub fn unsubscribe(&mut self, central: &str, characteristic: Uuid) -> bool {
        let Some(set) = self.centrals.get_mut(central) else {
            debug!(central, %characteristic, "Unsubscribe from unknown central");
            return false;
        };
        let removed = set.remove(&characteristic);
        if set.is_empty() {
            self.centrals.remove(central);
            debug!(central, "Central has no remaining subscriptions");
        }
        removed
    }

    /// Replace the full subscriber list of one characteristic
    ///
    /// Stacks that report "the clients subscribed to X are now [..]" are
    /// reconciled through this instead of individual events.
    pub fn reconcile(&mut self, characteristic: Uuid, centrals: &[String]) {
        let stale: Vec<String> = self
            .centrals
            .iter()
            .filter(|(id, set)| set.contains(&characteristic) && !centrals.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        for central in stale {
            self.unsubscribe(&central, characteristic);
        }
        for central in centrals {
            self.subscribe(central, characteristic);
        }
    }

    /// Drop every subscription held by a central
    pub fn remove_central(&mut self, central: &str) -> bool {
        self.centrals.remove(central).is_some()
    }

    pub fn is_connected(&self) -> bool {
        !self.centrals.is_empty()
    }

    pub fn is_subscribed(&self, central: &str, characteristic: &Uuid) -> bool {
        self.centrals
            .get(central)
            .map(|set| set.contains(characteristic))
            .unwrap_or(false)
    }

    /// Centrals subscribed to `characteristic`
    pub fn subscribers_of(&self, characteristic: &Uuid) -> Vec<String> {
        let mut ids: Vec<String> = self
            .centrals
            .iter()
            .filter(|(_, set)| set.contains(characteristic))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn central_count(&self) -> usize {
        self.centrals.len()
    }

    pub fn clear(&mut self) {
        self.centrals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_a() -> Uuid {
        Uuid::from_u128(0xa)
    }

    fn char_b() -> Uuid {
        Uuid::from_u128(0xb)
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let mut set = SubscriptionSet::new();
        assert!(set.subscribe("central-1", char_a()));
        let before = set.clone();
        assert!(!set.subscribe("central-1", char_a()));
        assert_eq!(set.subscribers_of(&char_a()), before.subscribers_of(&char_a()));
        assert_eq!(set.central_count(), 1);
    }

    #[test]
    fn test_last_unsubscribe_removes_central() {
        let mut set = SubscriptionSet::new();
        set.subscribe("central-1", char_a());
        set.subscribe("central-1", char_b());
        set.unsubscribe("central-1", char_a());
        assert!(set.is_connected());
        set.unsubscribe("central-1", char_b());
        assert!(!set.is_connected());
        assert_eq!(set.central_count(), 0);
    }

    #[test]
    fn test_reconcile_replaces_subscriber_list() {
        let mut set = SubscriptionSet::new();
        set.subscribe("old", char_a());
        set.subscribe("kept", char_a());
        set.subscribe("other", char_b());
        set.reconcile(char_a(), &["kept".to_string(), "new".to_string()]);
        assert_eq!(set.subscribers_of(&char_a()), vec!["kept".to_string(), "new".to_string()]);
        assert!(set.is_subscribed("other", &char_b()));
        assert!(!set.is_subscribed("old", &char_a()));
        assert_eq!(set.central_count(), 3);
    }
}
