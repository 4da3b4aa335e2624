//! Interested-party store
//!
//! Parties (user alerts and auto-booking clients) are owned by upstream
//! systems; the pipeline sees them through [`PartyStore`]. The reconciler
//! reads the per-target interest summary to decide which targets deserve a
//! repeating job, and the dispatcher reads the party list per detection.
//!
//! Expired interest is filtered at read time, so a party lapsing between
//! reconcile ticks simply stops receiving notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::InterestedParty;

#[async_trait]
pub trait PartyStore: Send + Sync {
    /// Active parties watching a (target, sub-category)
    ///
    /// A party with no sub-category watches the whole target and matches
    /// any check; a scoped party only matches checks for its procedure.
    async fn parties_for(&self, target_id: &str, sub_category: Option<&str>)
        -> Vec<InterestedParty>;

    /// Active interest count per (target, sub-category), for schedule
    /// reconciliation
    async fn interest_summary(&self) -> HashMap<(String, Option<String>), usize>;

    /// Bump a party's counters after a dispatched detection
    async fn record_dispatch(&self, party_id: &str, slots: u32);
}

/// In-process store, also the test double
pub struct MemoryPartyStore {
    parties: RwLock<HashMap<String, InterestedParty>>,
}

impl MemoryPartyStore {
    pub fn new() -> Self {
        Self {
            parties: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, party: InterestedParty) {
        let mut parties = self.parties.write().await;
        parties.insert(party.id.clone(), party);
    }

    pub async fn remove(&self, party_id: &str) -> bool {
        self.parties.write().await.remove(party_id).is_some()
    }

    pub async fn get(&self, party_id: &str) -> Option<InterestedParty> {
        self.parties.read().await.get(party_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.parties.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.parties.read().await.is_empty()
    }
}

impl Default for MemoryPartyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartyStore for MemoryPartyStore {
    async fn parties_for(
        &self,
        target_id: &str,
        sub_category: Option<&str>,
    ) -> Vec<InterestedParty> {
        let now = Utc::now();
        self.parties
            .read()
            .await
            .values()
            .filter(|p| {
                p.target_id == target_id
                    && p.is_active(now)
                    && match &p.sub_category {
                        None => true,
                        Some(scope) => Some(scope.as_str()) == sub_category,
                    }
            })
            .cloned()
            .collect()
    }

    async fn interest_summary(&self) -> HashMap<(String, Option<String>), usize> {
        let now = Utc::now();
        let mut summary: HashMap<(String, Option<String>), usize> = HashMap::new();
        for party in self.parties.read().await.values() {
            if party.is_active(now) {
                *summary
                    .entry((party.target_id.clone(), party.sub_category.clone()))
                    .or_default() += 1;
            }
        }
        summary
    }

    async fn record_dispatch(&self, party_id: &str, slots: u32) {
        let mut parties = self.parties.write().await;
        if let Some(party) = parties.get_mut(party_id) {
            party.slots_found += u64::from(slots);
            party.notifications_sent += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_parties_for_filters_target_and_expiry() {
        let store = MemoryPartyStore::new();
        store.add(InterestedParty::new("a1", "paris_75")).await;
        store.add(InterestedParty::new("a2", "lyon_69")).await;
        store
            .add(
                InterestedParty::new("a3", "paris_75")
                    .with_expiry(Utc::now() - Duration::hours(1)),
            )
            .await;

        let parties = store.parties_for("paris_75", None).await;
        assert_eq!(parties.len(), 1);
        assert_eq!(parties[0].id, "a1");
    }

    #[tokio::test]
    async fn test_parties_for_scopes_on_sub_category() {
        let store = MemoryPartyStore::new();
        store.add(InterestedParty::new("broad", "paris_75")).await;
        store
            .add(InterestedParty::new("scoped", "paris_75").with_sub_category("naturalisation"))
            .await;

        // A generic check never reaches the scoped party
        let generic = store.parties_for("paris_75", None).await;
        assert_eq!(generic.len(), 1);
        assert_eq!(generic[0].id, "broad");

        // A scoped check reaches both the scoped party and the broad one
        let mut ids: Vec<String> = store
            .parties_for("paris_75", Some("naturalisation"))
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["broad".to_string(), "scoped".to_string()]);

        // A different procedure only matches the broad party
        let other = store.parties_for("paris_75", Some("titre_sejour")).await;
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].id, "broad");
    }

    #[tokio::test]
    async fn test_interest_summary_counts_active_only() {
        let store = MemoryPartyStore::new();
        store.add(InterestedParty::new("a1", "paris_75")).await;
        store.add(InterestedParty::new("a2", "paris_75")).await;
        store
            .add(
                InterestedParty::new("a3", "lyon_69")
                    .with_expiry(Utc::now() - Duration::hours(1)),
            )
            .await;

        let summary = store.interest_summary().await;
        assert_eq!(summary.get(&("paris_75".to_string(), None)), Some(&2));
        assert_eq!(summary.get(&("lyon_69".to_string(), None)), None);
    }

    #[tokio::test]
    async fn test_interest_summary_splits_sub_categories() {
        let store = MemoryPartyStore::new();
        store.add(InterestedParty::new("a1", "paris_75")).await;
        store
            .add(InterestedParty::new("a2", "paris_75").with_sub_category("naturalisation"))
            .await;

        let summary = store.interest_summary().await;
        assert_eq!(summary.get(&("paris_75".to_string(), None)), Some(&1));
        assert_eq!(
            summary.get(&(
                "paris_75".to_string(),
                Some("naturalisation".to_string())
            )),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_record_dispatch_bumps_counters() {
        let store = MemoryPartyStore::new();
        store.add(InterestedParty::new("a1", "paris_75")).await;

        store.record_dispatch("a1", 4).await;
        store.record_dispatch("a1", 1).await;

        let party = store.get("a1").await.unwrap();
        assert_eq!(party.slots_found, 5);
        assert_eq!(party.notifications_sent, 2);
    }
}
