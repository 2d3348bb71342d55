//! Community projections folded from kind-34550 definition events.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{Event, EventDraft, Tag, KIND_COMMUNITY};
use crate::processor::Outcome;

/// JSON content body of a community definition event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CommunityContent {
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub creator: Option<String>,
    pub is_private: bool,
    pub guidelines: Option<String>,
    pub tags: Vec<String>,
    pub deleted: bool,
}

/// Live projection of one community, rebuilt by last-write-wins over all
/// definition events sharing its unique key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Community {
    /// Event id of the definition currently projected.
    pub id: String,
    /// `<creator pubkey>:<d tag>`; exactly one live projection per key.
    pub unique_key: String,
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    pub creator: String,
    pub created_at: u64,
    pub members: BTreeSet<String>,
    pub moderators: BTreeSet<String>,
    pub is_private: bool,
    pub guidelines: Option<String>,
    pub topics: Vec<String>,
    /// Deletion is a definition carrying `deleted: true`, not a removal.
    pub deleted: bool,
    /// False while the projection comes from a not-yet-echoed local write.
    pub confirmed: bool,
}

/// Keyed store of community projections. Entry-level locking serializes
/// updates to one key without contending across communities.
#[derive(Default)]
pub struct CommunityStore {
    by_key: DashMap<String, Community>,
    /// Any definition event id ever applied -> unique key.
    by_id: DashMap<String, String>,
}

impl CommunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one definition event. Older events for an existing key are
    /// dropped as stale; replacement is whole-object, never field-by-field.
    pub fn apply(&self, ev: &Event, confirmed: bool) -> Outcome {
        if ev.kind != KIND_COMMUNITY {
            return Outcome::Ignored;
        }
        let d = match ev.tag_value("d") {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => return Outcome::Ignored,
        };
        let content: CommunityContent = match serde_json::from_str(&ev.content) {
            Ok(c) => c,
            Err(_) => return Outcome::Ignored,
        };
        let key = format!("{}:{}", ev.pubkey, d);

        let mut members = BTreeSet::new();
        let mut moderators = BTreeSet::new();
        for tag in ev.tags_named("p") {
            let Some(pk) = tag.value() else { continue };
            match tag.marker() {
                Some("banned") => {}
                Some("moderator") => {
                    members.insert(pk.to_string());
                    moderators.insert(pk.to_string());
                }
                _ => {
                    members.insert(pk.to_string());
                }
            }
        }

        let projection = Community {
            id: ev.id.clone(),
            unique_key: key.clone(),
            name: content.name,
            description: content.description,
            image: content.image,
            creator: content.creator.unwrap_or_else(|| ev.pubkey.clone()),
            created_at: ev.created_at,
            members,
            moderators,
            is_private: content.is_private,
            guidelines: content.guidelines,
            topics: content.tags,
            deleted: content.deleted,
            confirmed,
        };

        let outcome = match self.by_key.entry(key.clone()) {
            dashmap::Entry::Occupied(mut existing) => {
                if ev.created_at >= existing.get().created_at {
                    *existing.get_mut() = projection;
                    Outcome::Applied
                } else {
                    Outcome::Stale
                }
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(projection);
                Outcome::Applied
            }
        };
        if outcome == Outcome::Applied {
            self.by_id.insert(ev.id.clone(), key.clone());
            debug!(community = %key, at = ev.created_at, "community projection replaced");
        }
        outcome
    }

    /// Look up by unique key or by any definition event id applied so far.
    pub fn get(&self, key_or_id: &str) -> Option<Community> {
        if let Some(c) = self.by_key.get(key_or_id) {
            return Some(c.clone());
        }
        let key = self.by_id.get(key_or_id)?;
        self.by_key.get(key.value()).map(|c| c.clone())
    }

    /// Current member count, 0 for unknown communities.
    pub fn member_count(&self, key_or_id: &str) -> usize {
        self.get(key_or_id).map_or(0, |c| c.members.len())
    }

    /// All live (non-deleted) projections.
    pub fn all(&self) -> Vec<Community> {
        self.by_key
            .iter()
            .filter(|c| !c.deleted)
            .map(|c| c.clone())
            .collect()
    }

    /// Build a definition draft reproducing the current projection with one
    /// member removed. Returns `None` for unknown communities or non-members.
    pub fn draft_without_member(
        &self,
        key_or_id: &str,
        target: &str,
        created_at: u64,
    ) -> Option<EventDraft> {
        let community = self.get(key_or_id)?;
        if !community.members.contains(target) {
            return None;
        }
        let d = community.unique_key.split_once(':').map(|(_, d)| d)?;
        let mut tags = vec![Tag(vec!["d".into(), d.to_string()])];
        for member in &community.members {
            if member == target {
                continue;
            }
            let role = if community.moderators.contains(member) {
                "moderator"
            } else {
                ""
            };
            tags.push(Tag(vec![
                "p".into(),
                member.clone(),
                role.to_string(),
            ]));
        }
        let content = CommunityContent {
            name: community.name,
            description: community.description,
            image: community.image,
            creator: Some(community.creator),
            is_private: community.is_private,
            guidelines: community.guidelines,
            tags: community.topics,
            deleted: community.deleted,
        };
        let content = serde_json::to_string(&content).ok()?;
        Some(EventDraft::new(KIND_COMMUNITY, created_at, tags, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str, pubkey: &str, created_at: u64, name: &str, members: &[(&str, &str)]) -> Event {
        let mut tags = vec![Tag(vec!["d".into(), "rust".into()])];
        for (pk, role) in members {
            tags.push(Tag(vec!["p".into(), (*pk).into(), (*role).into()]));
        }
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind: KIND_COMMUNITY,
            created_at,
            tags,
            content: format!(r#"{{"name":"{name}"}}"#),
            sig: String::new(),
        }
    }

    #[test]
    fn last_write_wins_either_order() {
        for flip in [false, true] {
            let store = CommunityStore::new();
            let old = definition("aa11", "creator", 100, "Old", &[("a", "")]);
            let new = definition("bb22", "creator", 200, "New", &[("a", ""), ("b", "")]);
            let (first, second) = if flip { (&new, &old) } else { (&old, &new) };
            store.apply(first, true);
            store.apply(second, true);
            let c = store.get("creator:rust").unwrap();
            assert_eq!(c.name, "New");
            assert_eq!(c.id, "bb22");
            assert_eq!(c.members.len(), 2);
        }
    }

    #[test]
    fn stale_event_dropped_silently() {
        let store = CommunityStore::new();
        store.apply(&definition("bb22", "creator", 200, "New", &[("a", "")]), true);
        let outcome = store.apply(&definition("aa11", "creator", 100, "Old", &[("a", "")]), true);
        assert_eq!(outcome, Outcome::Stale);
        assert_eq!(store.get("creator:rust").unwrap().name, "New");
    }

    #[test]
    fn idempotent_apply() {
        let store = CommunityStore::new();
        let ev = definition("aa11", "creator", 100, "C", &[("a", "")]);
        store.apply(&ev, true);
        let before = store.get("creator:rust").unwrap();
        store.apply(&ev, true);
        assert_eq!(store.get("creator:rust").unwrap(), before);
    }

    #[test]
    fn roles_from_p_tag_markers() {
        let store = CommunityStore::new();
        let ev = definition(
            "aa11",
            "creator",
            100,
            "C",
            &[("a", ""), ("m", "moderator"), ("x", "banned")],
        );
        store.apply(&ev, true);
        let c = store.get("creator:rust").unwrap();
        assert!(c.members.contains("a"));
        assert!(c.members.contains("m"));
        assert!(c.moderators.contains("m"));
        assert!(!c.members.contains("x"));
    }

    #[test]
    fn lookup_by_event_id() {
        let store = CommunityStore::new();
        store.apply(&definition("aa11", "creator", 100, "C", &[("a", "")]), true);
        store.apply(&definition("bb22", "creator", 200, "C2", &[("a", "")]), true);
        // Both applied ids resolve to the live projection.
        assert_eq!(store.get("aa11").unwrap().name, "C2");
        assert_eq!(store.get("bb22").unwrap().name, "C2");
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn deleted_flag_is_a_replacement() {
        let store = CommunityStore::new();
        store.apply(&definition("aa11", "creator", 100, "C", &[("a", "")]), true);
        let mut del = definition("bb22", "creator", 200, "C", &[("a", "")]);
        del.content = r#"{"name":"C","deleted":true}"#.into();
        store.apply(&del, true);
        let c = store.get("creator:rust").unwrap();
        assert!(c.deleted);
        assert!(store.all().is_empty());
    }

    #[test]
    fn optimistic_then_confirmed_same_id() {
        let store = CommunityStore::new();
        let ev = definition("aa11", "creator", 100, "C", &[("a", "")]);
        store.apply(&ev, false);
        assert!(!store.get("creator:rust").unwrap().confirmed);
        store.apply(&ev, true);
        assert!(store.get("creator:rust").unwrap().confirmed);
    }

    #[test]
    fn malformed_content_ignored() {
        let store = CommunityStore::new();
        let mut ev = definition("aa11", "creator", 100, "C", &[("a", "")]);
        ev.content = "{not json".into();
        assert_eq!(store.apply(&ev, true), Outcome::Ignored);
        assert!(store.get("creator:rust").is_none());
    }

    #[test]
    fn removal_draft_drops_target_and_keeps_roles() {
        let store = CommunityStore::new();
        store.apply(
            &definition("aa11", "creator", 100, "C", &[("a", ""), ("m", "moderator"), ("t", "")]),
            true,
        );
        let draft = store.draft_without_member("creator:rust", "t", 150).unwrap();
        assert_eq!(draft.kind, KIND_COMMUNITY);
        assert_eq!(draft.tags.iter().filter(|t| t.name() == "p").count(), 2);
        assert!(draft.tags.iter().all(|t| t.value() != Some("t")));
        let content: CommunityContent = serde_json::from_str(&draft.content).unwrap();
        assert_eq!(content.name, "C");
        assert!(store.draft_without_member("creator:rust", "nobody", 150).is_none());
        assert!(store.draft_without_member("missing", "t", 150).is_none());
    }
}
