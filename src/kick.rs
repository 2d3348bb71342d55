//! Kick proposals and the quorum rule that mutates membership.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::community::CommunityStore;
use crate::event::{Event, Tag, KIND_KICK_PROPOSAL, KIND_KICK_VOTE};
use crate::processor::Outcome;
use crate::proposal::{VOTE_BUFFER_CAP, VOTE_BUFFER_WINDOW_SECS};

/// A kick executes once votes reach this share of current members.
pub const KICK_QUORUM: f64 = 0.51;

/// Live projection of one kick proposal. The creator's vote is implicit;
/// `executed` latches so the removal intent is emitted at most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KickProposal {
    pub id: String,
    pub community_id: String,
    pub target: String,
    pub reason: Option<String>,
    pub created_at: u64,
    pub votes: BTreeSet<String>,
    pub executed: bool,
}

/// Membership-mutation intent produced when a kick reaches quorum. The
/// caller turns this into a community-definition write.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub kick_id: String,
    pub community_id: String,
    pub target: String,
}

struct BufferedKickVote {
    voter: String,
    buffered_at: u64,
}

/// Keyed store of kick proposals plus a bounded buffer for votes arriving
/// before their proposal.
#[derive(Default)]
pub struct KickStore {
    proposals: DashMap<String, KickProposal>,
    pending: DashMap<String, Vec<BufferedKickVote>>,
}

impl KickStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a kick proposal. The creator's vote counts immediately, so a
    /// small enough community can reach quorum on creation.
    pub fn apply_proposal(
        &self,
        ev: &Event,
        communities: &CommunityStore,
    ) -> (Outcome, Option<Removal>) {
        if ev.kind != KIND_KICK_PROPOSAL {
            return (Outcome::Ignored, None);
        }
        let Some(community_id) = ev.tag_value("e") else {
            return (Outcome::Ignored, None);
        };
        let Some(target) = ev
            .tags_named("p")
            .find(|t| t.marker() == Some("kick"))
            .and_then(Tag::value)
        else {
            return (Outcome::Ignored, None);
        };
        let reason = serde_json::from_str::<Value>(&ev.content)
            .ok()
            .and_then(|v| v.get("reason").and_then(Value::as_str).map(String::from));

        match self.proposals.entry(ev.id.clone()) {
            dashmap::Entry::Occupied(_) => {
                warn!(kick = %ev.id, "duplicate kick proposal ignored");
                (Outcome::Ignored, None)
            }
            dashmap::Entry::Vacant(slot) => {
                let mut proposal = KickProposal {
                    id: ev.id.clone(),
                    community_id: community_id.to_string(),
                    target: target.to_string(),
                    reason,
                    created_at: ev.created_at,
                    votes: BTreeSet::from([ev.pubkey.clone()]),
                    executed: false,
                };
                if let Some((_, buffered)) = self.pending.remove(&ev.id) {
                    for vote in buffered {
                        proposal.votes.insert(vote.voter);
                    }
                }
                let removal = evaluate(&mut proposal, communities);
                slot.insert(proposal);
                (Outcome::Applied, removal)
            }
        }
    }

    /// Fold a kick vote. Repeat voters are no-ops; every insertion re-checks
    /// the quorum against the current membership snapshot.
    pub fn apply_vote(
        &self,
        ev: &Event,
        communities: &CommunityStore,
        now: u64,
    ) -> (Outcome, Option<Removal>) {
        if ev.kind != KIND_KICK_VOTE {
            return (Outcome::Ignored, None);
        }
        let Some(kick_id) = ev.tag_value("e") else {
            return (Outcome::Ignored, None);
        };
        self.sweep(now);
        if let Some(mut proposal) = self.proposals.get_mut(kick_id) {
            if !proposal.votes.insert(ev.pubkey.clone()) {
                return (Outcome::Ignored, None);
            }
            let removal = evaluate(&mut proposal, communities);
            return (Outcome::Applied, removal);
        }
        let mut buffer = self.pending.entry(kick_id.to_string()).or_default();
        if buffer.len() >= VOTE_BUFFER_CAP {
            warn!(kick = %kick_id, "kick vote buffer full, dropping vote");
            return (Outcome::Ignored, None);
        }
        buffer.push(BufferedKickVote {
            voter: ev.pubkey.clone(),
            buffered_at: now,
        });
        (Outcome::Buffered, None)
    }

    /// Drop buffered kick votes whose window has passed.
    pub fn sweep(&self, now: u64) {
        self.pending.retain(|kick_id, votes| {
            let before = votes.len();
            votes.retain(|v| now.saturating_sub(v.buffered_at) <= VOTE_BUFFER_WINDOW_SECS);
            if before != votes.len() {
                warn!(kick = %kick_id, dropped = before - votes.len(), "dropped votes for unseen kick proposal");
            }
            !votes.is_empty()
        });
    }

    pub fn get(&self, id: &str) -> Option<KickProposal> {
        self.proposals.get(id).map(|p| p.clone())
    }
}

/// Recompute the quorum ratio against the community's current member count
/// (live denominator, see DESIGN.md) and latch execution.
fn evaluate(proposal: &mut KickProposal, communities: &CommunityStore) -> Option<Removal> {
    if proposal.executed {
        return None;
    }
    let members = communities.member_count(&proposal.community_id);
    if members == 0 {
        return None;
    }
    let ratio = proposal.votes.len() as f64 / members as f64;
    if ratio < KICK_QUORUM {
        return None;
    }
    proposal.executed = true;
    info!(
        kick = %proposal.id,
        target = %proposal.target,
        votes = proposal.votes.len(),
        members,
        "kick quorum reached"
    );
    Some(Removal {
        kick_id: proposal.id.clone(),
        community_id: proposal.community_id.clone(),
        target: proposal.target.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_COMMUNITY;

    fn community(members: &[&str]) -> CommunityStore {
        let store = CommunityStore::new();
        let mut tags = vec![Tag(vec!["d".into(), "c".into()])];
        for m in members {
            tags.push(Tag(vec!["p".into(), (*m).into()]));
        }
        let ev = Event {
            id: "cc11".into(),
            pubkey: "creator".into(),
            kind: KIND_COMMUNITY,
            created_at: 1,
            tags,
            content: r#"{"name":"C"}"#.into(),
            sig: String::new(),
        };
        store.apply(&ev, true);
        store
    }

    fn kick_proposal(id: &str, creator: &str, target: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: creator.into(),
            kind: KIND_KICK_PROPOSAL,
            created_at: 10,
            tags: vec![
                Tag(vec!["e".into(), "cc11".into()]),
                Tag(vec!["p".into(), target.into(), "kick".into()]),
            ],
            content: r#"{"reason":"spam"}"#.into(),
            sig: String::new(),
        }
    }

    fn kick_vote(id: &str, voter: &str, kick: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: voter.into(),
            kind: KIND_KICK_VOTE,
            created_at: 11,
            tags: vec![Tag(vec!["e".into(), kick.into()])],
            content: "1".into(),
            sig: String::new(),
        }
    }

    #[test]
    fn quorum_boundary_four_members() {
        let communities = community(&["a", "b", "c", "d"]);
        let kicks = KickStore::new();

        // Creator's implicit vote: 1/4.
        let (outcome, removal) = kicks.apply_proposal(&kick_proposal("k1", "a", "d"), &communities);
        assert_eq!(outcome, Outcome::Applied);
        assert!(removal.is_none());

        // 2/4 = 0.5 < 0.51.
        let (_, removal) = kicks.apply_vote(&kick_vote("v1", "b", "k1"), &communities, 0);
        assert!(removal.is_none());

        // 3/4 = 0.75 triggers exactly one removal.
        let (_, removal) = kicks.apply_vote(&kick_vote("v2", "c", "k1"), &communities, 0);
        let removal = removal.unwrap();
        assert_eq!(removal.target, "d");
        assert_eq!(removal.community_id, "cc11");
        assert!(kicks.get("k1").unwrap().executed);

        // Duplicate voter after execution: idempotent no-op.
        let (outcome, removal) = kicks.apply_vote(&kick_vote("v3", "c", "k1"), &communities, 0);
        assert_eq!(outcome, Outcome::Ignored);
        assert!(removal.is_none());

        // A genuinely new voter also cannot re-trigger an executed kick.
        let (_, removal) = kicks.apply_vote(&kick_vote("v4", "d", "k1"), &communities, 0);
        assert!(removal.is_none());
    }

    #[test]
    fn single_member_community_kicks_on_creation() {
        let communities = community(&["a"]);
        let kicks = KickStore::new();
        let (_, removal) = kicks.apply_proposal(&kick_proposal("k1", "a", "a"), &communities);
        assert!(removal.is_some());
    }

    #[test]
    fn unknown_community_never_reaches_quorum() {
        let communities = CommunityStore::new();
        let kicks = KickStore::new();
        let (outcome, removal) = kicks.apply_proposal(&kick_proposal("k1", "a", "b"), &communities);
        assert_eq!(outcome, Outcome::Applied);
        assert!(removal.is_none());
    }

    #[test]
    fn duplicate_proposal_ignored() {
        let communities = community(&["a", "b", "c", "d"]);
        let kicks = KickStore::new();
        kicks.apply_proposal(&kick_proposal("k1", "a", "d"), &communities);
        let (outcome, _) = kicks.apply_proposal(&kick_proposal("k1", "b", "c"), &communities);
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(kicks.get("k1").unwrap().target, "d");
    }

    #[test]
    fn early_kick_votes_buffered_and_drained() {
        let communities = community(&["a", "b", "c", "d"]);
        let kicks = KickStore::new();
        assert_eq!(
            kicks.apply_vote(&kick_vote("v1", "b", "k1"), &communities, 0).0,
            Outcome::Buffered
        );
        assert_eq!(
            kicks.apply_vote(&kick_vote("v2", "c", "k1"), &communities, 0).0,
            Outcome::Buffered
        );
        // Proposal arrives: creator + 2 buffered votes = 3/4, quorum met.
        let (_, removal) = kicks.apply_proposal(&kick_proposal("k1", "a", "d"), &communities);
        assert!(removal.is_some());
    }

    #[test]
    fn live_denominator_moves_goalposts() {
        let communities = community(&["a", "b", "c", "d"]);
        let kicks = KickStore::new();
        kicks.apply_proposal(&kick_proposal("k1", "a", "d"), &communities);
        kicks.apply_vote(&kick_vote("v1", "b", "k1"), &communities, 0);
        // Membership shrinks to 3 before the next evaluation; 2/3 > 0.51 but
        // the next vote makes it 3/3 regardless. Shrink to 2 instead: the
        // stored 2 votes already satisfy 2/2 on the next insertion.
        let shrink = Event {
            id: "cc22".into(),
            pubkey: "creator".into(),
            kind: KIND_COMMUNITY,
            created_at: 2,
            tags: vec![
                Tag(vec!["d".into(), "c".into()]),
                Tag(vec!["p".into(), "a".into()]),
                Tag(vec!["p".into(), "d".into()]),
            ],
            content: r#"{"name":"C"}"#.into(),
            sig: String::new(),
        };
        communities.apply(&shrink, true);
        let (_, removal) = kicks.apply_vote(&kick_vote("v2", "c", "k1"), &communities, 0);
        assert!(removal.is_some());
    }
}
