//! Proposal projections and vote tallies.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{Event, KIND_PROPOSAL, KIND_VOTE};
use crate::processor::Outcome;

/// How long a vote for an unseen proposal is buffered before being dropped.
pub const VOTE_BUFFER_WINDOW_SECS: u64 = 300;
/// Cap on buffered votes per unseen proposal.
pub const VOTE_BUFFER_CAP: usize = 256;

/// JSON content body of a proposal event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProposalContent {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
    #[serde(default)]
    pub ends_at: Option<u64>,
}

/// Live projection of one proposal. `votes` holds at most one entry per
/// voter; each entry remembers its `created_at` so last-write-wins is decided
/// by timestamp, not processing order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub id: String,
    pub community_id: String,
    pub title: String,
    pub description: Option<String>,
    pub options: Vec<String>,
    pub created_at: u64,
    pub ends_at: Option<u64>,
    pub creator: String,
    /// voter -> (option index, vote created_at)
    pub votes: HashMap<String, (u32, u64)>,
}

impl Proposal {
    /// Open-ended proposals stay active forever.
    pub fn is_active(&self, now: u64) -> bool {
        self.ends_at.map_or(true, |ends| ends > now)
    }
}

/// On-demand tally over a proposal's votes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tally {
    /// One bucket per option.
    pub counts: Vec<usize>,
    pub total: usize,
}

impl Tally {
    /// Fraction of votes for one option; 0 when nobody has voted.
    pub fn fraction(&self, option: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.counts.get(option).copied().unwrap_or(0) as f64 / self.total as f64
        }
    }
}

struct BufferedVote {
    voter: String,
    option: u32,
    created_at: u64,
    buffered_at: u64,
}

/// Keyed store of proposals plus a bounded buffer for votes that arrive
/// before their proposal (independent relay connections reorder freely).
#[derive(Default)]
pub struct ProposalStore {
    proposals: DashMap<String, Proposal>,
    pending: DashMap<String, Vec<BufferedVote>>,
}

impl ProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a proposal event. Proposals are never redefined: duplicate ids
    /// are ignored with a warning. Buffered votes for the id are drained in.
    pub fn apply_proposal(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_PROPOSAL {
            return Outcome::Ignored;
        }
        let Some(community_id) = ev.tag_value("e") else {
            return Outcome::Ignored;
        };
        let content: ProposalContent = match serde_json::from_str(&ev.content) {
            Ok(c) => c,
            Err(_) => return Outcome::Ignored,
        };
        if content.options.len() < 2 {
            return Outcome::Ignored;
        }
        match self.proposals.entry(ev.id.clone()) {
            dashmap::Entry::Occupied(_) => {
                warn!(proposal = %ev.id, "duplicate proposal id ignored");
                Outcome::Ignored
            }
            dashmap::Entry::Vacant(slot) => {
                let mut proposal = Proposal {
                    id: ev.id.clone(),
                    community_id: community_id.to_string(),
                    title: content.title,
                    description: content.description,
                    options: content.options,
                    created_at: ev.created_at,
                    ends_at: content.ends_at,
                    creator: ev.pubkey.clone(),
                    votes: HashMap::new(),
                };
                if let Some((_, buffered)) = self.pending.remove(&ev.id) {
                    for vote in buffered {
                        record_vote(&mut proposal, &vote.voter, vote.option, vote.created_at);
                    }
                }
                slot.insert(proposal);
                Outcome::Applied
            }
        }
    }

    /// Fold a vote event. Unknown proposals buffer the vote for a bounded
    /// window; known proposals take the vote under last-write-wins by
    /// `created_at`, rejecting out-of-range option indexes.
    pub fn apply_vote(&self, ev: &Event, now: u64) -> Outcome {
        if ev.kind != KIND_VOTE {
            return Outcome::Ignored;
        }
        let Some(proposal_id) = ev.tag_value("e") else {
            return Outcome::Ignored;
        };
        let Ok(option) = ev.content.trim().parse::<u32>() else {
            return Outcome::Ignored;
        };
        self.sweep(now);
        if let Some(mut proposal) = self.proposals.get_mut(proposal_id) {
            return record_vote(&mut proposal, &ev.pubkey, option, ev.created_at);
        }
        let mut buffer = self.pending.entry(proposal_id.to_string()).or_default();
        if buffer.len() >= VOTE_BUFFER_CAP {
            warn!(proposal = %proposal_id, "vote buffer full, dropping vote");
            return Outcome::Ignored;
        }
        buffer.push(BufferedVote {
            voter: ev.pubkey.clone(),
            option,
            created_at: ev.created_at,
            buffered_at: now,
        });
        Outcome::Buffered
    }

    /// Drop buffered votes whose window has passed.
    pub fn sweep(&self, now: u64) {
        self.pending.retain(|proposal_id, votes| {
            let before = votes.len();
            votes.retain(|v| now.saturating_sub(v.buffered_at) <= VOTE_BUFFER_WINDOW_SECS);
            let dropped = before - votes.len();
            if dropped > 0 {
                warn!(proposal = %proposal_id, dropped, "dropped votes for unseen proposal");
            }
            !votes.is_empty()
        });
    }

    pub fn get(&self, id: &str) -> Option<Proposal> {
        self.proposals.get(id).map(|p| p.clone())
    }

    /// Proposals belonging to one community.
    pub fn for_community(&self, community_id: &str) -> Vec<Proposal> {
        self.proposals
            .iter()
            .filter(|p| p.community_id == community_id)
            .map(|p| p.clone())
            .collect()
    }

    /// Count votes into one bucket per option.
    pub fn tally(&self, id: &str) -> Option<Tally> {
        let proposal = self.proposals.get(id)?;
        let mut counts = vec![0usize; proposal.options.len()];
        for (option, _) in proposal.votes.values() {
            if let Some(bucket) = counts.get_mut(*option as usize) {
                *bucket += 1;
            }
        }
        Some(Tally {
            counts,
            total: proposal.votes.len(),
        })
    }
}

/// Insert or overwrite one voter's vote. A stored vote only yields to a
/// timestamp that is equal or newer, so arrival order cannot flip the result.
fn record_vote(proposal: &mut Proposal, voter: &str, option: u32, created_at: u64) -> Outcome {
    if option as usize >= proposal.options.len() {
        warn!(proposal = %proposal.id, option, "vote option out of range");
        return Outcome::Ignored;
    }
    match proposal.votes.get(voter) {
        Some((_, stored_at)) if *stored_at > created_at => Outcome::Stale,
        _ => {
            proposal.votes.insert(voter.to_string(), (option, created_at));
            debug!(proposal = %proposal.id, voter, option, "vote recorded");
            Outcome::Applied
        }
    }
}
