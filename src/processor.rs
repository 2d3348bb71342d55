//! Event dispatcher and the engine that ties folding to the relay transport.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::community::CommunityStore;
use crate::event::{
    now_ts, Event, EventDraft, Keys, Tag, KIND_BAN, KIND_COMMUNITY, KIND_KICK_PROPOSAL,
    KIND_KICK_VOTE, KIND_NOTE, KIND_POST_APPROVAL, KIND_POST_REJECTION, KIND_PROPOSAL,
    KIND_REPORT, KIND_REPORT_REVIEW, KIND_UNBAN, KIND_VOTE,
};
use crate::kick::{KickStore, Removal};
use crate::moderation::{ModeratedPost, ModerationStore, ReportStatus, TargetType};
use crate::proposal::ProposalStore;
use crate::transport::{Filter, PublishError, Transport};
use crate::validate::validate;

/// Whether an event came from the network or is a local not-yet-echoed write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source {
    Confirmed,
    Optimistic,
}

/// What one fold did. `Stale` and `Ignored` are normal outcomes, not errors;
/// only `Rejected` means the event was structurally unusable.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    /// Valid but superseded by a newer event for the same key.
    Stale,
    /// Parked until its referenced parent arrives.
    Buffered,
    /// No-op: duplicate, terminal-state transition, or defensive drop.
    Ignored,
    /// Failed structural validation; never folded.
    Rejected(Vec<String>),
    /// Applied, and a kick reached quorum producing a removal intent.
    KickResolved(Removal),
}

/// Which projection family a change notification refers to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChangeKind {
    Community,
    Proposal,
    Kick,
    Post,
    Report,
    Ban,
}

/// Published on every successful fold so readers can observe projections
/// without polling.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub key: String,
}

/// Owns every projection store and routes validated events to them.
///
/// All maps are keyed concurrent maps: applies for unrelated keys never
/// contend and same-key replacement is serialized by the entry lock.
pub struct EventProcessor {
    pub communities: CommunityStore,
    pub proposals: ProposalStore,
    pub kicks: KickStore,
    pub moderation: ModerationStore,
    changes: broadcast::Sender<Change>,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            communities: CommunityStore::new(),
            proposals: ProposalStore::new(),
            kicks: KickStore::new(),
            moderation: ModerationStore::new(),
            changes,
        }
    }

    /// Observe projection changes. Lagging receivers skip, they never block
    /// folding.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Validate and fold one event. Never fails: hostile input degrades to a
    /// `Rejected` outcome and cannot touch other projections.
    pub fn apply(&self, ev: &Event, source: Source) -> Outcome {
        let validation = validate(ev);
        if !validation.valid {
            warn!(
                event = %ev.id,
                kind = ev.kind,
                errors = ?validation.errors,
                "event rejected by validator"
            );
            return Outcome::Rejected(validation.errors);
        }
        let confirmed = source == Source::Confirmed;
        let now = now_ts();
        let (outcome, change) = match ev.kind {
            KIND_COMMUNITY => {
                let key = ev
                    .tag_value("d")
                    .map(|d| format!("{}:{}", ev.pubkey, d))
                    .unwrap_or_default();
                (
                    self.communities.apply(ev, confirmed),
                    Change {
                        kind: ChangeKind::Community,
                        key,
                    },
                )
            }
            KIND_PROPOSAL => (
                self.proposals.apply_proposal(ev),
                Change {
                    kind: ChangeKind::Proposal,
                    key: ev.id.clone(),
                },
            ),
            KIND_VOTE => (
                self.proposals.apply_vote(ev, now),
                Change {
                    kind: ChangeKind::Proposal,
                    key: ev.tag_value("e").unwrap_or_default().to_string(),
                },
            ),
            KIND_KICK_PROPOSAL => {
                let (outcome, removal) = self.kicks.apply_proposal(ev, &self.communities);
                let outcome = match removal {
                    Some(removal) => Outcome::KickResolved(removal),
                    None => outcome,
                };
                (
                    outcome,
                    Change {
                        kind: ChangeKind::Kick,
                        key: ev.id.clone(),
                    },
                )
            }
            KIND_KICK_VOTE => {
                let (outcome, removal) = self.kicks.apply_vote(ev, &self.communities, now);
                let outcome = match removal {
                    Some(removal) => Outcome::KickResolved(removal),
                    None => outcome,
                };
                (
                    outcome,
                    Change {
                        kind: ChangeKind::Kick,
                        key: ev.tag_value("e").unwrap_or_default().to_string(),
                    },
                )
            }
            KIND_NOTE => (
                self.moderation.apply_submission(ev),
                Change {
                    kind: ChangeKind::Post,
                    key: ev.id.clone(),
                },
            ),
            KIND_POST_APPROVAL | KIND_POST_REJECTION => (
                self.moderation.apply_resolution(ev),
                Change {
                    kind: ChangeKind::Post,
                    key: ev.tag_value("e").unwrap_or_default().to_string(),
                },
            ),
            KIND_REPORT => (
                self.moderation.apply_report(ev),
                Change {
                    kind: ChangeKind::Report,
                    key: ev.id.clone(),
                },
            ),
            KIND_REPORT_REVIEW => (
                self.moderation.apply_report_review(ev),
                Change {
                    kind: ChangeKind::Report,
                    key: ev.tag_value("e").unwrap_or_default().to_string(),
                },
            ),
            KIND_BAN => (
                self.moderation.apply_ban(ev),
                Change {
                    kind: ChangeKind::Ban,
                    key: ev.id.clone(),
                },
            ),
            KIND_UNBAN => (
                self.moderation.apply_unban(ev),
                Change {
                    kind: ChangeKind::Ban,
                    key: ev.tag_value("e").or(ev.tag_value("p")).unwrap_or_default().to_string(),
                },
            ),
            _ => (Outcome::Ignored, Change {
                kind: ChangeKind::Community,
                key: String::new(),
            }),
        };
        if matches!(outcome, Outcome::Applied | Outcome::KickResolved(_)) {
            let _ = self.changes.send(change);
        }
        outcome
    }
}

/// One live subscription covering every governance kind.
pub fn governance_filter() -> Filter {
    Filter::kinds(vec![
        KIND_NOTE,
        KIND_POST_APPROVAL,
        KIND_POST_REJECTION,
        KIND_REPORT,
        KIND_BAN,
        KIND_UNBAN,
        KIND_REPORT_REVIEW,
        KIND_COMMUNITY,
        KIND_PROPOSAL,
        KIND_VOTE,
        KIND_KICK_PROPOSAL,
        KIND_KICK_VOTE,
    ])
}

/// Folding engine bound to a transport: confirmed events flow in through
/// [`Engine::run`], local writes go out through the publish helpers and are
/// folded optimistically only after a relay accepts them.
pub struct Engine {
    processor: Arc<EventProcessor>,
    transport: Arc<dyn Transport>,
    keys: Keys,
}

impl Engine {
    pub fn new(processor: Arc<EventProcessor>, transport: Arc<dyn Transport>, keys: Keys) -> Self {
        Self {
            processor,
            transport,
            keys,
        }
    }

    pub fn processor(&self) -> &EventProcessor {
        &self.processor
    }

    /// Fold one confirmed event, executing any kick that reaches quorum.
    pub async fn handle_event(&self, ev: &Event) -> Outcome {
        let outcome = self.processor.apply(ev, Source::Confirmed);
        if let Outcome::KickResolved(removal) = &outcome {
            if let Err(e) = self.execute_kick(removal).await {
                error!(kick = %removal.kick_id, error = %e, "kick execution failed");
            }
        }
        outcome
    }

    /// Drain a subscription until it closes. Unsubscribing is simply the
    /// sender going away; applied folds are never rolled back.
    pub async fn run(&self, mut rx: mpsc::Receiver<Event>) {
        while let Some(ev) = rx.recv().await {
            self.handle_event(&ev).await;
        }
        debug!("event stream closed");
    }

    /// Publish the membership mutation for a resolved kick. Idempotence is
    /// guaranteed upstream: the kick store latches before emitting.
    async fn execute_kick(&self, removal: &Removal) -> anyhow::Result<()> {
        let draft = self
            .processor
            .communities
            .draft_without_member(&removal.community_id, &removal.target, now_ts())
            .ok_or_else(|| anyhow::anyhow!("no community projection for resolved kick"))?;
        self.publish_event(draft).await?;
        Ok(())
    }

    /// Sign, publish, and fold optimistically once the relay accepts. If the
    /// fold itself resolves a kick (a local proposal in a tiny community can
    /// reach quorum immediately), execute that too.
    async fn publish_and_fold(&self, draft: EventDraft) -> Result<Event, PublishError> {
        let (event, outcome) = self.publish_event(draft).await?;
        if let Outcome::KickResolved(removal) = outcome {
            if let Err(e) = self.execute_kick(&removal).await {
                error!(kick = %removal.kick_id, error = %e, "kick execution failed");
            }
        }
        Ok(event)
    }

    /// One publish round trip. Publish failures leave every projection
    /// untouched.
    async fn publish_event(&self, draft: EventDraft) -> Result<(Event, Outcome), PublishError> {
        let local = self
            .keys
            .sign(draft.clone())
            .map_err(|e| PublishError::Signing(e.to_string()))?;
        let id = self.transport.publish(draft).await?;
        let event = if id == local.id {
            local
        } else {
            // The transport signed with different keys; prefer its copy.
            match self.transport.get_event_by_id(&id).await {
                Ok(Some(ev)) => ev,
                _ => {
                    warn!(id = %id, "published event not retrievable, folding local copy");
                    local
                }
            }
        };
        let outcome = self.processor.apply(&event, Source::Optimistic);
        Ok((event, outcome))
    }

    /// Create or update a community definition.
    pub async fn create_community(
        &self,
        d: &str,
        content: &crate::community::CommunityContent,
        members: &[(String, String)],
    ) -> Result<Event, PublishError> {
        let mut tags = vec![Tag(vec!["d".into(), d.to_string()])];
        for (pubkey, role) in members {
            tags.push(Tag(vec!["p".into(), pubkey.clone(), role.clone()]));
        }
        let content =
            serde_json::to_string(content).map_err(|e| PublishError::Signing(e.to_string()))?;
        self.publish_and_fold(EventDraft::new(KIND_COMMUNITY, now_ts(), tags, content))
            .await
    }

    /// Open a proposal in a community.
    pub async fn submit_proposal(
        &self,
        community_id: &str,
        content: &crate::proposal::ProposalContent,
    ) -> Result<Event, PublishError> {
        let body =
            serde_json::to_string(content).map_err(|e| PublishError::Signing(e.to_string()))?;
        let tags = vec![
            Tag(vec!["e".into(), community_id.to_string()]),
            Tag(vec!["d".into(), format!("proposal-{}", now_ts())]),
        ];
        self.publish_and_fold(EventDraft::new(KIND_PROPOSAL, now_ts(), tags, body))
            .await
    }

    /// Cast (or change) a vote on a proposal.
    pub async fn cast_vote(&self, proposal_id: &str, option: u32) -> Result<Event, PublishError> {
        let tags = vec![Tag(vec!["e".into(), proposal_id.to_string()])];
        self.publish_and_fold(EventDraft::new(KIND_VOTE, now_ts(), tags, option.to_string()))
            .await
    }

    /// Open a kick proposal; the local user's vote is implicit.
    pub async fn propose_kick(
        &self,
        community_id: &str,
        target: &str,
        reason: &str,
    ) -> Result<Event, PublishError> {
        let tags = vec![
            Tag(vec!["e".into(), community_id.to_string()]),
            Tag(vec!["p".into(), target.to_string(), "kick".into()]),
        ];
        let content = serde_json::json!({ "reason": reason }).to_string();
        self.publish_and_fold(EventDraft::new(KIND_KICK_PROPOSAL, now_ts(), tags, content))
            .await
    }

    /// Vote in favor of an open kick proposal.
    pub async fn vote_kick(&self, kick_id: &str) -> Result<Event, PublishError> {
        let tags = vec![Tag(vec!["e".into(), kick_id.to_string()])];
        self.publish_and_fold(EventDraft::new(KIND_KICK_VOTE, now_ts(), tags, "1".into()))
            .await
    }

    /// Submit a post to a community's moderation queue.
    pub async fn submit_post(
        &self,
        community_id: &str,
        content: &str,
    ) -> Result<Event, PublishError> {
        let tags = vec![Tag(vec!["a".into(), format!("34550:{community_id}")])];
        self.publish_and_fold(EventDraft::new(KIND_NOTE, now_ts(), tags, content.to_string()))
            .await
    }

    /// Approve a pending post (moderator action).
    pub async fn approve_post(&self, post: &ModeratedPost) -> Result<Event, PublishError> {
        self.resolve_post(post, KIND_POST_APPROVAL, None).await
    }

    /// Reject a pending post (moderator action).
    pub async fn reject_post(
        &self,
        post: &ModeratedPost,
        reason: &str,
    ) -> Result<Event, PublishError> {
        self.resolve_post(post, KIND_POST_REJECTION, Some(reason)).await
    }

    async fn resolve_post(
        &self,
        post: &ModeratedPost,
        kind: u32,
        reason: Option<&str>,
    ) -> Result<Event, PublishError> {
        let tags = vec![
            Tag(vec!["a".into(), format!("34550:{}", post.community_id)]),
            Tag(vec!["e".into(), post.id.clone()]),
            Tag(vec!["p".into(), post.author.clone()]),
            Tag(vec!["k".into(), KIND_NOTE.to_string()]),
        ];
        let mut body = serde_json::json!({
            "id": post.id,
            "content": post.content,
            "pubkey": post.author,
            "created_at": post.created_at,
        });
        if let Some(reason) = reason {
            body["reason"] = serde_json::Value::String(reason.to_string());
        }
        self.publish_and_fold(EventDraft::new(kind, now_ts(), tags, body.to_string()))
            .await
    }

    /// File a content report.
    pub async fn report(
        &self,
        community_id: &str,
        target_id: &str,
        target_type: TargetType,
        reason: &str,
    ) -> Result<Event, PublishError> {
        let marker = match target_type {
            TargetType::Post => "post",
            TargetType::Comment => "comment",
            TargetType::User => "user",
        };
        let tags = vec![
            Tag(vec!["a".into(), format!("34550:{community_id}")]),
            Tag(vec!["e".into(), target_id.to_string(), marker.into()]),
        ];
        let content = serde_json::json!({ "reason": reason, "targetType": marker }).to_string();
        self.publish_and_fold(EventDraft::new(KIND_REPORT, now_ts(), tags, content))
            .await
    }

    /// Close out a report (moderator action).
    pub async fn review_report(
        &self,
        report_id: &str,
        status: ReportStatus,
        resolution: Option<&str>,
    ) -> Result<Event, PublishError> {
        let status = match status {
            ReportStatus::Reviewed => "reviewed",
            ReportStatus::Resolved => "resolved",
            ReportStatus::Dismissed => "dismissed",
            ReportStatus::Pending => return Err(PublishError::Rejected("cannot review to pending".into())),
        };
        let tags = vec![Tag(vec!["e".into(), report_id.to_string()])];
        let mut body = serde_json::json!({ "status": status });
        if let Some(resolution) = resolution {
            body["resolution"] = serde_json::Value::String(resolution.to_string());
        }
        self.publish_and_fold(EventDraft::new(KIND_REPORT_REVIEW, now_ts(), tags, body.to_string()))
            .await
    }

    /// Ban a member, optionally until `expires_at`.
    pub async fn ban_member(
        &self,
        community_id: &str,
        user: &str,
        reason: &str,
        expires_at: Option<u64>,
    ) -> Result<Event, PublishError> {
        let tags = vec![
            Tag(vec!["a".into(), format!("34550:{community_id}")]),
            Tag(vec!["p".into(), user.to_string()]),
        ];
        let mut body = serde_json::json!({ "reason": reason });
        if let Some(exp) = expires_at {
            body["expiresAt"] = serde_json::Value::Number(exp.into());
        }
        self.publish_and_fold(EventDraft::new(KIND_BAN, now_ts(), tags, body.to_string()))
            .await
    }

    /// Lift all active bans on a user in a community.
    pub async fn unban_member(
        &self,
        community_id: &str,
        user: &str,
    ) -> Result<Event, PublishError> {
        let tags = vec![
            Tag(vec!["a".into(), format!("34550:{community_id}")]),
            Tag(vec!["p".into(), user.to_string()]),
        ];
        self.publish_and_fold(EventDraft::new(KIND_UNBAN, now_ts(), tags, String::new()))
            .await
    }
}
