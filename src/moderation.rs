//! Post approval state machine, content reports, and member bans.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{
    Event, KIND_BAN, KIND_NOTE, KIND_POST_APPROVAL, KIND_POST_REJECTION, KIND_REPORT,
    KIND_REPORT_REVIEW, KIND_UNBAN,
};
use crate::processor::Outcome;

/// Where a post sits in its one-way `Pending -> {Approved | Rejected}` walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Approved {
        moderator: String,
        approved_at: u64,
    },
    Rejected {
        moderator: String,
        rejected_at: u64,
        reason: Option<String>,
    },
}

impl PostStatus {
    /// Approved and Rejected are terminal; there is no un-approve.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PostStatus::Pending)
    }
}

/// One community post under moderation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeratedPost {
    pub id: String,
    pub community_id: String,
    pub author: String,
    pub content: String,
    pub title: Option<String>,
    pub created_at: u64,
    pub status: PostStatus,
}

/// What a content report points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Post,
    Comment,
    User,
}

impl TargetType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "post" => Some(Self::Post),
            "comment" => Some(Self::Comment),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Review disposition of a report; `Pending` until exactly one review lands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Reviewed,
    Resolved,
    Dismissed,
}

/// A report filed against a post, comment, or user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentReport {
    pub id: String,
    pub community_id: String,
    pub reporter: String,
    pub target_id: String,
    pub target_type: TargetType,
    pub category: Option<String>,
    pub reason: String,
    pub status: ReportStatus,
    pub reviewed_by: Option<String>,
    pub resolution: Option<String>,
}

/// A moderator ban. Expiry is evaluated at read time, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberBan {
    pub id: String,
    pub community_id: String,
    pub banned_user: String,
    pub moderator: String,
    pub reason: Option<String>,
    pub banned_at: u64,
    pub expires_at: Option<u64>,
    pub revoked: bool,
}

impl MemberBan {
    /// Active unless explicitly revoked or past its expiry.
    pub fn is_active(&self, now: u64) -> bool {
        !self.revoked && self.expires_at.map_or(true, |exp| now <= exp)
    }
}

#[derive(Deserialize)]
struct SubmissionBody {
    title: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddedPost {
    content: Option<String>,
    pubkey: Option<String>,
    title: Option<String>,
    created_at: Option<u64>,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody {
    reason: String,
    target_type: String,
    category: Option<String>,
}

#[derive(Deserialize)]
struct ReviewBody {
    status: String,
    resolution: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanBody {
    reason: Option<String>,
    expires_at: Option<u64>,
}

/// Keyed stores for posts, reports, and bans.
#[derive(Default)]
pub struct ModerationStore {
    posts: DashMap<String, ModeratedPost>,
    reports: DashMap<String, ContentReport>,
    bans: DashMap<String, MemberBan>,
}

impl ModerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a post submission into a `Pending` record; duplicate ids keep
    /// the first submission.
    pub fn apply_submission(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_NOTE {
            return Outcome::Ignored;
        }
        let Some(community_id) = ev.community_ref() else {
            return Outcome::Ignored;
        };
        match self.posts.entry(ev.id.clone()) {
            dashmap::Entry::Occupied(_) => Outcome::Ignored,
            dashmap::Entry::Vacant(slot) => {
                let (title, content) = match serde_json::from_str::<SubmissionBody>(&ev.content) {
                    Ok(body) => (body.title, body.content.unwrap_or_else(|| ev.content.clone())),
                    Err(_) => (None, ev.content.clone()),
                };
                slot.insert(ModeratedPost {
                    id: ev.id.clone(),
                    community_id: community_id.to_string(),
                    author: ev.pubkey.clone(),
                    content,
                    title,
                    created_at: ev.created_at,
                    status: PostStatus::Pending,
                });
                debug!(post = %ev.id, "post pending moderation");
                Outcome::Applied
            }
        }
    }

    /// Fold an approval or rejection. Resolved posts are final; a resolution
    /// arriving before its submission materializes the record from the
    /// embedded post JSON.
    pub fn apply_resolution(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_POST_APPROVAL && ev.kind != KIND_POST_REJECTION {
            return Outcome::Ignored;
        }
        let Some(community_id) = ev.community_ref() else {
            return Outcome::Ignored;
        };
        let Some(post_id) = ev.tag_value("e") else {
            return Outcome::Ignored;
        };
        let embedded: EmbeddedPost = match serde_json::from_str(&ev.content) {
            Ok(p) => p,
            Err(_) => return Outcome::Ignored,
        };
        let status = if ev.kind == KIND_POST_APPROVAL {
            PostStatus::Approved {
                moderator: ev.pubkey.clone(),
                approved_at: ev.created_at,
            }
        } else {
            PostStatus::Rejected {
                moderator: ev.pubkey.clone(),
                rejected_at: ev.created_at,
                reason: embedded.reason.clone(),
            }
        };
        match self.posts.entry(post_id.to_string()) {
            dashmap::Entry::Occupied(mut existing) => {
                if existing.get().status.is_terminal() {
                    debug!(post = %post_id, "resolution for already resolved post ignored");
                    return Outcome::Ignored;
                }
                existing.get_mut().status = status;
                Outcome::Applied
            }
            dashmap::Entry::Vacant(slot) => {
                let author = embedded
                    .pubkey
                    .or_else(|| ev.tag_value("p").map(String::from))
                    .unwrap_or_default();
                slot.insert(ModeratedPost {
                    id: post_id.to_string(),
                    community_id: community_id.to_string(),
                    author,
                    content: embedded.content.unwrap_or_default(),
                    title: embedded.title,
                    created_at: embedded.created_at.unwrap_or(ev.created_at),
                    status,
                });
                Outcome::Applied
            }
        }
    }

    /// Fold a content report into a `pending` record.
    pub fn apply_report(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_REPORT {
            return Outcome::Ignored;
        }
        let Some(community_id) = ev.community_ref().or_else(|| ev.tag_value("a")) else {
            return Outcome::Ignored;
        };
        let Some(target_tag) = ev.tags_named("e").next() else {
            return Outcome::Ignored;
        };
        let Some(target_id) = target_tag.value() else {
            return Outcome::Ignored;
        };
        let body: ReportBody = match serde_json::from_str(&ev.content) {
            Ok(b) => b,
            Err(_) => return Outcome::Ignored,
        };
        let target_type = TargetType::parse(&body.target_type)
            .or_else(|| target_tag.marker().and_then(TargetType::parse));
        let Some(target_type) = target_type else {
            return Outcome::Ignored;
        };
        match self.reports.entry(ev.id.clone()) {
            dashmap::Entry::Occupied(_) => Outcome::Ignored,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(ContentReport {
                    id: ev.id.clone(),
                    community_id: community_id.to_string(),
                    reporter: ev.pubkey.clone(),
                    target_id: target_id.to_string(),
                    target_type,
                    category: body.category,
                    reason: body.reason,
                    status: ReportStatus::Pending,
                    reviewed_by: None,
                    resolution: None,
                });
                Outcome::Applied
            }
        }
    }

    /// Fold a report review; only a pending report moves, exactly once.
    pub fn apply_report_review(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_REPORT_REVIEW {
            return Outcome::Ignored;
        }
        let Some(report_id) = ev.tag_value("e") else {
            return Outcome::Ignored;
        };
        let body: ReviewBody = match serde_json::from_str(&ev.content) {
            Ok(b) => b,
            Err(_) => return Outcome::Ignored,
        };
        let status = match body.status.as_str() {
            "reviewed" => ReportStatus::Reviewed,
            "resolved" => ReportStatus::Resolved,
            "dismissed" => ReportStatus::Dismissed,
            other => {
                warn!(report = %report_id, status = other, "unknown review status");
                return Outcome::Ignored;
            }
        };
        let Some(mut report) = self.reports.get_mut(report_id) else {
            return Outcome::Ignored;
        };
        if report.status != ReportStatus::Pending {
            return Outcome::Ignored;
        }
        report.status = status;
        report.reviewed_by = Some(ev.pubkey.clone());
        report.resolution = body.resolution;
        Outcome::Applied
    }

    /// Fold a ban; keyed by event id, first-writer-wins.
    pub fn apply_ban(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_BAN {
            return Outcome::Ignored;
        }
        let Some(community_id) = ev.community_ref().or_else(|| ev.tag_value("a")) else {
            return Outcome::Ignored;
        };
        let Some(user) = ev.tag_value("p") else {
            return Outcome::Ignored;
        };
        let body: BanBody = serde_json::from_str(&ev.content).unwrap_or(BanBody {
            reason: None,
            expires_at: None,
        });
        match self.bans.entry(ev.id.clone()) {
            dashmap::Entry::Occupied(_) => Outcome::Ignored,
            dashmap::Entry::Vacant(slot) => {
                slot.insert(MemberBan {
                    id: ev.id.clone(),
                    community_id: community_id.to_string(),
                    banned_user: user.to_string(),
                    moderator: ev.pubkey.clone(),
                    reason: body.reason,
                    banned_at: ev.created_at,
                    expires_at: body.expires_at,
                    revoked: false,
                });
                Outcome::Applied
            }
        }
    }

    /// Fold an unban: an `e` tag revokes that ban, otherwise every ban on
    /// the `p`-tagged user in the referenced community is revoked.
    pub fn apply_unban(&self, ev: &Event) -> Outcome {
        if ev.kind != KIND_UNBAN {
            return Outcome::Ignored;
        }
        if let Some(ban_id) = ev.tag_value("e") {
            if let Some(mut ban) = self.bans.get_mut(ban_id) {
                if ban.revoked {
                    return Outcome::Ignored;
                }
                ban.revoked = true;
                return Outcome::Applied;
            }
            return Outcome::Ignored;
        }
        let Some(user) = ev.tag_value("p") else {
            return Outcome::Ignored;
        };
        let community = ev.community_ref().or_else(|| ev.tag_value("a"));
        let mut revoked_any = false;
        for mut ban in self.bans.iter_mut() {
            if ban.banned_user == user
                && !ban.revoked
                && community.map_or(true, |c| ban.community_id == c)
            {
                ban.revoked = true;
                revoked_any = true;
            }
        }
        if revoked_any {
            Outcome::Applied
        } else {
            Outcome::Ignored
        }
    }

    pub fn get_post(&self, id: &str) -> Option<ModeratedPost> {
        self.posts.get(id).map(|p| p.clone())
    }

    pub fn get_report(&self, id: &str) -> Option<ContentReport> {
        self.reports.get(id).map(|r| r.clone())
    }

    pub fn get_ban(&self, id: &str) -> Option<MemberBan> {
        self.bans.get(id).map(|b| b.clone())
    }

    /// Posts for a community, optionally only pending ones.
    pub fn posts_for(&self, community_id: &str, pending_only: bool) -> Vec<ModeratedPost> {
        self.posts
            .iter()
            .filter(|p| p.community_id == community_id)
            .filter(|p| !pending_only || p.status == PostStatus::Pending)
            .map(|p| p.clone())
            .collect()
    }

    /// Whether the user has an active ban in the community at `now`.
    pub fn is_banned(&self, community_id: &str, user: &str, now: u64) -> bool {
        self.bans.iter().any(|b| {
            b.community_id == community_id && b.banned_user == user && b.is_active(now)
        })
    }
}
