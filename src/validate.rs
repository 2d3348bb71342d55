//! Structural validation of governance events before folding.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::{
    Event, Tag, KIND_BAN, KIND_COMMUNITY, KIND_KICK_PROPOSAL, KIND_KICK_VOTE, KIND_NOTE,
    KIND_POST_APPROVAL, KIND_POST_REJECTION, KIND_PROPOSAL, KIND_REPORT, KIND_REPORT_REVIEW,
    KIND_UNBAN, KIND_VOTE,
};

/// Outcome of validating a single event. `errors` make the event unusable;
/// `warnings` are advisory and never block folding.
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub event_type: &'static str,
}

struct Checker {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Checker {
    fn new() -> Self {
        Self {
            errors: vec![],
            warnings: vec![],
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn finish(self, event_type: &'static str) -> Validation {
        Validation {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            event_type,
        }
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Validate one event against its kind's structural rules.
///
/// Pure and infallible: malformed input is reported through `errors`, never a
/// panic or an `Err`.
pub fn validate(ev: &Event) -> Validation {
    let mut c = Checker::new();

    // Identity fields are fixed-width hex regardless of kind.
    if !is_hex(&ev.id, 64) {
        c.error("id must be 64 hex chars");
    }
    if !is_hex(&ev.pubkey, 64) {
        c.error("pubkey must be 64 hex chars");
    }
    if !is_hex(&ev.sig, 128) {
        c.error("sig must be 128 hex chars");
    }

    match ev.kind {
        KIND_COMMUNITY => {
            match ev.tag_value("d") {
                Some(d) if !d.is_empty() => {}
                Some(_) => c.error("d tag must not be empty"),
                None => c.error("missing d tag"),
            }
            let members: Vec<&Tag> = ev.tags_named("p").collect();
            if members.is_empty() {
                c.error("community definition requires at least one p tag");
            }
            for tag in members {
                if let Some(pk) = tag.value() {
                    if !is_hex(pk, 64) {
                        c.warn(format!("p tag {pk:.16} is not a 64-hex pubkey"));
                    }
                } else {
                    c.warn("p tag missing pubkey value");
                }
            }
            match content_object(ev) {
                Some(obj) => {
                    if obj
                        .get("name")
                        .and_then(Value::as_str)
                        .map_or(true, str::is_empty)
                    {
                        c.error("content must include a non-empty name");
                    }
                }
                None => c.error("content must be a JSON object"),
            }
            c.finish("community_definition")
        }
        KIND_PROPOSAL => {
            match ev.tag_value("e") {
                Some(id) if is_hex(id, 64) => {}
                Some(_) => c.error("e tag must reference a community by 64-hex id"),
                None => c.error("missing e tag referencing the community"),
            }
            if ev.tag_value("d").is_none() {
                c.error("missing d tag (proposal identifier)");
            }
            match content_object(ev) {
                Some(obj) => {
                    if obj.get("title").and_then(Value::as_str).is_none() {
                        c.error("content must include a string title");
                    }
                    match obj.get("options").and_then(Value::as_array) {
                        Some(opts) if opts.len() >= 2 => {}
                        Some(_) => c.error("options must contain at least 2 entries"),
                        None => c.error("content must include an options array"),
                    }
                    if let Some(ends) = obj.get("endsAt") {
                        match ends.as_u64() {
                            Some(ts) if ts > ev.created_at => {}
                            Some(_) => c.warn("endsAt is not after created_at"),
                            None => c.warn("endsAt must be a number"),
                        }
                    }
                }
                None => c.error("content must be a JSON object"),
            }
            c.finish("proposal")
        }
        KIND_VOTE => {
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the proposal");
            }
            if ev.content.trim().parse::<u32>().is_err() {
                c.error("content must be a non-negative integer option index");
            }
            c.finish("vote")
        }
        KIND_KICK_PROPOSAL => {
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the community");
            }
            let target = ev
                .tags_named("p")
                .find(|t| t.marker() == Some("kick"))
                .and_then(Tag::value);
            if target.is_none() {
                c.error("missing p tag with kick marker");
            }
            if content_object(ev)
                .and_then(|obj| obj.get("reason").cloned())
                .is_none()
            {
                c.warn("content should include a reason");
            }
            c.finish("kick_proposal")
        }
        KIND_KICK_VOTE => {
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the kick proposal");
            }
            if ev.content.trim() != "1" {
                c.warn("content should be \"1\"");
            }
            c.finish("kick_vote")
        }
        KIND_POST_APPROVAL | KIND_POST_REJECTION => {
            if ev.community_ref().is_none() {
                c.error("missing a tag of the form 34550:<communityId>");
            }
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the post");
            }
            if ev.tag_value("p").is_none() {
                c.error("missing p tag referencing the author");
            }
            match content_object(ev) {
                Some(obj) => {
                    for field in ["id", "content", "pubkey"] {
                        if obj.get(field).is_none() {
                            c.error(format!("content must embed the original post {field}"));
                        }
                    }
                }
                None => c.error("content must embed the original post JSON"),
            }
            if ev.kind == KIND_POST_APPROVAL {
                c.finish("post_approval")
            } else {
                c.finish("post_rejection")
            }
        }
        KIND_REPORT => {
            if ev.tag_value("a").is_none() {
                c.error("missing a tag referencing the community");
            }
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the target");
            }
            match content_object(ev) {
                Some(obj) => {
                    if obj.get("reason").and_then(Value::as_str).is_none() {
                        c.error("content must include a string reason");
                    }
                    match obj.get("targetType").and_then(Value::as_str) {
                        Some("post" | "comment" | "user") => {}
                        Some(other) => c.error(format!("unknown targetType {other}")),
                        None => c.error("content must include a targetType"),
                    }
                }
                None => c.error("content must be a JSON object"),
            }
            c.finish("report")
        }
        KIND_REPORT_REVIEW => {
            if ev.tag_value("e").is_none() {
                c.error("missing e tag referencing the report");
            }
            match content_object(ev).and_then(|obj| {
                obj.get("status")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }) {
                Some(status) if matches!(status.as_str(), "reviewed" | "resolved" | "dismissed") => {
                }
                Some(other) => c.error(format!("unknown review status {other}")),
                None => c.error("content must include a review status"),
            }
            c.finish("report_review")
        }
        KIND_BAN => {
            if ev.tag_value("a").is_none() {
                c.error("missing a tag referencing the community");
            }
            if ev.tag_value("p").is_none() {
                c.error("missing p tag referencing the banned user");
            }
            if content_object(ev)
                .and_then(|obj| obj.get("reason").cloned())
                .is_none()
            {
                c.warn("content should include a reason");
            }
            c.finish("ban")
        }
        KIND_UNBAN => {
            if ev.tag_value("p").is_none() && ev.tag_value("e").is_none() {
                c.error("unban requires a p tag (user) or e tag (ban)");
            }
            c.finish("unban")
        }
        KIND_NOTE => {
            if ev.community_ref().is_none() {
                c.error("post submission requires a community a tag");
            }
            c.finish("post")
        }
        _ => {
            c.error("unsupported kind");
            c.finish("unknown")
        }
    }
}

fn content_object(ev: &Event) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(&ev.content) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Per-kind tallies for a batch of validated events.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub valid: usize,
    /// kind -> (valid, invalid)
    pub per_kind: BTreeMap<u32, (usize, usize)>,
}

impl BatchReport {
    /// Fraction of events that validated cleanly; 1.0 for an empty batch.
    pub fn compliance_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.valid as f64 / self.total as f64
        }
    }
}

/// Validate a batch and aggregate per-kind counts. Diagnostics only; folding
/// runs its own defensive checks.
pub fn validate_batch(events: &[Event]) -> BatchReport {
    let mut report = BatchReport::default();
    for ev in events {
        let v = validate(ev);
        report.total += 1;
        let entry = report.per_kind.entry(ev.kind).or_default();
        if v.valid {
            report.valid += 1;
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }
    report
}
