//! Nostr event model and the governance kind table.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Community definition (NIP-72 addressable event).
pub const KIND_COMMUNITY: u32 = 34550;
/// Governance proposal within a community.
pub const KIND_PROPOSAL: u32 = 34551;
/// Vote on a proposal; content is the option index.
pub const KIND_VOTE: u32 = 34552;
/// Proposal to remove a member, creator's vote implied.
pub const KIND_KICK_PROPOSAL: u32 = 34554;
/// Vote in favor of an open kick proposal.
pub const KIND_KICK_VOTE: u32 = 34555;
/// Moderator approval of a community post.
pub const KIND_POST_APPROVAL: u32 = 4550;
/// Moderator rejection of a community post.
pub const KIND_POST_REJECTION: u32 = 4551;
/// Report of a post, comment, or user.
pub const KIND_REPORT: u32 = 4553;
/// Moderator ban of a community member.
pub const KIND_BAN: u32 = 4556;
/// Lift of an earlier ban.
pub const KIND_UNBAN: u32 = 4557;
/// Moderator disposition of a content report.
pub const KIND_REPORT_REVIEW: u32 = 4558;
/// Plain text note; a community `a` tag marks it as a post submission.
pub const KIND_NOTE: u32 = 1;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element is the tag name and the rest hold data. The governance
/// protocol leans on:
///
/// - `d` – unique identifier for addressable events
/// - `e` – reference to another event by id
/// - `p` – member/author public key, with an optional role in the 3rd slot
/// - `a` – addressable reference such as `34550:<communityId>`
///
/// Tags are stored verbatim so unknown or extended tags survive round trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (`d`, `e`, `p`, ...), empty string for malformed tags.
    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// First data element after the name, if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Third element, used for roles (`moderator`, `banned`, `kick`) and
    /// report target types.
    pub fn marker(&self) -> Option<&str> {
        self.0.get(2).map(String::as_str)
    }
}

/// Signed Nostr event as delivered by relays.
///
/// ```json
/// {
///   "id": "aa11…",
///   "pubkey": "bb22…",
///   "kind": 34550,
///   "created_at": 1700000000,
///   "tags": [["d", "rustaceans"], ["p", "cc33…", "moderator"]],
///   "content": "{\"name\":\"Rustaceans\"}",
///   "sig": "dd44…"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical array).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number from the table above.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Tags such as `d`, `e`, `p`, `a`.
    pub tags: Vec<Tag>,
    /// Kind-specific content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the named tag.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == name)
            .and_then(Tag::value)
    }

    /// All tags with the given name.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> {
        self.tags.iter().filter(move |t| t.name() == name)
    }

    /// Community id from an `a` tag of the form `34550:<communityId>`.
    pub fn community_ref(&self) -> Option<&str> {
        self.tags_named("a")
            .filter_map(Tag::value)
            .find_map(|v| v.strip_prefix("34550:"))
    }
}

/// Unsigned event as produced by the write path; the signer fills in
/// `id`/`pubkey`/`sig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    pub fn new(kind: u32, created_at: u64, tags: Vec<Tag>, content: String) -> Self {
        Self {
            kind,
            created_at,
            tags,
            content,
        }
    }
}

/// Compute the canonical Nostr event hash over `[0, pubkey, created_at, kind,
/// tags, content]`.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's id and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}

/// Signing identity for local writes.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    pubkey: String,
}

impl Keys {
    /// Build from a 32-byte hex secret key.
    pub fn from_secret_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)?;
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&bytes)?;
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Self { keypair, pubkey })
    }

    /// Hex x-only public key.
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Sign a draft, producing a complete event.
    pub fn sign(&self, draft: EventDraft) -> Result<Event> {
        let hash = event_hash(
            &self.pubkey,
            draft.created_at,
            draft.kind,
            &draft.tags,
            &draft.content,
        )?;
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey.clone(),
            kind: draft.kind,
            created_at: draft.created_at,
            tags: draft.tags,
            content: draft.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

/// Current Unix timestamp in seconds.
pub fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Keys {
        Keys::from_secret_hex(&"01".repeat(32)).unwrap()
    }

    #[test]
    fn tag_accessors() {
        let pk = "ab".repeat(32);
        let tag = Tag(vec!["p".into(), pk.clone(), "moderator".into()]);
        assert_eq!(tag.name(), "p");
        assert_eq!(tag.value(), Some(pk.as_str()));
        assert_eq!(tag.marker(), Some("moderator"));
        assert_eq!(Tag(vec![]).name(), "");
        assert_eq!(Tag(vec!["d".into()]).value(), None);
    }

    #[test]
    fn community_ref_from_a_tag() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: KIND_POST_APPROVAL,
            created_at: 1,
            tags: vec![
                Tag(vec!["e".into(), "post".into()]),
                Tag(vec!["a".into(), "34550:creator:slug".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.community_ref(), Some("creator:slug"));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = keys();
        let draft = EventDraft::new(
            KIND_VOTE,
            100,
            vec![Tag(vec!["e".into(), "aa".repeat(32)])],
            "1".into(),
        );
        let ev = keys.sign(draft).unwrap();
        assert_eq!(ev.pubkey.len(), 64);
        assert_eq!(ev.id.len(), 64);
        assert_eq!(ev.sig.len(), 128);
        verify_event(&ev).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let keys = keys();
        let mut ev = keys
            .sign(EventDraft::new(KIND_NOTE, 1, vec![], "hello".into()))
            .unwrap();
        ev.content = "tampered".into();
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn verify_rejects_id_mismatch() {
        let keys = keys();
        let mut ev = keys
            .sign(EventDraft::new(KIND_NOTE, 1, vec![], "hello".into()))
            .unwrap();
        ev.id.replace_range(0..2, "ff");
        assert!(verify_event(&ev).is_err());
    }

    #[test]
    fn event_hash_matches_reference() {
        let pubkey = "00".repeat(32);
        let expected = {
            let obj = serde_json::json!([0, pubkey, 1, KIND_NOTE, Vec::<Tag>::new(), ""]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let bytes = hasher.finalize();
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&pubkey, 1, KIND_NOTE, &[], "").unwrap(), expected);
    }
}
