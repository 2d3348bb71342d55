//! Reconciliation engine for community governance over Nostr relays.
//!
//! Relays are treated as dumb ordered-ish event logs; every projection here
//! (communities, proposals, kicks, moderation state) is a deterministic fold
//! over signed events, tolerant of duplicates, replays, and out-of-order
//! delivery.

pub mod community;
pub mod config;
pub mod event;
pub mod kick;
pub mod moderation;
pub mod processor;
pub mod proposal;
pub mod transport;
pub mod validate;
