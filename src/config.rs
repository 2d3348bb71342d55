//! Configuration loading from `.env` files.

use std::env;

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays to subscribe to and publish through.
    pub relays: Vec<String>,
    /// Hex-encoded secret key for signing writes. Optional: read-only
    /// commands work without one.
    pub secret_key: Option<String>,
    /// Optional Tor SOCKS proxy (host:port) for `.onion` relays.
    pub tor_socks: Option<String>,
    /// Optional community ids to restrict the live subscription to.
    pub filter_communities: Option<Vec<String>>,
    /// Strategy for the `since` value on live subscriptions.
    pub since_mode: SinceMode,
}

/// Determines the starting timestamp for live subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum SinceMode {
    /// Start from now.
    Live,
    /// Start from a fixed Unix timestamp (backfill).
    Fixed(u64),
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays = csv_strings(env::var("RELAYS").context("RELAYS is required")?);
        if relays.is_empty() {
            anyhow::bail!("RELAYS must name at least one relay");
        }
        let secret_key = env::var("SECRET_KEY").ok().filter(|s| !s.is_empty());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let filter_communities = env::var("FILTER_COMMUNITIES").ok().and_then(|s| {
            let v = csv_strings(s);
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        });
        let since_str = env::var("SINCE_MODE").unwrap_or_else(|_| "live".into());
        let since_mode = if let Some(rest) = since_str.strip_prefix("fixed:") {
            SinceMode::Fixed(rest.parse().unwrap_or(0))
        } else {
            SinceMode::Live
        };
        Ok(Self {
            relays,
            secret_key,
            tor_socks,
            filter_communities,
            since_mode,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
