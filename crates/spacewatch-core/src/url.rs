//! Space URL validation.

use std::fmt;

use crate::error::{Error, Result};

const ALLOWED_HOSTS: [&str; 2] = ["x.com", "twitter.com"];

/// A trimmed, validated Space URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceUrl(String);

impl SpaceUrl {
    /// Accepts `http(s)://` URLs whose host ends with `x.com` or `twitter.com`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = raw.trim();
        let invalid = || Error::InvalidUrl(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        if !matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https") {
            return Err(invalid());
        }
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let host = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host)
            .split(':')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if host.is_empty() || !ALLOWED_HOSTS.iter().any(|h| host.ends_with(h)) {
            return Err(invalid());
        }
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
