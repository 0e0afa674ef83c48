//! Legacy image key lookup
//!
//! Keys for legacy encrypted images are published on per-build reference
//! pages. The page for a build is addressed by build train, build id and
//! device identifier; the root filesystem key sits in a `code` element with
//! a fixed id.

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::transport::{HttpClient, classify};

/// Default key reference site
pub const DEFAULT_KEY_BASE_URL: &str = "https://theapplewiki.com/wiki";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:123.0) Gecko/20100101 Firefox/123.0";

static ROOTFS_KEY: LazyLock<std::result::Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r#"(?s)<code[^>]*\bid\s*=\s*"keypage-rootfs-key"[^>]*>(.*?)</code>"#)
});

static TAG: LazyLock<std::result::Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(r"<[^>]*>"));

/// Source of hex-encoded legacy image keys
#[async_trait]
pub trait KeyLookup: Send + Sync {
    /// Look up the key for one build of one device
    async fn lookup(&self, build_train: &str, build_id: &str, identifier: &str) -> Result<String>;
}

/// Scrapes keys from the public key reference pages
#[derive(Debug, Clone)]
pub struct WikiKeyLookup {
    http: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl WikiKeyLookup {
    /// Create a lookup against `base_url` (no trailing slash)
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Page URL for one build
    pub fn page_url(&self, build_train: &str, build_id: &str, identifier: &str) -> String {
        format!(
            "{}/Keys:{}_{}_({})",
            self.base_url.trim_end_matches('/'),
            build_train,
            build_id,
            identifier
        )
    }
}

#[async_trait]
impl KeyLookup for WikiKeyLookup {
    async fn lookup(&self, build_train: &str, build_id: &str, identifier: &str) -> Result<String> {
        let url = self.page_url(build_train, build_id, identifier);
        debug!("Fetching key page {}", url);

        let response = self
            .http
            .get(&url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.5")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;

        let not_found = || ProtocolError::KeyNotFound {
            build_train: build_train.to_string(),
            build_id: build_id.to_string(),
            identifier: identifier.to_string(),
        };

        match response.status() {
            StatusCode::NOT_FOUND => return Err(not_found()),
            status if !status.is_success() => return Err(ProtocolError::HttpStatus(status)),
            _ => {}
        }

        let html = response.text().await.map_err(classify)?;

        extract_rootfs_key(&html).ok_or_else(not_found)
    }
}

/// Text content of the root filesystem key element, if present and non-empty
pub fn extract_rootfs_key(html: &str) -> Option<String> {
    let element = ROOTFS_KEY.as_ref().ok()?;
    let tag = TAG.as_ref().ok()?;

    let inner = element.captures(html)?.get(1)?.as_str();
    let text = tag.replace_all(inner, "");
    let key = text.trim();

    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_key() {
        let html = r#"<html><body>
            <code id="keypage-rootfs-key">  a1b2c3  </code>
            <code id="keypage-other">nope</code>
        </body></html>"#;
        assert_eq!(extract_rootfs_key(html).as_deref(), Some("a1b2c3"));
    }

    #[test]
    fn test_extract_key_with_attributes_and_markup() {
        let html = r#"<code class="key" id="keypage-rootfs-key" lang="en"><span>dead</span>beef</code>"#;
        assert_eq!(extract_rootfs_key(html).as_deref(), Some("deadbeef"));
    }

    #[test]
    fn test_missing_or_empty_key() {
        assert_eq!(extract_rootfs_key("<code id=\"keypage-kbag\">x</code>"), None);
        assert_eq!(extract_rootfs_key("<code id=\"keypage-rootfs-key\">  </code>"), None);
    }
}
