//! Device firmware catalog client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};
use crate::transport::{HttpClient, classify};

/// Default catalog endpoint; the device model is appended
pub const DEFAULT_CATALOG_URL: &str = "https://api.ipsw.me/v4/device/";

/// One downloadable firmware archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRecord {
    /// Device class (e.g. `iPhone9,1`)
    pub identifier: String,
    /// Dotted version string
    pub version: String,
    /// Build id
    pub buildid: String,
    /// SHA-1 of the archive
    pub sha1sum: String,
    /// MD5 of the archive
    pub md5sum: String,
    /// Archive size in bytes
    pub filesize: u64,
    /// Download URL
    pub url: String,
    #[serde(default)]
    pub releasedate: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uploaddate: Option<DateTime<Utc>>,
    /// Whether the firmware is still being signed
    pub signed: bool,
}

impl FirmwareRecord {
    /// Deterministic local file name for the archive
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}.ipsw", self.identifier, self.version)
    }

    /// Leading numeric component of the version
    pub fn major_version(&self) -> Option<u32> {
        self.version.split('.').next()?.trim().parse().ok()
    }
}

/// Catalog document for one device model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    pub name: String,
    pub identifier: String,
    /// Newest first
    pub firmwares: Vec<FirmwareRecord>,
    pub boardconfig: String,
    pub platform: String,
    pub cpid: u64,
    pub bdid: u64,
}

impl DeviceCatalog {
    /// Drop the `n` oldest firmwares
    pub fn drop_oldest(&mut self, n: usize) {
        let keep = self.firmwares.len().saturating_sub(n);
        self.firmwares.truncate(keep);
    }
}

/// Client for the per-device catalog endpoint
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: HttpClient,
    base_url: String,
}

impl CatalogClient {
    /// Create a client against `base_url` (must end with `/`)
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Fetch the firmware catalog for a device model
    pub async fn device(&self, model: &str) -> Result<DeviceCatalog> {
        let url = url::Url::parse(&self.base_url)?.join(model)?;
        debug!("Fetching catalog {}", url);

        let response = self
            .http
            .get(url.as_str())
            .query(&[("type", "ipsw")])
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            return Err(ProtocolError::HttpStatus(response.status()));
        }

        let body = response.bytes().await.map_err(classify)?;
        let catalog: DeviceCatalog = serde_json::from_slice(&body)?;
        info!(
            "Catalog for {} lists {} firmwares",
            catalog.identifier,
            catalog.firmwares.len()
        );
        Ok(catalog)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(version: &str) -> FirmwareRecord {
        FirmwareRecord {
            identifier: "iPhone9,1".to_string(),
            version: version.to_string(),
            buildid: "20H240".to_string(),
            sha1sum: String::new(),
            md5sum: String::new(),
            filesize: 0,
            url: String::new(),
            releasedate: None,
            uploaddate: None,
            signed: false,
        }
    }

    #[test]
    fn test_parse_record_with_null_dates() {
        let json = r#"{
            "identifier": "iPhone9,1",
            "version": "15.8.3",
            "buildid": "19H386",
            "sha1sum": "abc",
            "md5sum": "def",
            "filesize": 123,
            "url": "https://updates.cdn-apple.com/fw.ipsw",
            "releasedate": "2024-07-29T17:03:11Z",
            "uploaddate": null,
            "signed": true
        }"#;

        let parsed: FirmwareRecord = serde_json::from_str(json).expect("Operation should succeed");
        assert_eq!(parsed.version, "15.8.3");
        assert!(parsed.releasedate.is_some());
        assert!(parsed.uploaddate.is_none());
        assert!(parsed.signed);
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(record("16.7.10").archive_file_name(), "iPhone9,1-16.7.10.ipsw");
    }

    #[test]
    fn test_major_version() {
        assert_eq!(record("16.7.10").major_version(), Some(16));
        assert_eq!(record("9").major_version(), Some(9));
        assert_eq!(record("beta").major_version(), None);
    }

    #[test]
    fn test_drop_oldest() {
        let mut catalog = DeviceCatalog {
            name: "iPhone 7".to_string(),
            identifier: "iPhone9,1".to_string(),
            firmwares: vec![record("3"), record("2"), record("1")],
            boardconfig: "d10ap".to_string(),
            platform: "t8010".to_string(),
            cpid: 32784,
            bdid: 8,
        };

        catalog.drop_oldest(1);
        let versions: Vec<_> = catalog.firmwares.iter().map(|f| f.version.as_str()).collect();
        assert_eq!(versions, vec!["3", "2"]);

        catalog.drop_oldest(10);
        assert!(catalog.firmwares.is_empty());
    }
}
