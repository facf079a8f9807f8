//! The signed root descriptor (`.cvmfspublished`).
//!
//! One line per field, keyed by the first character:
//!
//! ```text
//! C<root catalog digest>
//! R<md5 of root path>
//! S<revision>
//! D<ttl seconds>
//! T<publication timestamp>
//! N<repository name>
//! H<history database digest>    (optional)
//! --
//! <signature block>             (verified upstream, opaque here)
//! ```
//!
//! Signature verification is treated as a verified-fetch oracle; this
//! module parses what the oracle hands over.

use cvmfs_download::Downloader;
use cvmfs_types::ContentDigest;

use crate::{CatalogError, Result};

/// Well-known URL of the manifest below the repository base.
pub const MANIFEST_NAME: &str = ".cvmfspublished";

/// Parsed manifest fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub catalog_digest: ContentDigest,
    pub root_path_md5: String,
    pub revision: u64,
    pub ttl: u64,
    pub timestamp: i64,
    pub repository_name: String,
    pub history_digest: Option<ContentDigest>,
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| CatalogError::BadManifest("manifest is not UTF-8".into()))?;
        let mut catalog_digest = None;
        let mut root_path_md5 = String::new();
        let mut revision = 0;
        let mut ttl = 0;
        let mut timestamp = 0;
        let mut repository_name = String::new();
        let mut history_digest = None;

        for line in text.lines() {
            if line == "--" {
                break; // signature block
            }
            let (key, value) = match line.split_at_checked(1) {
                Some(split) => split,
                None => continue,
            };
            match key {
                "C" => {
                    catalog_digest = Some(ContentDigest::from_hex(value).map_err(|_| {
                        CatalogError::BadManifest(format!("bad catalog digest {value}"))
                    })?)
                }
                "R" => root_path_md5 = value.to_string(),
                "S" => {
                    revision = value.parse().map_err(|_| {
                        CatalogError::BadManifest(format!("bad revision {value}"))
                    })?
                }
                "D" => {
                    ttl = value
                        .parse()
                        .map_err(|_| CatalogError::BadManifest(format!("bad ttl {value}")))?
                }
                "T" => timestamp = value.parse().unwrap_or(0),
                "N" => repository_name = value.to_string(),
                "H" => history_digest = ContentDigest::from_hex(value).ok(),
                _ => {} // unknown fields are ignored
            }
        }

        let catalog_digest = catalog_digest
            .ok_or_else(|| CatalogError::BadManifest("missing root catalog digest".into()))?;
        if repository_name.is_empty() {
            return Err(CatalogError::BadManifest("missing repository name".into()));
        }
        Ok(Self {
            catalog_digest,
            root_path_md5,
            revision,
            ttl,
            timestamp,
            repository_name,
            history_digest,
        })
    }

    pub fn serialize(&self) -> String {
        let mut out = format!(
            "C{}\nR{}\nS{}\nD{}\nT{}\nN{}\n",
            self.catalog_digest.to_hex(),
            self.root_path_md5,
            self.revision,
            self.ttl,
            self.timestamp,
            self.repository_name,
        );
        if let Some(history) = &self.history_digest {
            out.push_str(&format!("H{}\n", history.to_hex()));
        }
        out.push_str("--\n");
        out
    }

    /// Fetch and parse the manifest of `fqrn`, verifying the embedded
    /// repository name.
    pub fn fetch(download: &dyn Downloader, fqrn: &str) -> Result<Self> {
        let raw = download.fetch_bytes(MANIFEST_NAME)?;
        let manifest = Self::parse(&raw)?;
        if manifest.repository_name != fqrn {
            return Err(CatalogError::WrongRepository {
                expected: fqrn.to_string(),
                actual: manifest.repository_name,
            });
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        Manifest {
            catalog_digest: ContentDigest::from_bytes(b"root catalog"),
            root_path_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            revision: 42,
            ttl: 900,
            timestamp: 1700000000,
            repository_name: "atlas.cern.ch".to_string(),
            history_digest: None,
        }
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let manifest = sample();
        let parsed = Manifest::parse(manifest.serialize().as_bytes()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_signature_block_is_ignored() {
        let raw = format!("{}garbage after separator\nmore garbage\n", sample().serialize());
        let parsed = Manifest::parse(raw.as_bytes()).unwrap();
        assert_eq!(parsed.revision, 42);
    }

    #[test]
    fn test_missing_catalog_digest_rejected() {
        assert!(Manifest::parse(b"Natlas.cern.ch\nS1\n").is_err());
    }

    #[test]
    fn test_unknown_lines_ignored() {
        let raw = format!("X999\n{}", sample().serialize());
        assert!(Manifest::parse(raw.as_bytes()).is_ok());
    }
}
