//! Identifier and path formats
//!
//! - Volume handles: `file://<disk-object-id>`, bare ids accepted on input
//! - Datastore paths: `[datastore] relative/path.vmdk`
//! - TLS thumbprints: SHA-256 of the DER leaf certificate as 32 colon-separated
//!   uppercase hex pairs

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Scheme emitted on every volume handle
pub const VOLUME_HANDLE_SCHEME: &str = "file";

/// Length of a rendered SHA-256 thumbprint (32 pairs + 31 colons)
pub const THUMBPRINT_LEN: usize = 95;

// =============================================================================
// Volume Handles
// =============================================================================

/// Extract the disk-object id from a volume handle
pub fn parse_volume_handle(handle: &str) -> Result<String> {
    let id = match handle.split_once("://") {
        Some((scheme, id)) if !scheme.is_empty() => id,
        Some(_) => return Err(Error::InvalidVolumeHandle(handle.to_string())),
        None => handle,
    };

    if id.trim().is_empty() {
        return Err(Error::InvalidVolumeHandle(handle.to_string()));
    }
    Ok(id.to_string())
}

/// Render a disk-object id as a volume handle
pub fn build_volume_handle(id: &str) -> String {
    format!("{}://{}", VOLUME_HANDLE_SCHEME, id)
}

// =============================================================================
// Datastore Paths
// =============================================================================

/// A file path on a named datastore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            path: path.into(),
        }
    }
}

impl FromStr for DatastorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix('[')
            .ok_or_else(|| Error::InvalidPathFormat(s.to_string()))?;
        let (datastore, path) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidPathFormat(s.to_string()))?;

        if datastore.is_empty() || datastore.contains('[') || path.contains(']') {
            return Err(Error::InvalidPathFormat(s.to_string()));
        }

        Ok(Self {
            datastore: datastore.to_string(),
            path: path.trim_start().to_string(),
        })
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

// =============================================================================
// TLS Thumbprints
// =============================================================================

/// SHA-256 thumbprint of a DER-encoded certificate
pub fn thumbprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Check that a configured thumbprint has the SHA-256 shape and return it
/// as uppercase hex pairs
pub fn validate_thumbprint(value: &str) -> Result<String> {
    let well_formed = value.len() == THUMBPRINT_LEN
        && value.split(':').count() == 32
        && value
            .split(':')
            .all(|pair| pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit()));

    if well_formed {
        Ok(value.to_ascii_uppercase())
    } else {
        Err(Error::Configuration(format!(
            "malformed SHA-256 thumbprint: {:?}",
            value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_handle_round_trip() {
        for id in ["fcd-12345", "5f6a-0e1c-4b5d", "a://nested", "with space"] {
            assert_eq!(parse_volume_handle(&build_volume_handle(id)).unwrap(), id);
        }
    }

    #[test]
    fn test_parse_volume_handle_forms() {
        assert_eq!(parse_volume_handle("file://fcd-12345").unwrap(), "fcd-12345");
        assert_eq!(parse_volume_handle("fcd-12345").unwrap(), "fcd-12345");
        assert_eq!(parse_volume_handle("cns://abc").unwrap(), "abc");
        assert_matches!(parse_volume_handle("file://"), Err(Error::InvalidVolumeHandle(_)));
        assert_matches!(parse_volume_handle("://abc"), Err(Error::InvalidVolumeHandle(_)));
        assert_matches!(parse_volume_handle(""), Err(Error::InvalidVolumeHandle(_)));
    }

    #[test]
    fn test_datastore_path_parse() {
        let path: DatastorePath = "[vsanDatastore] fcd/disk-1.vmdk".parse().unwrap();
        assert_eq!(path.datastore, "vsanDatastore");
        assert_eq!(path.path, "fcd/disk-1.vmdk");
        assert_eq!(path.to_string(), "[vsanDatastore] fcd/disk-1.vmdk");

        let root: DatastorePath = "[ds1]".parse().unwrap();
        assert_eq!(root.path, "");
    }

    #[test]
    fn test_datastore_path_malformed() {
        for bad in ["ds1 disk.vmdk", "[ds1 disk.vmdk", "[] disk.vmdk", "[a[b] x", "[a] x]y"] {
            assert_matches!(bad.parse::<DatastorePath>(), Err(Error::InvalidPathFormat(_)));
        }
    }

    #[test]
    fn test_thumbprint_format() {
        let tp = thumbprint(b"not really a certificate");
        assert_eq!(tp.len(), THUMBPRINT_LEN);
        assert_eq!(tp, tp.to_uppercase());
        assert_eq!(validate_thumbprint(&tp).unwrap(), tp);

        // SHA-256 of the empty input
        assert!(thumbprint(b"").starts_with("E3:B0:C4:42:98:FC"));
    }

    #[test]
    fn test_validate_thumbprint_rejects_sha1() {
        let sha1 = "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01";
        assert!(validate_thumbprint(sha1).is_err());
        assert!(validate_thumbprint(&"ZZ:".repeat(31)).is_err());
    }

    #[test]
    fn test_validate_thumbprint_uppercases_pairs() {
        let tp = thumbprint(b"leaf");
        assert_eq!(validate_thumbprint(&tp.to_lowercase()).unwrap(), tp);
    }
}
