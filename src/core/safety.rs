//! Path and capability guards applied before any endpoint I/O.
//!
//! Every transfer and every deletion goes through these checks:
//! - Relative paths must stay inside the endpoint root
//! - The endpoint must permit the operation

use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Capability, Endpoint};

/// A path relative to an endpoint root, validated not to escape it.
///
/// A single leading `/` is trimmed, so `"/user/scan.h5"` and
/// `"user/scan.h5"` name the same file. A trailing `/` is preserved: it marks
/// a directory for the movement service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Validate and normalise a relative path
    pub fn parse(raw: &str) -> Result<Self, PathViolation> {
        if raw.contains('\0') {
            return Err(PathViolation::NulByte {
                path: raw.replace('\0', "\\0"),
            });
        }

        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        if trimmed.trim_matches('/').is_empty() {
            return Err(PathViolation::Empty);
        }

        let mut named = false;
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(_) => named = true,
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(PathViolation::Traversal {
                        path: raw.to_string(),
                    })
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathViolation::Absolute {
                        path: raw.to_string(),
                    })
                }
            }
        }

        // "." and "./" name the endpoint root itself
        if !named {
            return Err(PathViolation::Empty);
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the path names a directory (trailing `/`)
    pub fn is_directory(&self) -> bool {
        self.0.ends_with('/')
    }

    /// Final path component without a trailing `/`
    pub fn file_name(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    /// File name without its extension
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        match name.rfind('.') {
            Some(idx) if idx > 0 => &name[..idx],
            _ => name,
        }
    }

    /// Parent folder, empty for top-level files
    pub fn folder(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => &trimmed[..idx],
            None => "",
        }
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = PathViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

/// Check that an endpoint permits an operation
pub fn require_capability(endpoint: &Endpoint, capability: Capability) -> Result<(), PathViolation> {
    if endpoint.can(capability) {
        Ok(())
    } else {
        Err(PathViolation::MissingCapability {
            endpoint: endpoint.name.clone(),
            capability,
        })
    }
}

/// Permanent violations: the request is rejected before any I/O
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathViolation {
    #[error("Relative path is empty")]
    Empty,

    #[error("Path escapes the endpoint root: {path}")]
    Traversal { path: String },

    #[error("Path is absolute after trimming the leading '/': {path}")]
    Absolute { path: String },

    #[error("Path contains a NUL byte: {path}")]
    NulByte { path: String },

    #[error("Endpoint {endpoint} is not {capability}")]
    MissingCapability {
        endpoint: String,
        capability: Capability,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EndpointKind;

    #[test]
    fn test_leading_slash_trimmed() {
        let path = RelativePath::parse("/2024/03/scan_001.h5").unwrap();
        assert_eq!(path.as_str(), "2024/03/scan_001.h5");
        assert_eq!(path.file_name(), "scan_001.h5");
        assert_eq!(path.file_stem(), "scan_001");
        assert_eq!(path.folder(), "2024/03");
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(matches!(
            RelativePath::parse("../etc/passwd"),
            Err(PathViolation::Traversal { .. })
        ));
        assert!(matches!(
            RelativePath::parse("user/../../other"),
            Err(PathViolation::Traversal { .. })
        ));
    }

    #[test]
    fn test_double_slash_is_absolute() {
        assert!(matches!(
            RelativePath::parse("//etc/passwd"),
            Err(PathViolation::Absolute { .. })
        ));
    }

    #[test]
    fn test_empty_and_nul_rejected() {
        assert_eq!(RelativePath::parse(""), Err(PathViolation::Empty));
        assert_eq!(RelativePath::parse("/"), Err(PathViolation::Empty));
        assert_eq!(RelativePath::parse("."), Err(PathViolation::Empty));
        assert_eq!(RelativePath::parse("./"), Err(PathViolation::Empty));
        assert_eq!(RelativePath::parse("/./."), Err(PathViolation::Empty));
        assert!(matches!(
            RelativePath::parse("scan\0.h5"),
            Err(PathViolation::NulByte { .. })
        ));
    }

    #[test]
    fn test_directory_paths() {
        let path = RelativePath::parse("user/recscan_001/").unwrap();
        assert!(path.is_directory());
        assert_eq!(path.file_name(), "recscan_001");
        assert_eq!(path.folder(), "user");
    }

    #[test]
    fn test_serde_validates() {
        let ok: RelativePath = serde_json::from_str("\"/user/scan.h5\"").unwrap();
        assert_eq!(ok.as_str(), "user/scan.h5");

        let bad: Result<RelativePath, _> = serde_json::from_str("\"../scan.h5\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_require_capability() {
        let endpoint = Endpoint::new("hpss", "/archive", EndpointKind::TapeArchive)
            .with_capabilities([Capability::Readable, Capability::Writable]);

        assert!(require_capability(&endpoint, Capability::Writable).is_ok());
        assert_eq!(
            require_capability(&endpoint, Capability::Deletable),
            Err(PathViolation::MissingCapability {
                endpoint: "hpss".to_string(),
                capability: Capability::Deletable,
            })
        );
    }
}
