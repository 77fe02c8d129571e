//! Backup locations.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{BackupError, BackupResult};

/// A parsed `file://` backup location. Paths ending in `.gz` or `.tgz`
/// are gzip-compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupUri {
    raw: String,
    path: PathBuf,
    compressed: bool,
}

impl BackupUri {
    pub fn parse(raw: &str) -> BackupResult<Self> {
        let url = Url::parse(raw).map_err(|_| BackupError::InvalidUri(raw.to_string()))?;
        if url.scheme() != "file" {
            return Err(BackupError::UnsupportedScheme(url.scheme().to_string()));
        }
        let path = url
            .to_file_path()
            .map_err(|_| BackupError::InvalidUri(raw.to_string()))?;
        if path.file_name().is_none() {
            return Err(BackupError::InvalidUri(raw.to_string()));
        }
        let compressed = path
            .extension()
            .is_some_and(|ext| ext == "gz" || ext == "tgz");
        Ok(Self {
            raw: raw.to_string(),
            path,
            compressed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for BackupUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_uris() {
        let uri = BackupUri::parse("file:///tmp/backup.tar").unwrap();
        assert_eq!(uri.path(), Path::new("/tmp/backup.tar"));
        assert!(!uri.is_compressed());

        assert!(BackupUri::parse("file:///tmp/backup.tar.gz").unwrap().is_compressed());
        assert!(BackupUri::parse("file:///tmp/backup.tgz").unwrap().is_compressed());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(matches!(
            BackupUri::parse("s3://bucket/backup.tar"),
            Err(BackupError::UnsupportedScheme(s)) if s == "s3"
        ));
        assert!(matches!(
            BackupUri::parse("not a uri"),
            Err(BackupError::InvalidUri(_))
        ));
        assert!(BackupUri::parse("file:///").is_err());
    }
}
