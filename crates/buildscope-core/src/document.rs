use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::{BuildSettingsError, Result};

/// Identity of a source document. Wraps a normalized URI and is the key of
/// every per-document map in the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentUri(Url);

impl DocumentUri {
    /// Parse a URI string. `file://` URIs are normalized through their path
    /// so that `file:///a/./b.c` and `file:///a/b.c` compare equal.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| BuildSettingsError::InvalidDocument(format!("{}: {}", uri, e)))?;
        if url.scheme() == "file" {
            if let Ok(path) = url.to_file_path() {
                return Self::from_path(path);
            }
        }
        Ok(Self(url))
    }

    /// Build a `file://` identity from a filesystem path. Relative paths are
    /// resolved against the current directory; `.` and `..` are removed
    /// lexically (the file does not need to exist).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let normalized = normalize_lexically(&absolute);
        Url::from_file_path(&normalized)
            .map(Self)
            .map_err(|_| BuildSettingsError::InvalidDocument(path.display().to_string()))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Filesystem path for `file://` documents.
    pub fn path(&self) -> Option<PathBuf> {
        if self.0.scheme() != "file" {
            return None;
        }
        self.0.to_file_path().ok()
    }

    /// Lower-cased extension of the last path segment, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    pub fn file_name(&self) -> Option<&str> {
        let last = match self.0.path_segments() {
            Some(mut segments) => segments.next_back(),
            // cannot-be-a-base URIs such as `untitled:Untitled-1.swift`
            None => self.0.path().rsplit('/').next(),
        };
        last.filter(|s| !s.is_empty())
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentUri {
    type Err = BuildSettingsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_uris_are_normalized() {
        let a = DocumentUri::parse("file:///work/src/./lib/../a.c").unwrap();
        let b = DocumentUri::from_path("/work/src/a.c").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path(), Some(PathBuf::from("/work/src/a.c")));
    }

    #[test]
    fn extension_is_lowercased() {
        let doc = DocumentUri::from_path("/work/Module.MM").unwrap();
        assert_eq!(doc.extension().as_deref(), Some("mm"));
        assert_eq!(doc.file_name(), Some("Module.MM"));
    }

    #[test]
    fn extension_absent_for_dotfiles_and_bare_names() {
        assert_eq!(DocumentUri::from_path("/work/Makefile").unwrap().extension(), None);
        assert_eq!(DocumentUri::from_path("/work/.clang").unwrap().extension(), None);
    }

    #[test]
    fn non_file_uris_have_no_path() {
        let doc = DocumentUri::parse("untitled:Untitled-1.swift").unwrap();
        assert!(doc.path().is_none());
        assert_eq!(doc.extension().as_deref(), Some("swift"));
        assert!(DocumentUri::parse("not a uri").is_err());
    }
}
