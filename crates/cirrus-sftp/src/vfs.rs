//! Virtual file model over a flat object namespace
//!
//! SFTP path `/a/b.txt` maps to object key `a/b.txt`. Hierarchy is purely
//! lexical: the directory of a key is everything up to and including its
//! last `/`, and the root is synthetic.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cirrus_store::ObjectInfo;
use std::collections::BTreeMap;

/// Hierarchy delimiter inside object keys
pub const DELIMITER: char = '/';

/// Key prefix reserved for in-flight uploads; never listed, never addressable
pub const TEMP_PREFIX: &str = ".cirrus-tmp/";

/// A file or directory as presented to SFTP clients
///
/// Derived from a backend listing on every call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    /// Object key (no leading delimiter); a directory key ends with the delimiter
    pub key: String,
    /// Size in bytes, zero for directories
    pub size: u64,
    /// Last modification time
    pub mod_time: DateTime<Utc>,
    /// Whether this entry is a directory
    pub is_directory: bool,
}

impl VirtualFile {
    /// The synthetic root directory
    pub fn root() -> Self {
        Self {
            key: String::new(),
            size: 0,
            mod_time: DateTime::<Utc>::UNIX_EPOCH,
            is_directory: true,
        }
    }

    /// A regular file backed by one object
    pub fn file(key: impl Into<String>, size: u64, mod_time: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            size,
            mod_time,
            is_directory: false,
        }
    }

    /// A directory implied by keys sharing `key` as a prefix
    pub fn directory(key: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        let mut key = key.into();
        if !key.is_empty() && !key.ends_with(DELIMITER) {
            key.push(DELIMITER);
        }
        Self {
            key,
            size: 0,
            mod_time,
            is_directory: true,
        }
    }

    /// Last path component, without any trailing delimiter
    pub fn name(&self) -> &str {
        let trimmed = self.key.trim_end_matches(DELIMITER);
        trimmed
            .rsplit_once(DELIMITER)
            .map_or(trimmed, |(_, name)| name)
    }

    /// Directory containing this entry, as an absolute SFTP path ending in `/`
    pub fn parent_directory(&self) -> String {
        format!("/{}", directory_of(self.key.trim_end_matches(DELIMITER)))
    }
}

/// Directory part of a key: up to and including the last delimiter, or `""`
pub fn directory_of(key: &str) -> &str {
    key.rfind(DELIMITER).map_or("", |idx| &key[..=idx])
}

/// Normalise an SFTP path to an absolute path without `.`/`..` or a trailing
/// delimiter. `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split(DELIMITER) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Map an SFTP path to its object key; the root maps to `""`
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] for paths inside the reserved upload namespace
pub fn path_to_key(path: &str) -> Result<String> {
    let key = normalize(path).trim_start_matches(DELIMITER).to_string();
    if is_reserved(&key) {
        return Err(Error::InvalidPath(format!("{path} is reserved")));
    }
    Ok(key)
}

/// Map an SFTP path to the key of a regular file
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] for the root or reserved paths
pub fn file_key(path: &str) -> Result<String> {
    let key = path_to_key(path)?;
    if key.is_empty() {
        return Err(Error::InvalidPath("the root is not a file".into()));
    }
    Ok(key)
}

/// Whether a key belongs to the reserved upload namespace
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(TEMP_PREFIX) || key == TEMP_PREFIX.trim_end_matches(DELIMITER)
}

/// Direct children of the directory `dir_key` within a full listing
///
/// Files whose directory equals `dir_key` are returned as-is; deeper keys
/// collapse into one synthesised directory per immediate sub-prefix. The
/// directory's own marker object and the reserved namespace are skipped.
pub fn children(dir_key: &str, objects: &[ObjectInfo]) -> Vec<VirtualFile> {
    let prefix = dir_prefix(dir_key);
    let mut entries: BTreeMap<String, VirtualFile> = BTreeMap::new();

    for object in objects {
        if is_reserved(&object.name) || object.name == prefix {
            continue;
        }
        let Some(rest) = object.name.strip_prefix(prefix.as_str()) else {
            continue;
        };

        match rest.split_once(DELIMITER) {
            None => {
                entries.insert(
                    object.name.clone(),
                    VirtualFile::file(&object.name, object.size, object.last_modified),
                );
            }
            Some((sub, _)) if !sub.is_empty() => {
                let key = format!("{prefix}{sub}/");
                entries
                    .entry(key.clone())
                    .and_modify(|dir| dir.mod_time = dir.mod_time.max(object.last_modified))
                    .or_insert_with(|| VirtualFile::directory(key, object.last_modified));
            }
            // `dir//x` has an empty component; no client can address it
            Some(_) => {}
        }
    }

    entries.into_values().collect()
}

/// Listing prefix of a directory key: `""` for the root, else `key/`
pub fn dir_prefix(dir_key: &str) -> String {
    let trimmed = dir_key.trim_end_matches(DELIMITER);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, size: u64) -> ObjectInfo {
        ObjectInfo {
            name: name.to_string(),
            size,
            last_modified: Utc::now(),
        }
    }

    fn names(entries: &[VirtualFile]) -> Vec<&str> {
        entries.iter().map(VirtualFile::name).collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b.txt"), "/a/b.txt");
        assert_eq!(normalize("//a/./b/../c/"), "/a/c");
        assert_eq!(normalize("/../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn test_path_to_key() {
        assert_eq!(path_to_key("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(path_to_key("/").unwrap(), "");
        assert!(path_to_key("/.cirrus-tmp/123").is_err());
        assert!(path_to_key("/.cirrus-tmp").is_err());
        assert!(file_key("/").is_err());
    }

    #[test]
    fn test_directory_of() {
        assert_eq!(directory_of("a.txt"), "");
        assert_eq!(directory_of("dir/b.txt"), "dir/");
        assert_eq!(directory_of("a/b/c"), "a/b/");
    }

    #[test]
    fn test_name_and_parent() {
        let file = VirtualFile::file("dir/b.txt", 1, Utc::now());
        assert_eq!(file.name(), "b.txt");
        assert_eq!(file.parent_directory(), "/dir/");

        let dir = VirtualFile::directory("dir", Utc::now());
        assert_eq!(dir.key, "dir/");
        assert_eq!(dir.name(), "dir");
        assert_eq!(dir.parent_directory(), "/");

        let top = VirtualFile::file("a.txt", 1, Utc::now());
        assert_eq!(top.parent_directory(), "/");
    }

    #[test]
    fn test_children_of_root_and_subdirectory() {
        let objects = vec![
            object("a.txt", 1),
            object("dir/b.txt", 2),
            object("dir/c.txt", 3),
            object("dir/deep/d.txt", 4),
        ];

        let root = children("", &objects);
        assert_eq!(names(&root), vec!["a.txt", "dir"]);
        assert!(root[1].is_directory);

        let dir = children("dir", &objects);
        assert_eq!(names(&dir), vec!["b.txt", "c.txt", "deep"]);
        assert_eq!(dir[0].size, 2);
    }

    #[test]
    fn test_children_skip_marker_and_reserved() {
        let objects = vec![
            object("dir/", 0),
            object("dir/b.txt", 2),
            object(".cirrus-tmp/0b5e", 10),
        ];

        assert_eq!(names(&children("", &objects)), vec!["dir"]);
        assert_eq!(names(&children("dir/", &objects)), vec!["b.txt"]);
    }
}
