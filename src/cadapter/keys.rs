//! Mapping between logical paths and physical object keys.
//!
//! The bucket namespace is flat; directories exist only as key prefixes
//! ending in `/`. Symlink placeholder objects carry a key suffix so a real
//! file and a link to it can coexist without colliding.

/// Suffix appended to keys of symlink placeholder objects.
pub const SYMLINK_SUFFIX: &str = ".rclonelink";

#[derive(Debug, Clone)]
pub struct KeyMapper {
    prefix: String,
    symlinks_enabled: bool,
}

impl KeyMapper {
    /// `prefix` restricts the mount to a sub-tree of the bucket; it is
    /// stored without surrounding slashes.
    pub fn new(prefix: &str, symlinks_enabled: bool) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            symlinks_enabled,
        }
    }

    /// Logical path + role flags -> physical object key.
    pub fn key_for(&self, path: &str, is_symlink: bool, is_dir: bool) -> String {
        let mut name = join_unix_path(&self.prefix, path);
        if is_symlink && self.symlinks_enabled {
            name.push_str(SYMLINK_SUFFIX);
        }
        if is_dir {
            name = extend_dir_name(&name);
        }
        name
    }

    /// Physical key -> (logical path, is_symlink). Inverse of `key_for` for
    /// non-directory keys; used when decoding listing results.
    pub fn path_for(&self, key: &str) -> (String, bool) {
        let mut name = key;
        let mut is_symlink = false;
        if self.symlinks_enabled {
            if let Some(stripped) = name.strip_suffix(SYMLINK_SUFFIX) {
                name = stripped;
                is_symlink = true;
            }
        }
        (self.strip_prefix(name), is_symlink)
    }

    /// Remove the configured prefix from a physical key or listing prefix.
    pub fn strip_prefix(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            return key.to_string();
        }
        let with_slash = format!("{}/", self.prefix);
        match key.strip_prefix(with_slash.as_str()) {
            Some(rest) => rest.to_string(),
            None => key.to_string(),
        }
    }

    /// Physical listing prefix for a logical directory path. Root maps to
    /// the configured prefix (or empty), always slash-terminated when
    /// non-empty so the delimiter listing stays inside the directory.
    pub fn listing_prefix(&self, dir_path: &str) -> String {
        let joined = join_unix_path(&self.prefix, dir_path);
        if joined.is_empty() {
            joined
        } else {
            extend_dir_name(&joined)
        }
    }
}

/// Join path segments with single forward slashes, dropping empty parts.
pub fn join_unix_path(a: &str, b: &str) -> String {
    let parts: Vec<&str> = a
        .split('/')
        .chain(b.split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    parts.join("/")
}

/// Ensure a trailing slash (directory form of a key).
pub fn extend_dir_name(name: &str) -> String {
    if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    }
}

/// Strip the trailing slash (file-attr form of a directory path).
pub fn truncate_dir_name(name: &str) -> &str {
    name.strip_suffix('/').unwrap_or(name)
}

/// Base name of a logical path.
pub fn base_name(path: &str) -> &str {
    truncate_dir_name(path).rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_plain_file() {
        let m = KeyMapper::new("sub/dir", true);
        assert_eq!(m.key_for("a/b.txt", false, false), "sub/dir/a/b.txt");
    }

    #[test]
    fn test_key_for_no_prefix() {
        let m = KeyMapper::new("", true);
        assert_eq!(m.key_for("a/b.txt", false, false), "a/b.txt");
        assert_eq!(m.listing_prefix(""), "");
    }

    #[test]
    fn test_symlink_decoration_round_trip() {
        let m = KeyMapper::new("pre", true);
        let key = m.key_for("links/l1", true, false);
        assert_eq!(key, "pre/links/l1.rclonelink");
        assert_eq!(m.path_for(&key), ("links/l1".to_string(), true));
    }

    #[test]
    fn test_symlink_decoration_disabled() {
        let m = KeyMapper::new("", false);
        assert_eq!(m.key_for("l1", true, false), "l1");
        // a literal .rclonelink key stays a regular file
        assert_eq!(m.path_for("x.rclonelink"), ("x.rclonelink".to_string(), false));
    }

    #[test]
    fn test_dir_keys_slash_terminated() {
        let m = KeyMapper::new("pre", true);
        assert_eq!(m.key_for("d", false, true), "pre/d/");
        assert_eq!(m.listing_prefix("d"), "pre/d/");
        assert_eq!(m.listing_prefix(""), "pre/");
    }

    #[test]
    fn test_strip_prefix() {
        let m = KeyMapper::new("pre", true);
        assert_eq!(m.strip_prefix("pre/a/b"), "a/b");
        assert_eq!(m.strip_prefix("other/a"), "other/a");
    }

    #[test]
    fn test_join_collapses_slashes() {
        assert_eq!(join_unix_path("a//b/", "/c"), "a/b/c");
        assert_eq!(join_unix_path("", ""), "");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("a/b/c"), "c");
        assert_eq!(base_name("a/b/"), "b");
        assert_eq!(base_name("c"), "c");
    }
}
