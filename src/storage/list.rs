//! Directory emulation over the flat key namespace.
//!
//! A delimiter listing yields objects (files at this level) and common
//! prefixes (subdirectories, whether or not a marker object exists for
//! them). Entries come back sorted by path. A page may legitimately be
//! empty while the continuation token is still live, e.g. when it carried
//! only the listed directory's own marker; exhaustive readers keep going
//! until the token dies.

use crate::cadapter::client::{ObjectBackend, ObjectInfo};
use crate::cadapter::keys::{KeyMapper, truncate_dir_name};
use crate::error::Result;
use crate::storage::attr::ObjectAttr;
use std::collections::HashSet;

/// One page of directory entries. `next_token` outliving an empty entry
/// list is normal; callers wanting the whole directory use [`read_dir`].
pub async fn list_dir<B: ObjectBackend>(
    backend: &B,
    keys: &KeyMapper,
    dir_path: &str,
    token: Option<&str>,
    max_count: i32,
) -> Result<(Vec<ObjectAttr>, Option<String>)> {
    let listing_prefix = keys.listing_prefix(dir_path);
    let page = backend
        .list_page(&listing_prefix, true, token, max_count)
        .await?;

    let mut entries = Vec::new();
    let mut seen_dirs: HashSet<String> = HashSet::new();
    for object in page.objects {
        // the directory's own marker object lists under its prefix
        if object.key == listing_prefix {
            continue;
        }
        if object.key.ends_with('/') {
            let path = keys.strip_prefix(truncate_dir_name(&object.key));
            if seen_dirs.insert(path.clone()) {
                entries.push(ObjectAttr::dir(path));
            }
            continue;
        }
        let (path, is_symlink) = keys.path_for(&object.key);
        entries.push(if is_symlink {
            ObjectAttr::symlink(path, object.size, object.last_modified, object.metadata)
        } else {
            ObjectAttr::file(path, object.size, object.last_modified, object.metadata)
        });
    }
    for prefix in page.common_prefixes {
        let path = keys.strip_prefix(truncate_dir_name(&prefix));
        synthesize_dirs(dir_path, path, &mut seen_dirs, &mut entries);
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok((entries, page.next_token))
}

/// Record `path` as a directory entry along with any intermediate segments
/// between it and the listed directory. A delimiter listing normally folds
/// exactly one level, but stores have been seen handing back deeper
/// prefixes; walking up stops at the first segment already recorded, since
/// its ancestors were recorded with it.
fn synthesize_dirs(
    dir_path: &str,
    path: String,
    seen_dirs: &mut HashSet<String>,
    entries: &mut Vec<ObjectAttr>,
) {
    let base = dir_path.trim_matches('/');
    let mut path = path;
    while !path.is_empty() && path != base {
        if !seen_dirs.insert(path.clone()) {
            break;
        }
        entries.push(ObjectAttr::dir(path.clone()));
        match path.rfind('/') {
            Some(i) => path.truncate(i),
            None => break,
        }
    }
}

/// Every entry of a directory, across however many pages it takes.
pub async fn read_dir<B: ObjectBackend>(
    backend: &B,
    keys: &KeyMapper,
    dir_path: &str,
    page_size: i32,
) -> Result<Vec<ObjectAttr>> {
    let mut entries = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let (mut page, next) =
            list_dir(backend, keys, dir_path, token.as_deref(), page_size).await?;
        entries.append(&mut page);
        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(entries)
}

/// All objects under a physical prefix, undelimited. Used by recursive
/// delete/rename and capacity accounting.
pub async fn list_all_objects<B: ObjectBackend>(
    backend: &B,
    prefix: &str,
    page_size: i32,
) -> Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut page = backend
            .list_page(prefix, false, token.as_deref(), page_size)
            .await?;
        objects.append(&mut page.objects);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(objects)
}
