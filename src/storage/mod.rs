//! POSIX-style file and directory operations over an object store.
//!
//! [`CloudStorage`] is the public surface: open/read/write/flush on files,
//! directory emulation, symlinks, the staged-block protocol and capacity
//! accounting. It is generic over the backend so every operation is tested
//! against the in-memory store and deployed against S3.

pub mod attr;
pub mod coalesce;
pub mod list;
pub mod locks;

use crate::blocks::BlockOffsetList;
use crate::blocks::staged::StagedBlockCache;
use crate::cadapter::client::ObjectBackend;
use crate::cadapter::health::ConnectionMonitor;
use crate::cadapter::keys::KeyMapper;
use crate::cadapter::s3::S3Backend;
use crate::config::CloudConfig;
use crate::error::{Result, StorageError};
use crate::storage::attr::ObjectAttr;
use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::path::Path;

const LIST_PAGE_SIZE: i32 = 1000;
const DELETE_BATCH_SIZE: usize = 1000;

/// State carried between open and close of one file.
pub struct FileHandle {
    pub path: String,
    pub size: u64,
    bol: Option<BlockOffsetList>,
}

impl FileHandle {
    /// Small files are rewritten whole on every write; anything else goes
    /// through the block machinery.
    pub fn is_small(&self) -> bool {
        self.bol.is_none()
    }
}

pub struct CloudStorage<B: ObjectBackend> {
    backend: B,
    keys: KeyMapper,
    cfg: CloudConfig,
    monitor: ConnectionMonitor,
    locks: locks::PathLocks,
    staged: StagedBlockCache,
}

impl CloudStorage<S3Backend> {
    /// Validate the config, build the S3 client and verify the bucket
    /// answers before returning.
    pub async fn connect(mut cfg: CloudConfig) -> Result<Self> {
        cfg.validate()?;
        let backend = S3Backend::new(&cfg).await?;
        let storage = Self::new(backend, cfg);
        if !storage.probe_connection().await {
            return Err(StorageError::Offline);
        }
        Ok(storage)
    }
}

impl<B: ObjectBackend> CloudStorage<B> {
    /// Wrap an already-configured backend. `cfg` is trusted as validated.
    pub fn new(backend: B, cfg: CloudConfig) -> Self {
        let keys = KeyMapper::new(&cfg.subdirectory, cfg.enable_symlinks);
        let monitor = ConnectionMonitor::new(&cfg.bucket_name);
        Self {
            backend,
            keys,
            cfg,
            monitor,
            locks: locks::PathLocks::new(),
            staged: StagedBlockCache::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &CloudConfig {
        &self.cfg
    }

    // ---- connection health ----

    pub fn is_online(&self) -> bool {
        self.monitor.is_connected()
    }

    /// Reachability probe; flips the offline state both ways.
    pub async fn probe_connection(&self) -> bool {
        self.monitor.probe(&self.backend).await
    }

    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.monitor.cancellation_token()
    }

    fn guard(&self) -> Result<()> {
        self.monitor.ensure_connected()
    }

    // ---- file operations ----

    pub async fn create_file(&self, path: &str) -> Result<FileHandle> {
        self.guard()?;
        let key = self.keys.key_for(path, false, false);
        self.backend
            .put_object(&key, Vec::new(), &HashMap::new())
            .await?;
        debug!("created {path}");
        Ok(FileHandle {
            path: path.to_string(),
            size: 0,
            bol: None,
        })
    }

    pub async fn open_file(&self, path: &str) -> Result<FileHandle> {
        self.guard()?;
        let key = self.keys.key_for(path, false, false);
        let info = self.backend.head_object(&key).await?;
        let bol = if info.size >= self.cfg.upload_cutoff {
            Some(BlockOffsetList::from_size(info.size, self.cfg.part_size))
        } else {
            None
        };
        Ok(FileHandle {
            path: path.to_string(),
            size: info.size,
            bol,
        })
    }

    pub async fn read_file(
        &self,
        handle: &mut FileHandle,
        offset: u64,
        count: u64,
    ) -> Result<Vec<u8>> {
        self.guard()?;
        let key = self.keys.key_for(&handle.path, false, false);
        match handle.bol.as_mut() {
            Some(bol) => coalesce::read_blocks(&self.backend, &key, bol, offset, count).await,
            None => {
                if offset >= handle.size {
                    return Ok(Vec::new());
                }
                let count = count.min(handle.size - offset);
                self.backend.get_object(&key, offset, Some(count)).await
            }
        }
    }

    /// Buffer or apply a write. Small files hit the remote immediately;
    /// block-mode files only change in memory until [`Self::flush_file`].
    pub async fn write_file(
        &self,
        handle: &mut FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.guard()?;
        if data.is_empty() {
            return Ok(());
        }
        let _lock = self.locks.lock(&handle.path).await;
        let key = self.keys.key_for(&handle.path, false, false);
        let write_end = offset + data.len() as u64;
        if handle.bol.is_none() && write_end >= self.cfg.upload_cutoff {
            handle.bol = Some(BlockOffsetList::from_size(handle.size, self.cfg.part_size));
        }
        match handle.bol.as_mut() {
            Some(bol) => {
                coalesce::write_blocks(&self.backend, &self.cfg, &key, bol, offset, data).await?;
                handle.size = bol.file_size();
            }
            None => {
                handle.size = coalesce::write_small(&self.backend, &key, offset, data).await?;
            }
        }
        Ok(())
    }

    /// Push buffered blocks to the remote. Idempotent: with nothing dirty
    /// no remote call is made.
    pub async fn flush_file(&self, handle: &mut FileHandle) -> Result<()> {
        self.guard()?;
        if let Some(bol) = handle.bol.as_mut() {
            let _lock = self.locks.lock(&handle.path).await;
            let key = self.keys.key_for(&handle.path, false, false);
            coalesce::commit(&self.backend, &self.cfg, &key, bol).await?;
        }
        Ok(())
    }

    pub async fn close_file(&self, handle: &mut FileHandle) -> Result<()> {
        self.flush_file(handle).await
    }

    pub async fn truncate_file(&self, handle: &mut FileHandle, size: u64) -> Result<()> {
        self.guard()?;
        let _lock = self.locks.lock(&handle.path).await;
        let key = self.keys.key_for(&handle.path, false, false);
        if handle.bol.is_none() && size >= self.cfg.upload_cutoff {
            handle.bol = Some(BlockOffsetList::from_size(handle.size, self.cfg.part_size));
        }
        match handle.bol.as_mut() {
            Some(bol) => {
                coalesce::truncate_blocks(&self.backend, &self.cfg, &key, bol, size).await?;
            }
            None => {
                let mut content = self.backend.get_object(&key, 0, None).await?;
                content.resize(size as usize, 0);
                self.backend
                    .put_object(&key, content, &HashMap::new())
                    .await?;
            }
        }
        handle.size = size;
        Ok(())
    }

    /// Delete one file or symlink. Missing paths are an error; deleting a
    /// directory this way is refused.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.guard()?;
        let _lock = self.locks.lock(path).await;
        let attr = self.get_attr(path).await?;
        if attr.is_dir() {
            return Err(StorageError::InvalidArgument(format!(
                "{path} is a directory"
            )));
        }
        let key = self.keys.key_for(path, attr.is_symlink(), false);
        self.backend.delete_object(&key).await?;
        self.staged.discard(path).await;
        Ok(())
    }

    /// Copy-then-delete rename. A source that vanishes between the copy
    /// and the delete still counts as success.
    pub async fn rename_file(&self, src: &str, dst: &str) -> Result<()> {
        self.guard()?;
        let _lock = self.locks.lock(src).await;
        let attr = self.get_attr(src).await?;
        if attr.is_dir() {
            return Err(StorageError::InvalidArgument(format!("{src} is a directory")));
        }
        let src_key = self.keys.key_for(src, attr.is_symlink(), false);
        let dst_key = self.keys.key_for(dst, attr.is_symlink(), false);
        self.backend.copy_object(&src_key, &dst_key).await?;
        match self.backend.delete_object(&src_key).await {
            Ok(()) | Err(StorageError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // ---- directory operations ----

    pub async fn create_dir(&self, path: &str) -> Result<()> {
        self.guard()?;
        if self.cfg.create_dir_markers {
            let key = self.keys.key_for(path, false, true);
            self.backend
                .put_object(&key, Vec::new(), &HashMap::new())
                .await?;
        }
        Ok(())
    }

    /// Recursively delete everything under a directory, marker included.
    /// An already-missing directory is treated as deleted.
    pub async fn delete_dir(&self, path: &str) -> Result<()> {
        self.guard()?;
        let prefix = self.keys.listing_prefix(path);
        let objects = list::list_all_objects(&self.backend, &prefix, LIST_PAGE_SIZE).await?;
        let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
        // keep deleting remaining batches after a failure, report the first
        let mut first_err = None;
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            if let Err(err) = self.backend.delete_objects(batch).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn rename_dir(&self, src: &str, dst: &str) -> Result<()> {
        self.guard()?;
        let src_prefix = self.keys.listing_prefix(src);
        let dst_prefix = self.keys.listing_prefix(dst);
        let objects = list::list_all_objects(&self.backend, &src_prefix, LIST_PAGE_SIZE).await?;
        // the store cannot represent an empty directory, so a source with
        // nothing under it is indistinguishable from a missing one; both
        // count as success, same as delete_dir
        if objects.is_empty() {
            return Ok(());
        }
        let mut old_keys = Vec::with_capacity(objects.len());
        for object in &objects {
            let tail = &object.key[src_prefix.len()..];
            let target = format!("{dst_prefix}{tail}");
            self.backend.copy_object(&object.key, &target).await?;
            old_keys.push(object.key.clone());
        }
        for batch in old_keys.chunks(DELETE_BATCH_SIZE) {
            self.backend.delete_objects(batch).await?;
        }
        Ok(())
    }

    pub async fn list_dir(
        &self,
        path: &str,
        token: Option<&str>,
        max_count: i32,
    ) -> Result<(Vec<ObjectAttr>, Option<String>)> {
        self.guard()?;
        list::list_dir(&self.backend, &self.keys, path, token, max_count).await
    }

    pub async fn read_dir(&self, path: &str) -> Result<Vec<ObjectAttr>> {
        self.guard()?;
        list::read_dir(&self.backend, &self.keys, path, LIST_PAGE_SIZE).await
    }

    // ---- attributes ----

    /// Resolve a path to its attributes: regular object first, then
    /// symlink, then directory (marker object or any child key).
    pub async fn get_attr(&self, path: &str) -> Result<ObjectAttr> {
        self.guard()?;
        if path.is_empty() || path == "/" {
            return Ok(ObjectAttr::dir(String::new()));
        }
        let file_key = self.keys.key_for(path, false, false);
        match self.backend.head_object(&file_key).await {
            Ok(info) => {
                return Ok(ObjectAttr::file(
                    path.to_string(),
                    info.size,
                    info.last_modified,
                    info.metadata,
                ));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        if self.cfg.enable_symlinks {
            let link_key = self.keys.key_for(path, true, false);
            match self.backend.head_object(&link_key).await {
                Ok(info) => {
                    return Ok(ObjectAttr::symlink(
                        path.to_string(),
                        info.size,
                        info.last_modified,
                        info.metadata,
                    ));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        let prefix = self.keys.listing_prefix(path);
        let page = self.backend.list_page(&prefix, true, None, 1).await?;
        if page.objects.is_empty() && page.common_prefixes.is_empty() {
            Err(StorageError::NotFound)
        } else {
            Ok(ObjectAttr::dir(path.to_string()))
        }
    }

    /// Mode changes have no representation in the object store; accepted
    /// so callers doing chmod-then-write sequences keep working.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.guard()?;
        debug!("ignoring mode change to {mode:o} for {path}");
        Ok(())
    }

    /// Ownership changes, same policy as [`Self::chmod`].
    pub async fn chown(&self, path: &str, owner: u32, group: u32) -> Result<()> {
        self.guard()?;
        debug!("ignoring ownership change to {owner}:{group} for {path}");
        Ok(())
    }

    // ---- symlinks ----

    pub async fn create_link(&self, path: &str, target: &str) -> Result<()> {
        self.guard()?;
        if !self.cfg.enable_symlinks {
            return Err(StorageError::InvalidArgument(
                "symlink support is disabled".into(),
            ));
        }
        let key = self.keys.key_for(path, true, false);
        let mut metadata = HashMap::new();
        metadata.insert("is_symlink".to_string(), "true".to_string());
        self.backend
            .put_object(&key, target.as_bytes().to_vec(), &metadata)
            .await
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        self.guard()?;
        let key = self.keys.key_for(path, true, false);
        let data = self.backend.get_object(&key, 0, None).await?;
        String::from_utf8(data)
            .map_err(|_| StorageError::InvalidArgument(format!("{path} target is not utf-8")))
    }

    // ---- staged blocks ----

    /// Hold a named block in memory for a later
    /// [`Self::commit_staged_blocks`]. Re-staging an id replaces its bytes.
    pub async fn stage_block(&self, path: &str, block_id: &str, data: Bytes) -> Result<()> {
        self.guard()?;
        if block_id.is_empty() {
            return Err(StorageError::InvalidArgument("empty block id".into()));
        }
        self.staged.stage(path, block_id, data).await;
        Ok(())
    }

    /// Write the listed blocks, in order, as the new object content, one
    /// part per block. Every part except the last listed must meet the
    /// part floor; an undersized non-final block or an id that was never
    /// staged is an error, rejected before anything reaches the remote.
    /// The staged set for `path` is consumed whether or not the upload
    /// succeeds.
    pub async fn commit_staged_blocks(&self, path: &str, block_ids: &[String]) -> Result<()> {
        self.guard()?;
        let _lock = self.locks.lock(path).await;
        let mut staged = self.staged.take(path).await;
        let key = self.keys.key_for(path, false, false);

        let mut blocks: Vec<Bytes> = Vec::with_capacity(block_ids.len());
        for (i, id) in block_ids.iter().enumerate() {
            let data = staged.remove(id).ok_or_else(|| {
                StorageError::InvalidArgument(format!("block {id} was never staged for {path}"))
            })?;
            if i + 1 < block_ids.len() && (data.len() as u64) < self.cfg.min_part_size {
                return Err(StorageError::InvalidArgument(format!(
                    "staged block {id} is {} bytes, below the {} byte part floor",
                    data.len(),
                    self.cfg.min_part_size
                )));
            }
            blocks.push(data);
        }
        let total: u64 = blocks.iter().map(|b| b.len() as u64).sum();
        if total < self.cfg.upload_cutoff {
            // below the cutoff a single PUT publishes the identical
            // content; the part floor has already been enforced above
            let mut content = Vec::with_capacity(total as usize);
            for block in &blocks {
                content.extend_from_slice(block);
            }
            return self.backend.put_object(&key, content, &HashMap::new()).await;
        }

        let upload_id = self.backend.create_multipart(&key).await?;
        let mut parts = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.into_iter().enumerate() {
            match self
                .backend
                .upload_part(&key, &upload_id, i as i32 + 1, block.to_vec())
                .await
            {
                Ok(part) => parts.push(part),
                Err(err) => {
                    let _ = self.backend.abort_multipart(&key, &upload_id).await;
                    return Err(err);
                }
            }
        }
        if let Err(err) = self.backend.complete_multipart(&key, &upload_id, parts).await {
            let _ = self.backend.abort_multipart(&key, &upload_id).await;
            return Err(err);
        }
        Ok(())
    }

    // ---- bulk transfer ----

    /// Upload a local file as the object at `path`.
    pub async fn copy_from_file(&self, path: &str, local: &Path) -> Result<()> {
        self.guard()?;
        let _lock = self.locks.lock(path).await;
        let data = tokio::fs::read(local).await?;
        let key = self.keys.key_for(path, false, false);
        if (data.len() as u64) < self.cfg.upload_cutoff {
            return self.backend.put_object(&key, data, &HashMap::new()).await;
        }
        let mut bol = BlockOffsetList::from_size(data.len() as u64, self.cfg.part_size);
        for block in bol.blocks.iter_mut() {
            block.data = Some(data[block.start as usize..block.end as usize].to_vec());
            block.dirty = true;
        }
        coalesce::commit(&self.backend, &self.cfg, &key, &mut bol).await
    }

    /// Download the object at `path` into a local file.
    pub async fn copy_to_file(&self, path: &str, local: &Path) -> Result<()> {
        self.guard()?;
        let key = self.keys.key_for(path, false, false);
        let data = self.backend.get_object(&key, 0, None).await?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    // ---- accounting ----

    /// Total bytes stored under the configured prefix.
    pub async fn used_capacity(&self) -> Result<u64> {
        self.guard()?;
        let prefix = self.keys.listing_prefix("");
        let objects = list::list_all_objects(&self.backend, &prefix, LIST_PAGE_SIZE).await?;
        Ok(objects.iter().map(|o| o.size).sum())
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.guard()?;
        self.backend.list_buckets().await
    }

    /// Every visible bucket the current credentials can actually access,
    /// probed in parallel.
    pub async fn authorized_buckets(&self) -> Result<Vec<String>> {
        self.guard()?;
        let names = self.backend.list_buckets().await?;
        let probes = names.iter().map(|name| async move {
            let ok = self
                .backend
                .bucket_accessible(name)
                .await
                .unwrap_or(false);
            (ok, name.clone())
        });
        let results = futures::future::join_all(probes).await;
        Ok(results
            .into_iter()
            .filter_map(|(ok, name)| ok.then_some(name))
            .collect())
    }
}
