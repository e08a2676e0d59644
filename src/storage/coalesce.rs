//! Write coalescing and the multipart commit protocol.
//!
//! Small files are rewritten whole on every write. Large files buffer
//! writes into their block-offset list and push everything in one
//! multipart upload on commit: dirty blocks as uploaded parts, clean
//! blocks as server-side copies of the object's own bytes. A failed
//! commit aborts the upload so the remote object is either fully replaced
//! or untouched.

use crate::blocks::{Block, BlockOffsetList, new_block_id};
use crate::cadapter::client::{ObjectBackend, PartHandle};
use crate::config::CloudConfig;
use crate::error::Result;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;

/// Overlay `data` at `offset` onto the whole object and upload it back.
/// Returns the new object size. A gap between the old end and `offset` is
/// zero-filled.
pub async fn write_small<B: ObjectBackend>(
    backend: &B,
    key: &str,
    offset: u64,
    data: &[u8],
) -> Result<u64> {
    let mut content = match backend.get_object(key, 0, None).await {
        Ok(content) => content,
        Err(err) if err.is_not_found() => Vec::new(),
        Err(err) => return Err(err),
    };
    // a zero-length write never grows the file, whatever its offset
    if data.is_empty() {
        return Ok(content.len() as u64);
    }
    let end = offset as usize + data.len();
    if content.len() < end {
        content.resize(end, 0);
    }
    content[offset as usize..end].copy_from_slice(data);
    let new_size = content.len() as u64;
    backend.put_object(key, content, &HashMap::new()).await?;
    Ok(new_size)
}

/// Buffer a write into the block-offset list. Nothing reaches the remote
/// except reads needed to materialize partially overwritten clean blocks.
pub async fn write_blocks<B: ObjectBackend>(
    backend: &B,
    cfg: &CloudConfig,
    key: &str,
    bol: &mut BlockOffsetList,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let write_end = offset + data.len() as u64;
    if write_end > bol.file_size() {
        bol.extend_to(write_end, cfg.part_size);
    }
    let (found, index) = bol.binary_search(offset);
    debug_assert!(found);
    for block in bol.blocks[index..].iter_mut() {
        if block.start >= write_end {
            break;
        }
        materialize(backend, key, block).await?;
        let content = block.data.as_mut().unwrap();
        let from = offset.max(block.start);
        let to = write_end.min(block.end);
        let src = (from - offset) as usize..(to - offset) as usize;
        let dst = (from - block.start) as usize..(to - block.start) as usize;
        content[dst].copy_from_slice(&data[src]);
        block.dirty = true;
        // materialization gave the block its full byte range, so it no
        // longer stands for an unbacked zero-fill region
        block.truncated = false;
    }
    debug_assert!(blocks_contiguous(bol));
    Ok(())
}

/// Serve a read from the buffered blocks, falling back to ranged remote
/// reads for clean blocks. The result is cut at end of file.
pub async fn read_blocks<B: ObjectBackend>(
    backend: &B,
    key: &str,
    bol: &mut BlockOffsetList,
    offset: u64,
    count: u64,
) -> Result<Vec<u8>> {
    let read_end = (offset + count).min(bol.file_size());
    if offset >= read_end {
        return Ok(Vec::new());
    }
    let (_, index) = bol.binary_search(offset);
    let mut out = Vec::with_capacity((read_end - offset) as usize);
    for block in bol.blocks[index..].iter_mut() {
        if block.start >= read_end {
            break;
        }
        let from = offset.max(block.start);
        let to = read_end.min(block.end);
        match &block.data {
            Some(content) => {
                out.extend_from_slice(
                    &content[(from - block.start) as usize..(to - block.start) as usize],
                );
            }
            None if block.truncated => out.resize(out.len() + (to - from) as usize, 0),
            None => {
                let mut fetched = backend.get_object(key, from, Some(to - from)).await?;
                out.append(&mut fetched);
            }
        }
    }
    Ok(out)
}

/// Upload the block-offset list as the new object content.
///
/// No dirty block means the remote already matches and the call is a
/// no-op. An empty list means the file was truncated to nothing and an
/// empty object is written. On any part failure the upload is aborted and
/// the first error propagated; the remote object keeps its old content.
pub async fn commit<B: ObjectBackend>(
    backend: &B,
    cfg: &CloudConfig,
    key: &str,
    bol: &mut BlockOffsetList,
) -> Result<()> {
    if bol.blocks.is_empty() {
        backend.put_object(key, Vec::new(), &HashMap::new()).await?;
        return Ok(());
    }
    if !bol.has_dirty() {
        return Ok(());
    }
    combine_undersized(backend, cfg, key, bol).await?;
    for block in bol.blocks.iter_mut() {
        // a dirty block cut from clean remote bytes still needs them
        if block.dirty && block.data.is_none() && !block.truncated {
            materialize(backend, key, block).await?;
        }
    }

    let upload_id = backend.create_multipart(key).await?;
    let parts = match upload_all_parts(backend, cfg, key, &upload_id, bol).await {
        Ok(parts) => parts,
        Err(err) => {
            abort_quietly(backend, key, &upload_id).await;
            return Err(err);
        }
    };
    if let Err(err) = backend.complete_multipart(key, &upload_id, parts).await {
        abort_quietly(backend, key, &upload_id).await;
        return Err(err);
    }
    for block in bol.blocks.iter_mut() {
        block.dirty = false;
        block.truncated = false;
        block.data = None;
    }
    debug!("committed {} blocks for {key}", bol.blocks.len());
    Ok(())
}

/// Resize the tracked file and push the result to the remote immediately.
pub async fn truncate_blocks<B: ObjectBackend>(
    backend: &B,
    cfg: &CloudConfig,
    key: &str,
    bol: &mut BlockOffsetList,
    size: u64,
) -> Result<()> {
    if size == bol.file_size() {
        return Ok(());
    }
    bol.truncate_to(size, cfg.part_size);
    commit(backend, cfg, key, bol).await
}

async fn materialize<B: ObjectBackend>(backend: &B, key: &str, block: &mut Block) -> Result<()> {
    if block.data.is_some() {
        return Ok(());
    }
    block.data = Some(if block.truncated {
        vec![0u8; block.len() as usize]
    } else {
        backend
            .get_object(key, block.start, Some(block.len()))
            .await?
    });
    Ok(())
}

/// Merge every interior block below the part floor into its successor so
/// the store accepts the completed upload. Merged blocks carry their
/// combined bytes and are uploaded as regular parts.
async fn combine_undersized<B: ObjectBackend>(
    backend: &B,
    cfg: &CloudConfig,
    key: &str,
    bol: &mut BlockOffsetList,
) -> Result<()> {
    let mut i = 0;
    while i + 1 < bol.blocks.len() {
        if bol.blocks[i].len() >= cfg.min_part_size {
            i += 1;
            continue;
        }
        materialize(backend, key, &mut bol.blocks[i]).await?;
        materialize(backend, key, &mut bol.blocks[i + 1]).await?;
        let next = bol.blocks.remove(i + 1);
        let block = &mut bol.blocks[i];
        let data = block.data.as_mut().unwrap();
        data.extend_from_slice(next.data.as_deref().unwrap());
        block.end = next.end;
        block.id = new_block_id(bol.id_length.max(1));
        block.dirty = true;
        block.truncated = false;
    }
    Ok(())
}

async fn upload_all_parts<B: ObjectBackend>(
    backend: &B,
    cfg: &CloudConfig,
    key: &str,
    upload_id: &str,
    bol: &BlockOffsetList,
) -> Result<Vec<PartHandle>> {
    let uploads = bol.blocks.iter().enumerate().map(|(i, block)| {
        let part_number = i as i32 + 1;
        async move {
            if block.dirty {
                let data = match &block.data {
                    Some(data) => data.clone(),
                    None => vec![0u8; block.len() as usize],
                };
                backend.upload_part(key, upload_id, part_number, data).await
            } else {
                backend
                    .upload_part_copy(key, upload_id, part_number, key, block.start..block.end)
                    .await
            }
        }
    });
    let mut stream = futures::stream::iter(uploads).buffer_unordered(cfg.upload_concurrency.max(1));
    let mut parts = Vec::with_capacity(bol.blocks.len());
    while let Some(handle) = stream.next().await {
        parts.push(handle?);
    }
    drop(stream);
    parts.sort_by_key(|p| p.part_number);
    Ok(parts)
}

async fn abort_quietly<B: ObjectBackend>(backend: &B, key: &str, upload_id: &str) {
    if let Err(err) = backend.abort_multipart(key, upload_id).await {
        warn!("failed to abort multipart upload {upload_id} for {key}: {err}");
    }
}

fn blocks_contiguous(bol: &BlockOffsetList) -> bool {
    let mut expected = 0;
    for block in &bol.blocks {
        if block.start != expected || block.is_empty() {
            return false;
        }
        expected = block.end;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryBackend;
    use crate::error::StorageError;

    fn small_cfg() -> CloudConfig {
        CloudConfig {
            bucket_name: "b".into(),
            part_size: 8,
            min_part_size: 4,
            upload_cutoff: 16,
            ..Default::default()
        }
    }

    fn backend() -> InMemoryBackend {
        InMemoryBackend::with_min_part_size("b", 4)
    }

    async fn seed(backend: &InMemoryBackend, key: &str, data: &[u8]) {
        backend
            .put_object(key, data.to_vec(), &HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_small_overlay() {
        let backend = backend();
        seed(&backend, "f", b"test-data").await;
        let size = write_small(&backend, "f", 5, b"newdata").await.unwrap();
        assert_eq!(size, 12);
        assert_eq!(backend.object_data("f").unwrap(), b"test-newdata");
    }

    #[tokio::test]
    async fn test_write_small_gap_zero_filled() {
        let backend = backend();
        seed(&backend, "f", b"123456789").await;
        let size = write_small(&backend, "f", 12, b"newdata").await.unwrap();
        assert_eq!(size, 19);
        let expected = b"123456789\0\0\0newdata";
        assert_eq!(backend.object_data("f").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_small_creates_missing_object() {
        let backend = backend();
        let size = write_small(&backend, "f", 0, b"abc").await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(backend.object_data("f").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_block_write_then_commit_rewrites_span() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789abcdefghij").await;

        let mut bol = BlockOffsetList::from_size(20, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 6, b"XYZ")
            .await
            .unwrap();
        // remote untouched until commit
        assert_eq!(backend.object_data("f").unwrap(), b"0123456789abcdefghij");

        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
        assert_eq!(backend.object_data("f").unwrap(), b"012345XYZ9abcdefghij");
        assert!(!bol.has_dirty());
    }

    #[tokio::test]
    async fn test_block_write_past_end_zero_fills() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"01234567").await;

        let mut bol = BlockOffsetList::from_size(8, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 20, b"tail")
            .await
            .unwrap();
        assert_eq!(bol.file_size(), 24);
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();

        let mut expected = b"01234567".to_vec();
        expected.resize(20, 0);
        expected.extend_from_slice(b"tail");
        assert_eq!(backend.object_data("f").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_zero_length_write_does_not_extend() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"123456789").await;

        let size = write_small(&backend, "f", 20, b"").await.unwrap();
        assert_eq!(size, 9);
        assert_eq!(backend.object_data("f").unwrap(), b"123456789");

        let mut bol = BlockOffsetList::from_size(9, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 50, b"")
            .await
            .unwrap();
        assert_eq!(bol.file_size(), 9);
        assert!(!bol.has_dirty());
    }

    #[tokio::test]
    async fn test_write_onto_extension_block_clears_zero_fill_state() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"01234567").await;

        let mut bol = BlockOffsetList::from_size(8, cfg.part_size);
        // blocks [8,16) and [16,24) are synthesized; the write lands on
        // the second one only
        write_blocks(&backend, &cfg, "f", &mut bol, 20, b"tail")
            .await
            .unwrap();
        assert!(bol.blocks[1].truncated);
        assert!(!bol.blocks[2].truncated);
        assert!(bol.blocks[2].data.is_some());
    }

    #[tokio::test]
    async fn test_commit_without_dirty_blocks_is_noop() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789abcdefghij").await;
        let mut bol = BlockOffsetList::from_size(20, cfg.part_size);

        // unreachable remote proves no call is made
        backend.set_unreachable(true);
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
        backend.set_unreachable(false);

        write_blocks(&backend, &cfg, "f", &mut bol, 0, b"AB")
            .await
            .unwrap();
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
        assert_eq!(&backend.object_data("f").unwrap()[..2], b"AB");

        backend.set_unreachable(true);
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_combines_undersized_interior_blocks() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789").await;

        // blocks [0,8) and [8,10); the 2-byte tail becomes interior once
        // the file grows past it
        let mut bol = BlockOffsetList::from_size(10, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 10, b"ABCDEFGH")
            .await
            .unwrap();
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
        assert_eq!(backend.object_data("f").unwrap(), b"0123456789ABCDEFGH");
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_object_untouched() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789abcdefghij").await;

        let mut bol = BlockOffsetList::from_size(20, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 0, b"XX")
            .await
            .unwrap();
        backend.set_fail_part_uploads(true);
        let err = commit(&backend, &cfg, "f", &mut bol).await;
        assert!(matches!(err, Err(StorageError::Remote { .. })));
        assert_eq!(backend.pending_uploads(), 0);
        assert_eq!(backend.object_data("f").unwrap(), b"0123456789abcdefghij");
        // still dirty, a later retry can succeed
        assert!(bol.has_dirty());
        backend.set_fail_part_uploads(false);
        commit(&backend, &cfg, "f", &mut bol).await.unwrap();
        assert_eq!(&backend.object_data("f").unwrap()[..2], b"XX");
    }

    #[tokio::test]
    async fn test_read_blocks_sees_buffered_writes() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789abcdefghij").await;

        let mut bol = BlockOffsetList::from_size(20, cfg.part_size);
        write_blocks(&backend, &cfg, "f", &mut bol, 6, b"XYZ")
            .await
            .unwrap();
        let read = read_blocks(&backend, "f", &mut bol, 4, 8).await.unwrap();
        assert_eq!(read, b"45XYZ9ab");
        // read past end is cut short, read at end is empty
        let read = read_blocks(&backend, "f", &mut bol, 18, 10).await.unwrap();
        assert_eq!(read, b"ij");
        assert!(read_blocks(&backend, "f", &mut bol, 20, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_blocks_shrink_and_grow() {
        let backend = backend();
        let cfg = small_cfg();
        seed(&backend, "f", b"0123456789abcdefghij").await;

        let mut bol = BlockOffsetList::from_size(20, cfg.part_size);
        truncate_blocks(&backend, &cfg, "f", &mut bol, 10)
            .await
            .unwrap();
        assert_eq!(backend.object_data("f").unwrap(), b"0123456789");

        truncate_blocks(&backend, &cfg, "f", &mut bol, 15)
            .await
            .unwrap();
        let mut expected = b"0123456789".to_vec();
        expected.resize(15, 0);
        assert_eq!(backend.object_data("f").unwrap(), expected);

        truncate_blocks(&backend, &cfg, "f", &mut bol, 0)
            .await
            .unwrap();
        assert_eq!(backend.object_data("f").unwrap(), b"");
    }
}
