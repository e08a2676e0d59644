//! In-memory object store used by the test suite.
//!
//! Mirrors the observable S3 behaviors the storage layer depends on:
//! lexicographic listing with delimiter folding and continuation tokens,
//! ranged reads, server-side part copy, and the minimum-part-size rule on
//! multipart completion. Failure injection hooks let tests exercise the
//! abort and offline paths.

use crate::cadapter::client::{ListPage, ObjectBackend, ObjectInfo, PartHandle};
use crate::config::MIN_PART_SIZE;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    last_modified: SystemTime,
    etag: String,
}

struct Upload {
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

pub struct InMemoryBackend {
    bucket: String,
    min_part_size: u64,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, Upload>>,
    next_upload_id: AtomicU64,
    fail_part_uploads: AtomicBool,
    unreachable: AtomicBool,
}

impl InMemoryBackend {
    pub fn new(bucket: &str) -> Self {
        Self::with_min_part_size(bucket, MIN_PART_SIZE)
    }

    /// Tests lower the part floor so multipart protocols can be exercised
    /// with kilobyte-sized fixtures.
    pub fn with_min_part_size(bucket: &str, min_part_size: u64) -> Self {
        Self {
            bucket: bucket.to_string(),
            min_part_size,
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload_id: AtomicU64::new(1),
            fail_part_uploads: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail as if the endpoint were down.
    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    /// Make every subsequent `upload_part` fail; completion never happens.
    pub fn set_fail_part_uploads(&self, value: bool) {
        self.fail_part_uploads.store(value, Ordering::SeqCst);
    }

    /// Raw object bytes, for assertions.
    pub fn object_data(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn check_reachable(&self, operation: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StorageError::remote(operation, "connection refused"))
        } else {
            Ok(())
        }
    }

    fn etag_for(data: &[u8]) -> String {
        hex::encode(md5::compute(data).0)
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn bucket_accessible(&self, bucket: &str) -> Result<bool> {
        self.check_reachable("HeadBucket")?;
        Ok(bucket == self.bucket)
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        self.check_reachable("ListBuckets")?;
        Ok(vec![self.bucket.clone()])
    }

    async fn get_object(&self, key: &str, offset: u64, count: Option<u64>) -> Result<Vec<u8>> {
        self.check_reachable("GetObject")?;
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or(StorageError::NotFound)?;
        let len = object.data.len() as u64;
        // an unranged read of an empty object is fine; any other read
        // starting at or past the end is not satisfiable
        if offset == 0 && count.is_none() {
            return Ok(object.data.clone());
        }
        if offset >= len {
            return Err(StorageError::InvalidRange);
        }
        let end = match count {
            Some(count) => (offset + count).min(len),
            None => len,
        };
        Ok(object.data[offset as usize..end as usize].to_vec())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectInfo> {
        self.check_reachable("HeadObject")?;
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or(StorageError::NotFound)?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: Some(object.etag.clone()),
            metadata: object.metadata.clone(),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.check_reachable("PutObject")?;
        let etag = Self::etag_for(&data);
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
                last_modified: SystemTime::now(),
                etag,
            },
        );
        Ok(())
    }

    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<()> {
        self.check_reachable("CopyObject")?;
        let mut objects = self.objects.lock().unwrap();
        let mut copy = objects.get(source_key).ok_or(StorageError::NotFound)?.clone();
        copy.last_modified = SystemTime::now();
        objects.insert(target_key.to_string(), copy);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_reachable("DeleteObject")?;
        // S3 DeleteObject succeeds whether or not the key exists
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        self.check_reachable("DeleteObjects")?;
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
        max_count: i32,
    ) -> Result<ListPage> {
        self.check_reachable("ListObjectsV2")?;
        let objects = self.objects.lock().unwrap();
        let mut page = ListPage::default();
        let mut emitted = 0i32;
        let mut last_scanned: Option<String> = None;
        let mut truncated = false;

        let range: Box<dyn Iterator<Item = (&String, &StoredObject)>> = match token {
            Some(token) => {
                Box::new(objects.range::<String, _>((Excluded(token.to_string()), Unbounded)))
            }
            None => Box::new(objects.iter()),
        };
        for (key, object) in range {
            if !key.starts_with(prefix) {
                if key.as_str() > prefix && !prefix.is_empty() {
                    break;
                }
                continue;
            }
            let remainder = &key[prefix.len()..];
            let folded = if delimited {
                remainder.find('/').map(|i| format!("{prefix}{}", &remainder[..=i]))
            } else {
                None
            };
            match folded {
                Some(common) => {
                    if page.common_prefixes.last() != Some(&common) {
                        if emitted == max_count {
                            truncated = true;
                            break;
                        }
                        page.common_prefixes.push(common);
                        emitted += 1;
                    }
                }
                None => {
                    if emitted == max_count {
                        truncated = true;
                        break;
                    }
                    page.objects.push(ObjectInfo {
                        key: key.clone(),
                        size: object.data.len() as u64,
                        last_modified: object.last_modified,
                        etag: Some(object.etag.clone()),
                        metadata: object.metadata.clone(),
                    });
                    emitted += 1;
                }
            }
            last_scanned = Some(key.clone());
        }
        if truncated {
            page.next_token = last_scanned;
        }
        Ok(page)
    }

    async fn create_multipart(&self, key: &str) -> Result<String> {
        self.check_reachable("CreateMultipartUpload")?;
        let id = format!(
            "upload-{}",
            self.next_upload_id.fetch_add(1, Ordering::SeqCst)
        );
        self.uploads.lock().unwrap().insert(
            id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<PartHandle> {
        self.check_reachable("UploadPart")?;
        if self.fail_part_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::remote("UploadPart", "injected failure"));
        }
        let etag = Self::etag_for(&data);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads.get_mut(upload_id).ok_or_else(|| {
            StorageError::remote("UploadPart", format!("no such upload {upload_id}"))
        })?;
        upload.parts.insert(part_number, data);
        Ok(PartHandle {
            part_number,
            etag: Some(etag),
            checksum: None,
        })
    }

    async fn upload_part_copy(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
        range: Range<u64>,
    ) -> Result<PartHandle> {
        self.check_reachable("UploadPartCopy")?;
        let data = {
            let objects = self.objects.lock().unwrap();
            let source = objects.get(source_key).ok_or(StorageError::NotFound)?;
            if range.end > source.data.len() as u64 || range.start >= range.end {
                return Err(StorageError::InvalidRange);
            }
            source.data[range.start as usize..range.end as usize].to_vec()
        };
        let etag = Self::etag_for(&data);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads.get_mut(upload_id).ok_or_else(|| {
            StorageError::remote("UploadPartCopy", format!("no such upload {upload_id}"))
        })?;
        upload.parts.insert(part_number, data);
        Ok(PartHandle {
            part_number,
            etag: Some(etag),
            checksum: None,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> Result<()> {
        self.check_reachable("CompleteMultipartUpload")?;
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads.remove(upload_id).ok_or_else(|| {
            StorageError::remote("CompleteMultipartUpload", format!("no such upload {upload_id}"))
        })?;
        if upload.key != key {
            return Err(StorageError::remote(
                "CompleteMultipartUpload",
                "upload id does not match key",
            ));
        }
        let mut data = Vec::new();
        for (i, handle) in parts.iter().enumerate() {
            let part = upload.parts.get(&handle.part_number).ok_or_else(|| {
                StorageError::remote(
                    "CompleteMultipartUpload",
                    format!("InvalidPart: part {} was not uploaded", handle.part_number),
                )
            })?;
            if i + 1 < parts.len() && (part.len() as u64) < self.min_part_size {
                return Err(StorageError::remote(
                    "CompleteMultipartUpload",
                    format!("EntityTooSmall: part {} is {} bytes", handle.part_number, part.len()),
                ));
            }
            data.extend_from_slice(part);
        }
        let etag = format!("{}-{}", Self::etag_for(&data), parts.len());
        drop(uploads);
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: HashMap::new(),
                last_modified: SystemTime::now(),
                etag,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.check_reachable("AbortMultipartUpload")?;
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let backend = InMemoryBackend::new("b");
        backend.put_object("k", b"hello".to_vec(), &meta()).await.unwrap();
        assert_eq!(backend.get_object("k", 0, None).await.unwrap(), b"hello");
        assert_eq!(backend.get_object("k", 1, Some(3)).await.unwrap(), b"ell");
        assert!(matches!(
            backend.get_object("k", 9, Some(1)).await,
            Err(StorageError::InvalidRange)
        ));
        assert!(matches!(
            backend.get_object("missing", 0, None).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delimited_listing_folds_prefixes() {
        let backend = InMemoryBackend::new("b");
        for key in ["a/c1/gc1", "a/c2", "ab/c1", "ac"] {
            backend.put_object(key, vec![1], &meta()).await.unwrap();
        }
        let page = backend.list_page("a/", true, None, 1000).await.unwrap();
        assert_eq!(page.common_prefixes, vec!["a/c1/".to_string()]);
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/c2"]);

        let root = backend.list_page("", true, None, 1000).await.unwrap();
        assert_eq!(root.common_prefixes, vec!["a/".to_string(), "ab/".to_string()]);
        let keys: Vec<_> = root.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["ac"]);
    }

    #[tokio::test]
    async fn test_listing_pagination_tokens() {
        let backend = InMemoryBackend::new("b");
        for i in 0..10 {
            backend
                .put_object(&format!("d/{i:02}"), vec![0], &meta())
                .await
                .unwrap();
        }
        let mut token: Option<String> = None;
        let mut seen = Vec::new();
        loop {
            let page = backend
                .list_page("d/", true, token.as_deref(), 3)
                .await
                .unwrap();
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 10);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_multipart_min_part_size_enforced() {
        let backend = InMemoryBackend::with_min_part_size("b", 8);
        let id = backend.create_multipart("k").await.unwrap();
        let p1 = backend.upload_part("k", &id, 1, vec![1; 4]).await.unwrap();
        let p2 = backend.upload_part("k", &id, 2, vec![2; 4]).await.unwrap();
        let err = backend.complete_multipart("k", &id, vec![p1, p2]).await;
        assert!(err.is_err());
        // upload is gone after the failed completion attempt consumed it
        assert_eq!(backend.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_multipart_copy_and_complete() {
        let backend = InMemoryBackend::with_min_part_size("b", 4);
        backend
            .put_object("src", b"0123456789".to_vec(), &meta())
            .await
            .unwrap();
        let id = backend.create_multipart("dst").await.unwrap();
        let p1 = backend
            .upload_part_copy("dst", &id, 1, "src", 0..5)
            .await
            .unwrap();
        let p2 = backend.upload_part("dst", &id, 2, b"xy".to_vec()).await.unwrap();
        backend.complete_multipart("dst", &id, vec![p1, p2]).await.unwrap();
        assert_eq!(backend.object_data("dst").unwrap(), b"01234xy");
    }
}
