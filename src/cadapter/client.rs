//! Backend abstraction for the object store.
//!
//! The storage component talks to the remote exclusively through
//! [`ObjectBackend`]; one implementation wraps aws-sdk-s3 (`s3.rs`), a
//! second keeps everything in memory for tests (`memory.rs`). Keys passed
//! here are full physical keys, already run through the key mapper.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Range;
use std::time::SystemTime;

/// Metadata view of one remote object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// One page of a delimiter listing.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// Identifier returned for each uploaded or copied part, collected in
/// part-number order. `checksum` is populated only when checksum mode is on.
#[derive(Debug, Clone)]
pub struct PartHandle {
    pub part_number: i32,
    pub etag: Option<String>,
    pub checksum: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Lightweight reachability/authorization probe against a bucket.
    async fn bucket_accessible(&self, bucket: &str) -> Result<bool>;

    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// Ranged read. `count` of `None` reads to the end of the object.
    async fn get_object(&self, key: &str, offset: u64, count: Option<u64>) -> Result<Vec<u8>>;

    async fn head_object(&self, key: &str) -> Result<ObjectInfo>;

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<()>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Batch delete. Backends keep deleting remaining keys when one fails
    /// and report the first hard error.
    async fn delete_objects(&self, keys: &[String]) -> Result<()>;

    /// One page of a flat-key listing. `delimited` asks the store to fold
    /// keys at the next `/` into common prefixes.
    async fn list_page(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
        max_count: i32,
    ) -> Result<ListPage>;

    async fn create_multipart(&self, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<PartHandle>;

    /// Server-side copy of `range` bytes of `source_key` into a part,
    /// avoiding a redundant download+upload of unchanged data.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
        range: Range<u64>,
    ) -> Result<PartHandle>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> Result<()>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}
