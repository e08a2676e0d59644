//! Configuration surface of the storage layer.
//!
//! The config file itself is owned by an external loader; only the keys
//! recognized here matter to this crate. Defaults follow the reference
//! deployment (8 MiB parts, 5 MiB part floor, multipart above 64 MiB).

use crate::error::{Result, StorageError};
use serde::Deserialize;

pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Checksum algorithm requested on uploads when `enable_checksum` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    Crc32,
    Crc32c,
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub bucket_name: String,
    pub region: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Restricts the mount to a sub-tree of the bucket.
    pub subdirectory: String,

    /// Size of one upload part. Clamped to [5 MiB, 5 GiB] by `validate`.
    pub part_size: u64,
    /// Objects at or above this size are managed as multipart.
    pub upload_cutoff: u64,
    /// Every part except the last must be at least this large. 5 MiB in the
    /// reference deployment; tests lower it to exercise part combination.
    pub min_part_size: u64,
    pub upload_concurrency: usize,

    pub enable_checksum: bool,
    pub checksum_algorithm: ChecksumKind,

    /// Path-style addressing (`endpoint/bucket/key`) instead of
    /// virtual-host addressing. Required by MinIO-style deployments.
    pub use_path_style: bool,
    /// Write zero-byte marker objects for explicitly created directories.
    pub create_dir_markers: bool,
    pub enable_symlinks: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            region: "us-east-1".to_string(),
            endpoint: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            subdirectory: String::new(),
            part_size: 8 * 1024 * 1024,
            upload_cutoff: 64 * 1024 * 1024,
            min_part_size: MIN_PART_SIZE,
            upload_concurrency: 8,
            enable_checksum: false,
            checksum_algorithm: ChecksumKind::Crc32,
            use_path_style: false,
            create_dir_markers: false,
            enable_symlinks: true,
        }
    }
}

impl CloudConfig {
    pub fn validate(&mut self) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(StorageError::Config("bucket-name is required".into()));
        }
        if self.part_size < MIN_PART_SIZE || self.part_size > MAX_PART_SIZE {
            return Err(StorageError::Config(format!(
                "part-size {} outside [{MIN_PART_SIZE}, {MAX_PART_SIZE}]",
                self.part_size
            )));
        }
        if self.min_part_size < MIN_PART_SIZE || self.min_part_size > self.part_size {
            return Err(StorageError::Config(format!(
                "min-part-size {} outside [{MIN_PART_SIZE}, part-size]",
                self.min_part_size
            )));
        }
        if self.upload_cutoff < self.min_part_size {
            return Err(StorageError::Config(format!(
                "upload-cutoff {} below minimum part size {}",
                self.upload_cutoff, self.min_part_size
            )));
        }
        if self.upload_concurrency == 0 {
            return Err(StorageError::Config("upload-concurrency must be > 0".into()));
        }
        self.endpoint = normalize_endpoint(&self.endpoint);
        self.subdirectory = self
            .subdirectory
            .trim_matches('/')
            .to_string();
        Ok(())
    }
}

/// Prepend a scheme when the endpoint is a bare host and make sure it ends
/// with a slash, so URL joining behaves.
fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.is_empty() {
        return String::new();
    }
    let mut out = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}
