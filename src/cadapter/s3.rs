//! S3 backend built on aws-sdk-s3.
//!
//! Every SDK error is translated into [`StorageError`] here, at the
//! boundary, so nothing above this module ever sees an SDK error chain.
//! Uploads carry a Content-MD5 header; full integrity checksums
//! (CRC32/CRC32C/SHA1/SHA256) are added on top when checksum mode is on.

use crate::cadapter::client::{ListPage, ObjectBackend, ObjectInfo, PartHandle};
use crate::config::{ChecksumKind, CloudConfig};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::DateTime;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use log::{debug, warn};
use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct S3Backend {
    client: Client,
    bucket: String,
    enable_checksum: bool,
    checksum_kind: ChecksumKind,
}

impl S3Backend {
    /// Builds a client from a validated [`CloudConfig`]. Empty `access_key`
    /// falls back to the environment credential chain.
    pub async fn new(cfg: &CloudConfig) -> Result<Self> {
        let mut loader = aws_config::ConfigLoader::default().region(Region::new(cfg.region.clone()));
        loader = if cfg.access_key.is_empty() {
            loader.credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
        } else {
            loader.credentials_provider(Credentials::new(
                cfg.access_key.clone(),
                cfg.secret_key.clone(),
                None,
                None,
                "config",
            ))
        };
        if !cfg.endpoint.is_empty() {
            loader = loader.endpoint_url(cfg.endpoint.clone());
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(cfg.use_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            bucket: cfg.bucket_name.clone(),
            enable_checksum: cfg.enable_checksum,
            checksum_kind: cfg.checksum_algorithm,
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        B64.encode(md5::compute(data).0)
    }

    fn checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        if !self.enable_checksum {
            return None;
        }
        Some(match self.checksum_kind {
            ChecksumKind::Crc32 => ChecksumAlgorithm::Crc32,
            ChecksumKind::Crc32c => ChecksumAlgorithm::Crc32C,
            ChecksumKind::Sha1 => ChecksumAlgorithm::Sha1,
            ChecksumKind::Sha256 => ChecksumAlgorithm::Sha256,
        })
    }

    fn range_header(offset: u64, count: Option<u64>) -> Option<String> {
        match count {
            // an open-ended read from zero needs no Range header, and an
            // explicit one would fail on empty objects
            None if offset == 0 => None,
            None => Some(format!("bytes={offset}-")),
            Some(count) => Some(format!("bytes={offset}-{}", offset + count - 1)),
        }
    }
}

/// Map an SDK error onto the crate taxonomy by service error code.
fn translate<E, R>(operation: &'static str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("NoSuchKey") | Some("NoSuchBucket") | Some("NoSuchUpload") | Some("NotFound") => {
            StorageError::NotFound
        }
        Some("InvalidRange") => StorageError::InvalidRange,
        Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
            StorageError::PermissionDenied
        }
        _ => {
            let message = format!("{}", DisplayErrorContext(&err));
            warn!("s3: {operation} failed: {message}");
            StorageError::remote(operation, message)
        }
    }
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    match dt {
        Some(dt) => UNIX_EPOCH + Duration::from_secs(dt.secs().max(0) as u64),
        None => UNIX_EPOCH,
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn bucket_accessible(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            // any modeled answer means the endpoint is up, just not this
            // bucket for these credentials
            Err(err) if err.as_service_error().is_some() => Ok(false),
            Err(err) => Err(translate("HeadBucket", err)),
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| translate("ListBuckets", e))?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn get_object(&self, key: &str, offset: u64, count: Option<u64>) -> Result<Vec<u8>> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = Self::range_header(offset, count) {
            req = req.range(range);
        }
        let resp = req.send().await.map_err(|e| {
            if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                StorageError::NotFound
            } else {
                translate("GetObject", e)
            }
        })?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::remote("GetObject", e))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectInfo> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    StorageError::NotFound
                } else {
                    translate("HeadObject", e)
                }
            })?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            last_modified: to_system_time(resp.last_modified()),
            etag: resp.e_tag().map(str::to_string),
            metadata: resp.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_md5(Self::md5_base64(&data))
            .body(data.into());
        if let Some(alg) = self.checksum_algorithm() {
            req = req.checksum_algorithm(alg);
        }
        if !metadata.is_empty() {
            req = req.set_metadata(Some(metadata.clone()));
        }
        req.send().await.map_err(|e| translate("PutObject", e))?;
        Ok(())
    }

    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(target_key)
            .send()
            .await
            .map_err(|e| translate("CopyObject", e))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| translate("DeleteObject", e))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut identifiers = Vec::with_capacity(keys.len());
        for key in keys {
            identifiers.push(
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| StorageError::remote("DeleteObjects", e))?,
            );
        }
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| StorageError::remote("DeleteObjects", e))?;
        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| translate("DeleteObjects", e))?;
        if let Some(first) = resp.errors().first() {
            return Err(StorageError::remote(
                "DeleteObjects",
                format!(
                    "{}: {}",
                    first.key().unwrap_or("?"),
                    first.message().unwrap_or("delete failed")
                ),
            ));
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
        let mut req = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_count);
        if delimited {
            req = req.delimiter("/");
        }
        if let Some(token) = token {
            req = req.continuation_token(token);
        }
        let resp = req.send().await.map_err(|e| translate("ListObjectsV2", e))?;
        Ok(ListPage {
            objects: resp
                .contents()
                .iter()
                .filter_map(|o| {
                    o.key().map(|key| ObjectInfo {
                        key: key.to_string(),
                        size: o.size().unwrap_or(0).max(0) as u64,
                        last_modified: to_system_time(o.last_modified()),
                        etag: o.e_tag().map(str::to_string),
                        metadata: HashMap::new(),
                    })
                })
                .collect(),
            common_prefixes: resp
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix().map(str::to_string))
                .collect(),
            next_token: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn create_multipart(&self, key: &str) -> Result<String> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);
        if let Some(alg) = self.checksum_algorithm() {
            req = req.checksum_algorithm(alg);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| translate("CreateMultipartUpload", e))?;
        let upload_id = resp.upload_id().ok_or_else(|| {
            StorageError::remote("CreateMultipartUpload", "response carried no upload id")
        })?;
        debug!("s3: started multipart upload {upload_id} for {key}");
        Ok(upload_id.to_string())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<PartHandle> {
        let mut req = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(Self::md5_base64(&data))
            .body(data.into());
        if let Some(alg) = self.checksum_algorithm() {
            req = req.checksum_algorithm(alg);
        }
        let resp = req.send().await.map_err(|e| translate("UploadPart", e))?;
        let checksum = match self.checksum_kind {
            ChecksumKind::Crc32 => resp.checksum_crc32(),
            ChecksumKind::Crc32c => resp.checksum_crc32_c(),
            ChecksumKind::Sha1 => resp.checksum_sha1(),
            ChecksumKind::Sha256 => resp.checksum_sha256(),
        };
        Ok(PartHandle {
            part_number,
            etag: resp.e_tag().map(str::to_string),
            checksum: checksum.map(str::to_string),
        })
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
        range: Range<u64>,
    ) -> Result<PartHandle> {
        // copy-source-range end is inclusive
        let resp = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .copy_source_range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|e| translate("UploadPartCopy", e))?;
        let result = resp.copy_part_result();
        let checksum = result.and_then(|r| match self.checksum_kind {
            ChecksumKind::Crc32 => r.checksum_crc32(),
            ChecksumKind::Crc32c => r.checksum_crc32_c(),
            ChecksumKind::Sha1 => r.checksum_sha1(),
            ChecksumKind::Sha256 => r.checksum_sha256(),
        });
        Ok(PartHandle {
            part_number,
            etag: result.and_then(|r| r.e_tag()).map(str::to_string),
            checksum: checksum.map(str::to_string),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartHandle>,
    ) -> Result<()> {
        let completed_parts = parts
            .into_iter()
            .map(|p| {
                let mut builder = CompletedPart::builder()
                    .part_number(p.part_number)
                    .set_e_tag(p.etag);
                if let Some(checksum) = p.checksum {
                    builder = match self.checksum_kind {
                        ChecksumKind::Crc32 => builder.checksum_crc32(checksum),
                        ChecksumKind::Crc32c => builder.checksum_crc32_c(checksum),
                        ChecksumKind::Sha1 => builder.checksum_sha1(checksum),
                        ChecksumKind::Sha256 => builder.checksum_sha256(checksum),
                    };
                }
                builder.build()
            })
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| translate("CompleteMultipartUpload", e))?;
        debug!("s3: completed multipart upload {upload_id} for {key}");
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| translate("AbortMultipartUpload", e))?;
        Ok(())
    }
}
