//! Object-store access behind a narrow seam.
//!
//! The signed transport itself belongs to the vendor SDK; this module wraps
//! the handful of calls the pipeline needs so the lister and downloader can
//! run against an in-memory store in tests.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::config::Configuration;
use crate::error::SyncError;

/// One object descriptor from a listing page.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub size: i64,
    /// As reported by the store, possibly still wrapped in quotes.
    pub etag: String,
}

/// One page of a bucket listing.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Continuation token for the next page; `None` when the listing is done.
    pub next_token: Option<String>,
}

/// The remote operations the pipeline depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Existence and auth probe for the configured bucket.
    async fn bucket_exists(&self) -> Result<(), SyncError>;

    /// Fetches one listing page, continuing from `token` when given.
    async fn list_page(&self, max_keys: i32, token: Option<&str>)
        -> Result<ObjectPage, SyncError>;

    /// Fetches the inclusive byte range `[start, end]` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, SyncError>;
}

/// Production store over the vendor SDK.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Builds a client for the configured endpoint with static credentials,
    /// then probes transfer acceleration and re-targets the accelerated
    /// endpoint when the bucket has it enabled.
    pub async fn connect(cfg: &Configuration) -> Result<Self, SyncError> {
        let client = aws_sdk_s3::Client::from_conf(Self::base_config(cfg, false));
        let mut store = S3Store {
            client,
            bucket: cfg.bucket_name.clone(),
            prefix: cfg.s3_prefix.clone(),
        };

        if store.acceleration_enabled().await.unwrap_or(false) {
            info!("transfer acceleration is enabled for {}", store.bucket);
            store.client = aws_sdk_s3::Client::from_conf(Self::base_config(cfg, true));
        }
        Ok(store)
    }

    fn base_config(cfg: &Configuration, accelerate: bool) -> aws_sdk_s3::Config {
        let conn = &cfg.s3_connection;
        let credentials = aws_credential_types::Credentials::new(
            conn.access_key_id.clone(),
            conn.secret_access_key.clone(),
            None,
            None,
            "static",
        );
        aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .endpoint_url(&conn.endpoint)
            .region(aws_sdk_s3::config::Region::new(conn.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .accelerate(accelerate)
            .build()
    }

    async fn acceleration_enabled(&self) -> Result<bool, SyncError> {
        let out = self
            .client
            .get_bucket_accelerate_configuration()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| SyncError::Remote(e.to_string()))?;
        Ok(matches!(
            out.status(),
            Some(aws_sdk_s3::types::BucketAccelerateStatus::Enabled)
        ))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn bucket_exists(&self) -> Result<(), SyncError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| SyncError::Bucket(format!("{}: {e}", self.bucket)))
    }

    async fn list_page(
        &self,
        max_keys: i32,
        token: Option<&str>,
    ) -> Result<ObjectPage, SyncError> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max_keys);
        if !self.prefix.is_empty() {
            request = request.prefix(&self.prefix);
        }
        if let Some(token) = token {
            request = request.continuation_token(token);
        }
        let out = request
            .send()
            .await
            .map_err(|e| SyncError::Remote(e.to_string()))?;

        let objects = out
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(RemoteObject {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0),
                    etag: obj.e_tag().unwrap_or_default().to_string(),
                })
            })
            .collect();
        let next_token = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
        })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, SyncError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| SyncError::Remote(format!("{key}: {e}")))?;
        let body = out
            .body
            .collect()
            .await
            .map_err(|e| SyncError::Remote(format!("{key}: {e}")))?;
        Ok(body.into_bytes())
    }
}
