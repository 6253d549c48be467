use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, error::DisplayErrorContext, operation::get_object::GetObjectError, Client};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{GetObjectOutput, ListedObject, ObjectPager, ObjectStoreApi};
use crate::error::ObjectStoreError;

#[derive(Debug, Clone)]
pub struct S3ClientConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub path_style: bool,
    /// Static credentials; the default provider chain is used when unset.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub api_timeout: Duration,
}

/// aws-sdk-s3 backed object store.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    api_timeout: Duration,
}

impl S3ObjectStore {
    pub async fn new(config: S3ClientConfig) -> Self {
        debug!(region = %config.region, endpoint = ?config.endpoint, "initializing S3 client");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = Credentials::new(access_key, secret_key, None, None, "s3feed-static");
            loader = loader.credentials_provider(credentials);
        }

        let sdk_config = loader.load().await;
        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());
        info!(region = %config.region, "S3 client initialized");

        Self {
            client,
            api_timeout: config.api_timeout,
        }
    }

    pub fn from_client(client: Client, api_timeout: Duration) -> Self {
        Self {
            client,
            api_timeout,
        }
    }
}

async fn with_timeout<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T, ObjectStoreError>
where
    F: Future<Output = Result<T, ObjectStoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| {
            Err(ObjectStoreError::Request(format!(
                "{op} timed out after {timeout:?}"
            )))
        })
}

#[async_trait]
impl ObjectStoreApi for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<GetObjectOutput, ObjectStoreError> {
        debug!("Downloading from s3://{}/{}", bucket, key);

        with_timeout(self.api_timeout, "get_object", async {
            let response = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| match err.into_service_error() {
                    GetObjectError::NoSuchKey(_) => ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    },
                    other => ObjectStoreError::Request(DisplayErrorContext(&other).to_string()),
                })?;

            let content_type = response.content_type().map(str::to_string);
            let metadata = response.metadata().cloned().unwrap_or_default();
            let body = response
                .body
                .collect()
                .await
                .map_err(|e| ObjectStoreError::Request(format!("failed to read body: {e}")))?
                .into_bytes()
                .to_vec();

            debug!("Downloaded {} bytes from s3://{}/{}", body.len(), bucket, key);

            Ok(GetObjectOutput {
                content_type,
                metadata,
                body,
            })
        })
        .await
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<String>,
    ) -> Box<dyn ObjectPager> {
        Box::new(S3Pager {
            client: self.client.clone(),
            api_timeout: self.api_timeout,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            start_after,
            continuation: None,
            exhausted: false,
        })
    }
}

struct S3Pager {
    client: Client,
    api_timeout: Duration,
    bucket: String,
    prefix: String,
    start_after: Option<String>,
    continuation: Option<String>,
    exhausted: bool,
}

#[async_trait]
impl ObjectPager for S3Pager {
    fn has_more_pages(&self) -> bool {
        !self.exhausted
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn next_page(&mut self) -> Result<Vec<ListedObject>, ObjectStoreError> {
        let response = with_timeout(self.api_timeout, "list_objects_v2", async {
            self.client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_start_after(self.start_after.clone())
                .set_continuation_token(self.continuation.clone())
                .send()
                .await
                .map_err(|e| ObjectStoreError::Request(DisplayErrorContext(&e).to_string()))
        })
        .await?;

        self.continuation = response.next_continuation_token().map(str::to_string);
        self.exhausted = !response.is_truncated().unwrap_or(false) || self.continuation.is_none();

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                let last_modified = obj
                    .last_modified()
                    .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
                    .unwrap_or_default();
                Some(ListedObject {
                    key,
                    etag: obj.e_tag().unwrap_or_default().to_string(),
                    last_modified,
                })
            })
            .collect();

        Ok(objects)
    }
}
