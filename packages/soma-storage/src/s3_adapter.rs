/// S3-compatible adapter family: native S3, Cloudflare R2, and GCS in
/// interoperability mode share this one HTTP path. R2/GCS differ only in
/// `endpoint_url` (and path-style addressing for some gateways).
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::adapter::{ListPage, StorageAdapter, StorageClass};
use crate::error::{Result, SomaError};

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix inside the bucket; lets several stores share a bucket.
    pub prefix: String,
    pub region: Option<String>,
    /// Custom endpoint for R2 / GCS / MinIO-style gateways.
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub read_only: bool,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            region: None,
            endpoint_url: None,
            force_path_style: false,
            read_only: false,
        }
    }
}

pub struct S3CompatAdapter {
    client: Client,
    bucket: String,
    prefix: String,
    read_only: bool,
}

impl S3CompatAdapter {
    /// Builds a client from the ambient AWS environment (credentials,
    /// region) plus any endpoint override in the config.
    pub async fn connect(config: S3Config) -> Result<Self> {
        let base = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone());
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
            read_only: config.read_only,
        }
    }

    fn object_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), path)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.trim_end_matches('/'))
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }

    fn classify<E>(key: &str, err: &SdkError<E>) -> SomaError
    where
        E: ProvideErrorMetadata + std::fmt::Debug,
    {
        match err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                SomaError::transient(key, format!("{err:?}"))
            }
            SdkError::ServiceError(ctx) => {
                let code = ctx.err().code().unwrap_or("");
                match code {
                    "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => {
                        SomaError::PermissionDenied {
                            key: key.to_string(),
                        }
                    }
                    "QuotaExceeded" | "EntityTooLarge" => SomaError::QuotaExceeded {
                        key: key.to_string(),
                    },
                    "NoSuchKey" | "NotFound" => SomaError::not_found(key),
                    "SlowDown" | "TooManyRequests" | "RequestTimeout" | "InternalError"
                    | "ServiceUnavailable" => SomaError::transient(key, code),
                    other => SomaError::fatal(format!("s3 error on {key}: {other}: {err:?}")),
                }
            }
            _ => SomaError::fatal(format!("s3 error on {key}: {err:?}")),
        }
    }
}

#[async_trait]
impl StorageAdapter for S3CompatAdapter {
    fn name(&self) -> &'static str {
        "s3-compatible"
    }

    fn storage_class(&self) -> StorageClass {
        StorageClass::Cloud
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn write_object(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let key = self.object_key(path);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Self::classify(path, &e))?;
        Ok(())
    }

    async fn read_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = self.object_key(path);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;
        match resp {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| SomaError::transient(path, e.to_string()))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_no_such_key() => Ok(None),
            Err(err) => match Self::classify(path, &err) {
                SomaError::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        let key = self.object_key(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::classify(path, &e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<ListPage> {
        let full_prefix = self.object_key(prefix);
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .max_keys(limit.min(i32::MAX as usize) as i32);
        if let Some(token) = cursor {
            request = request.continuation_token(token);
        }
        let output = request
            .send()
            .await
            .map_err(|e| Self::classify(prefix, &e))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .map(|key| self.strip_prefix(key).to_string())
            .collect();
        let next_cursor = output.next_continuation_token().map(str::to_string);
        let has_more = output.is_truncated().unwrap_or(false) && next_cursor.is_some();
        Ok(ListPage {
            keys,
            has_more,
            next_cursor,
        })
    }
}
