//! S3-compatible staging store (AWS S3, MinIO)

use super::{ObjectInfo, StagingStore, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use bytes::Bytes;
use url::Url;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Custom endpoint (MinIO, LocalStack); `None` means AWS
    pub endpoint: Option<Url>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Staging store backed by the AWS SDK
///
/// Custom endpoints use path-style addressing, which MinIO requires.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
    region: String,
}

impl S3Store {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "stagepipe",
            );
            loader = loader.credentials_provider(creds);
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &settings.endpoint {
            log::debug!("Using S3 endpoint {}", endpoint);
            builder = builder
                .endpoint_url(endpoint.as_str().trim_end_matches('/'))
                .force_path_style(true);
        }

        Self {
            client: S3Client::from_conf(builder.build()),
            region: settings.region.clone(),
        }
    }

    pub fn from_client(client: S3Client) -> Self {
        let region = client
            .config()
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| S3Settings::default().region);
        Self { client, region }
    }
}

/// Location constraint for CreateBucket; AWS rejects one naming `us-east-1`
/// and requires one for every other region
fn bucket_configuration(region: &str) -> Option<CreateBucketConfiguration> {
    if region.is_empty() || region == "us-east-1" {
        return None;
    }
    Some(
        CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::from(region))
            .build(),
    )
}

/// Staging keys carry a leading `/`; S3 object names do not
fn object_key(key: &str) -> &str {
    key.trim_start_matches('/')
}

fn classify<E>(err: SdkError<E>, bucket: &str, operation: &'static str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    match (err.code(), status) {
        (Some("NoSuchBucket"), _) => StorageError::NoSuchBucket {
            bucket: bucket.to_string(),
        },
        (Some("AccessDenied"), _) | (_, Some(403)) => StorageError::AccessDenied {
            bucket: bucket.to_string(),
            operation,
        },
        _ => StorageError::unavailable(operation, err),
    }
}

#[async_trait]
impl StagingStore for S3Store {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let missing = err.as_service_error().is_some_and(|e| e.is_not_found())
                    || err.raw_response().is_some_and(|r| r.status().as_u16() == 404);
                if missing {
                    Ok(false)
                } else {
                    Err(classify(err, bucket, "bucket_exists"))
                }
            }
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(bucket_configuration(&self.region));
        match request.send().await {
            Ok(_) => {
                log::info!("Created bucket '{}'", bucket);
                Ok(())
            }
            Err(err) => {
                let exists = err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if exists {
                    log::debug!("Bucket '{}' was created concurrently", bucket);
                    Ok(())
                } else {
                    Err(classify(err, bucket, "make_bucket"))
                }
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let length = bytes.len() as i64;
        self.client
            .put_object()
            .bucket(bucket)
            .key(object_key(key))
            .content_type(content_type)
            .content_length(length)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| classify(err, bucket, "put_object"))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(object_key(key))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(classify(err, bucket, "get_object")),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::unavailable("get_object", err))?;
        Ok(body.into_bytes())
    }

    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(object_key(key))
            .send()
            .await
        {
            Ok(output) => Ok(ObjectInfo {
                byte_length: output.content_length().unwrap_or_default().max(0) as u64,
                content_type: output.content_type().map(str::to_string),
            }),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(classify(err, bucket, "stat_object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_trims_leading_slash() {
        assert_eq!(object_key("/temp/flights.csv"), "temp/flights.csv");
        assert_eq!(object_key("temp/flights.csv"), "temp/flights.csv");
    }

    #[test]
    fn test_default_settings() {
        let settings = S3Settings::default();
        assert_eq!(settings.region, "us-east-1");
        assert!(settings.endpoint.is_none());
    }

    #[tokio::test]
    async fn test_connect_with_custom_endpoint() {
        let settings = S3Settings {
            endpoint: Some(Url::parse("http://localhost:9000").unwrap()),
            access_key_id: Some("minio".to_string()),
            secret_access_key: Some("minio123".to_string()),
            ..Default::default()
        };
        let store = S3Store::connect(&settings).await;
        assert_eq!(
            store.client.config().region().map(|r| r.as_ref()),
            Some("us-east-1")
        );
        assert_eq!(store.region, "us-east-1");
    }

    #[test]
    fn test_bucket_configuration_outside_us_east_1() {
        assert!(bucket_configuration("us-east-1").is_none());

        let config = bucket_configuration("eu-west-1").unwrap();
        assert_eq!(
            config.location_constraint(),
            Some(&BucketLocationConstraint::EuWest1)
        );
    }

    #[tokio::test]
    async fn test_connect_keeps_region_for_bucket_creation() {
        let settings = S3Settings {
            region: "eu-central-1".to_string(),
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..Default::default()
        };
        let store = S3Store::connect(&settings).await;
        let constraint = bucket_configuration(&store.region)
            .and_then(|c| c.location_constraint().cloned());
        assert_eq!(constraint, Some(BucketLocationConstraint::EuCentral1));
    }
}
