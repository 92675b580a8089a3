use crate::config::S3Config;
use crate::object_store::{join_public_url, ObjectStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument, warn};

/// Smallest part S3 accepts for every part but the last
const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

fn effective_part_size(configured: usize) -> usize {
    configured.max(MIN_PART_SIZE_BYTES)
}

/// Maps object keys to the references handed out by the store and back
#[derive(Debug, Clone)]
struct ReferenceMapper {
    bucket: String,
    public_base_url: Option<String>,
}

impl ReferenceMapper {
    fn reference_for_key(&self, key: &str) -> String {
        match self.public_base_url {
            Some(ref base) => join_public_url(base, key),
            None => format!("s3://{}/{}", self.bucket, key),
        }
    }

    fn key_for_reference<'a>(&self, reference: &'a str) -> Result<&'a str> {
        let prefix = match self.public_base_url {
            Some(ref base) => format!("{}/", base.trim_end_matches('/')),
            None => format!("s3://{}/", self.bucket),
        };
        reference
            .strip_prefix(prefix.as_str())
            .with_context(|| format!("Reference {reference} does not belong to bucket {}", self.bucket))
    }
}

/// S3-compatible object store for card photos and artifacts
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    references: ReferenceMapper,
    part_size_bytes: usize,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config, public_base_url: Option<String>) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/R2/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        let part_size_bytes = effective_part_size(config.part_size_bytes);
        if part_size_bytes != config.part_size_bytes {
            warn!(
                configured = config.part_size_bytes,
                part_size_bytes = part_size_bytes,
                "Multipart part size below the S3 minimum, raising it"
            );
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            references: ReferenceMapper {
                bucket: config.bucket.clone(),
                public_base_url,
            },
            part_size_bytes,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload object to S3")?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(key, &upload_id, &bytes).await {
            Ok(completed_parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;

                Ok(())
            }
            Err(e) => {
                // Leave no dangling parts behind
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, bytes: &[u8]) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in bytes.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let size_bytes = bytes.len();

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, bytes, content_type).await?;
        } else {
            self.simple_upload(key, bytes, content_type).await?;
        }

        debug!(key = %key, size_bytes = size_bytes, "Object uploaded to S3");

        Ok(self.references.reference_for_key(key))
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let key = self.references.key_for_reference(reference)?;

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to fetch object from S3")?;

        let body = response
            .body
            .collect()
            .await
            .context("Failed to read S3 object body")?;

        Ok(body.into_bytes().to_vec())
    }

    #[instrument(skip(self))]
    async fn delete(&self, reference: &str) -> Result<()> {
        let key = self.references.key_for_reference(reference)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object from S3")?;

        debug!(key = %key, "Object deleted from S3");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(public_base_url: Option<&str>) -> ReferenceMapper {
        ReferenceMapper {
            bucket: "keepsake-cards".to_string(),
            public_base_url: public_base_url.map(str::to_string),
        }
    }

    #[test]
    fn test_references_without_public_base_use_s3_scheme() {
        let mapper = mapper(None);
        let reference = mapper.reference_for_key("cards/abc/index.html");
        assert_eq!(reference, "s3://keepsake-cards/cards/abc/index.html");
        assert_eq!(mapper.key_for_reference(&reference).unwrap(), "cards/abc/index.html");
    }

    #[test]
    fn test_references_with_public_base() {
        let mapper = mapper(Some("https://cdn.example.com/"));
        let reference = mapper.reference_for_key("cards/abc/photos/1/display.jpg");
        assert!(reference.starts_with("https://cdn.example.com/"));
        assert!(!reference.contains(".com//"));
        assert_eq!(
            mapper.key_for_reference(&reference).unwrap(),
            "cards/abc/photos/1/display.jpg"
        );
    }

    #[test]
    fn test_foreign_reference_is_rejected() {
        assert!(mapper(None)
            .key_for_reference("s3://other-bucket/cards/abc/index.html")
            .is_err());
        assert!(mapper(Some("https://cdn.example.com"))
            .key_for_reference("https://elsewhere.example.com/cards/abc/index.html")
            .is_err());
    }

    #[test]
    fn test_part_size_is_raised_to_s3_minimum() {
        assert_eq!(effective_part_size(0), MIN_PART_SIZE_BYTES);
        assert_eq!(effective_part_size(1024), MIN_PART_SIZE_BYTES);
        assert_eq!(effective_part_size(16 * 1024 * 1024), 16 * 1024 * 1024);
    }
}
