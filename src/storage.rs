//! Object storage for uploaded PDFs and OCR result files.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

use crate::{
    prelude::*,
    retry::{RetryOpts, with_retries},
};

/// The storage capability the pipeline needs: put, get, and (for providers
/// that write result files) prefix listing. Any S3-compatible store works;
/// read-after-write within seconds is assumed.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store an object.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;

    /// Fetch an object's bytes.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// List object keys under a prefix, in lexicographic order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Production store backed by S3 (or an S3-compatible endpoint). Every
/// network call is wrapped in [`with_retries`].
pub struct S3Store {
    client: aws_sdk_s3::Client,
    retry: RetryOpts,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self {
            client,
            retry: RetryOpts::default(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(level = "debug", skip_all, fields(%bucket, %key))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        with_retries(&self.retry, || {
            let body = ByteStream::from(bytes.clone());
            async {
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type(content_type)
                    .body(body)
                    .send()
                    .await
            }
        })
        .await
        .with_context(|| format!("failed to store s3://{bucket}/{key}"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(%bucket, %key))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = with_retries(&self.retry, || async {
            self.client.get_object().bucket(bucket).key(key).send().await
        })
        .await
        .with_context(|| format!("failed to fetch s3://{bucket}/{key}"))?;
        let bytes = output
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of s3://{bucket}/{key}"))?;
        Ok(bytes.into_bytes().to_vec())
    }

    #[instrument(level = "debug", skip_all, fields(%bucket, %prefix))]
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = vec![];
        let mut continuation: Option<String> = None;
        loop {
            let continuation_arg = continuation.clone();
            let output = with_retries(&self.retry, || {
                let continuation = continuation_arg.clone();
                async {
                    self.client
                        .list_objects_v2()
                        .bucket(bucket)
                        .prefix(prefix)
                        .set_continuation_token(continuation)
                        .send()
                        .await
                }
            })
            .await
            .with_context(|| format!("failed to list s3://{bucket}/{prefix}"))?;
            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_owned)),
            );
            continuation = output.next_continuation_token().map(str::to_owned);
            if continuation.is_none() {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }
}
