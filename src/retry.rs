//! Exponential backoff for flaky remote calls.

use std::{fmt, time::Duration};

use aws_sdk_textract::operation::{
    get_document_analysis::GetDocumentAnalysisError,
    start_document_analysis::StartDocumentAnalysisError,
};
use aws_smithy_runtime_api::{
    client::orchestrator::HttpResponse, client::result::SdkError,
    http::StatusCode as AwsStatusCode,
};
use rand::Rng as _;
use reqwest::StatusCode;
use tokio::time;

use crate::prelude::*;

/// Hard ceiling on any single backoff delay, before jitter.
const MAX_BACKOFF: Duration = Duration::from_millis(8000);

/// Upper bound on the uniform jitter added to each delay.
const MAX_JITTER_MS: u64 = 200;

/// Options for [`with_retries`].
#[derive(Debug, Clone)]
pub struct RetryOpts {
    /// How many times to retry after the first attempt.
    pub retries: u32,

    /// Delay before the first retry. Doubles on each subsequent retry, up to
    /// [`MAX_BACKOFF`].
    pub base_delay: Duration,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// The delay before retry `attempt` (0-indexed), without jitter.
pub fn backoff_delay(attempt: u32, base_delay: Duration) -> Duration {
    base_delay
        .saturating_mul(1u32.wrapping_shl(attempt.min(31)))
        .min(MAX_BACKOFF)
}

/// Run `operation` up to `opts.retries + 1` times, sleeping between attempts.
///
/// Only errors classified as transient by [`IsKnownTransient`] are retried.
/// Fatal errors and retry exhaustion re-raise the original error unmodified,
/// so the caller sees exactly what the remote service said.
pub async fn with_retries<T, E, F, Fut>(opts: &RetryOpts, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsKnownTransient + fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < opts.retries && err.is_known_transient() => {
                let jitter =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
                let delay = backoff_delay(attempt, opts.base_delay) + jitter;
                warn!(%err, attempt, ?delay, "transient failure, backing off");
                time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they've been observed
/// in the wild, investigated and determined to be transient. This prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl<E> IsKnownTransient for SdkError<E, HttpResponse>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(dispatch) => {
                dispatch.is_io() || dispatch.is_timeout()
            }
            SdkError::ResponseError(response) => {
                response.raw().status().is_known_transient()
            }
            SdkError::ServiceError(service_err) => service_err.err().is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for StartDocumentAnalysisError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            StartDocumentAnalysisError::InternalServerError(_)
                | StartDocumentAnalysisError::ProvisionedThroughputExceededException(_)
                | StartDocumentAnalysisError::ThrottlingException(_)
                | StartDocumentAnalysisError::LimitExceededException(_)
        )
    }
}

impl IsKnownTransient for GetDocumentAnalysisError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            GetDocumentAnalysisError::InternalServerError(_)
                | GetDocumentAnalysisError::ProvisionedThroughputExceededException(_)
                | GetDocumentAnalysisError::ThrottlingException(_)
        )
    }
}

// S3 service-level errors (NoSuchKey, NoSuchBucket, ...) will not resolve by
// retrying. Transient S3 failures show up as dispatch or response errors and
// are handled by the generic `SdkError` impl above.
impl IsKnownTransient for aws_sdk_s3::operation::put_object::PutObjectError {
    fn is_known_transient(&self) -> bool {
        false
    }
}

impl IsKnownTransient for aws_sdk_s3::operation::get_object::GetObjectError {
    fn is_known_transient(&self) -> bool {
        false
    }
}

impl IsKnownTransient for aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error {
    fn is_known_transient(&self) -> bool {
        false
    }
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for AwsStatusCode {
    fn is_known_transient(&self) -> bool {
        // Convert this to a regular `StatusCode`, and use the standard implementation.
        match StatusCode::from_u16(self.as_u16()) {
            Ok(status) => status.is_known_transient(),
            Err(_) => false, // If we can't convert, assume it's not transient.
        }
    }
}
