//! AWS-related code shared by different modules.

use std::env;

use aws_config::BehaviorVersion;

use crate::prelude::*;

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config() -> Result<aws_config::SdkConfig> {
    Ok(aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await)
}

/// Build an S3 client, honoring `COI_STORAGE_ENDPOINT` for S3-compatible
/// stores like DigitalOcean Spaces or minio.
pub async fn s3_client() -> Result<aws_sdk_s3::Client> {
    let config = load_aws_config().await?;
    let mut builder = aws_sdk_s3::config::Builder::from(&config);
    if let Ok(endpoint) = env::var("COI_STORAGE_ENDPOINT") {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Ok(aws_sdk_s3::Client::from_conf(builder.build()))
}
