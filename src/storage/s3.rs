use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::Storage;
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Archives kept in an S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Storage {
    name: String,
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    /// Builds the client. Static keys win over the default credential chain.
    pub async fn connect(name: &str, spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()));
        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key), Some(secret)) = (
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
        ) {
            loader = loader.credentials_provider(Credentials::new(
                key, secret, None, // session_token
                None, // expiry
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.endpoint_url.is_some())
            .build();

        Self {
            name: name.to_string(),
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name.clone(),
            prefix: spaces_config.folder_prefix.clone(),
        }
    }

    fn key(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.starts_with('/') || name.split('/').any(|seg| seg == "..") {
            return Err(AppError::storage(
                &self.name,
                format!("invalid object name '{}'", name),
            ));
        }
        Ok(match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        })
    }

    fn err(&self, action: &str, key: &str, e: impl std::error::Error) -> AppError {
        AppError::storage(
            &self.name,
            format!(
                "failed to {} s3://{}/{}: {}",
                action,
                self.bucket,
                key,
                DisplayErrorContext(e)
            ),
        )
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, local_path: &Path, name: &str) -> Result<()> {
        let key = self.key(name)?;
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| self.err("read local file for", &key, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| self.err("upload", &key, e))?;

        debug!(storage = %self.name, bucket = %self.bucket, key = %key, "uploaded archive");
        Ok(())
    }

    async fn retrieve(&self, name: &str, local_path: &Path) -> Result<()> {
        let key = self.key(name)?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.err("download", &key, e))?;

        let mut output_file = File::create(local_path).await?;
        let mut total_bytes = 0;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| self.err("stream", &key, e))?
        {
            output_file.write_all(&chunk).await?;
            total_bytes += chunk.len();
        }
        output_file.flush().await?;

        debug!(storage = %self.name, key = %key, total_bytes, "downloaded archive");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        // DeleteObject succeeds for keys that do not exist.
        let key = self.key(name)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| self.err("delete", &key, e))?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let key = self.key(name)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(self.err("inspect", &key, e)),
        }
    }

    async fn sweep_older_than(&self, days: u64) -> Result<usize> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AppError::storage(&self.name, e))?
            .as_secs() as i64;
        let threshold_days = i64::try_from(days).unwrap_or(i64::MAX);

        let mut request = self.client.list_objects_v2().bucket(&self.bucket);
        if let Some(prefix) = &self.prefix {
            request = request.prefix(format!("{}/", prefix));
        }
        let mut pages = request.into_paginator().send();

        let mut removed = 0;
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| self.err("list", self.prefix.as_deref().unwrap_or(""), e))?;
            for object in page.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let age_days = (now - modified.secs()) / SECS_PER_DAY;
                if age_days <= threshold_days {
                    continue;
                }
                match self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    Ok(_) => removed += 1,
                    Err(e) => warn!(
                        storage = %self.name,
                        key,
                        error = %DisplayErrorContext(e),
                        "failed to remove expired object"
                    ),
                }
            }
        }

        info!(storage = %self.name, bucket = %self.bucket, days, removed, "s3 retention sweep finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaces(prefix: Option<&str>) -> SpacesConfig {
        SpacesConfig {
            endpoint_url: Some("http://127.0.0.1:9".to_string()),
            region: "us-east-1".to_string(),
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
            bucket_name: "db-backups".to_string(),
            folder_prefix: prefix.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_key_applies_prefix() -> anyhow::Result<()> {
        let storage = S3Storage::connect("spaces", &spaces(Some("prod"))).await;
        assert_eq!(storage.key("orders_db/a.tar.gz")?, "prod/orders_db/a.tar.gz");

        let bare = S3Storage::connect("spaces", &spaces(None)).await;
        assert_eq!(bare.key("orders_db/a.tar.gz")?, "orders_db/a.tar.gz");
        Ok(())
    }

    #[tokio::test]
    async fn test_key_rejects_escaping_names() {
        let storage = S3Storage::connect("spaces", &spaces(Some("prod"))).await;
        assert!(storage.key("../other/a.tar.gz").is_err());
        assert!(storage.key("/a.tar.gz").is_err());
        assert!(storage.key("").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_storage_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let source = dir.path().join("a.tar.gz");
        std::fs::write(&source, "x")?;
        let storage = S3Storage::connect("spaces", &spaces(None)).await;
        let err = storage.store(&source, "orders_db/a.tar.gz").await.unwrap_err();
        assert!(matches!(err, AppError::Storage { ref storage, .. } if storage == "spaces"));
        Ok(())
    }
}
