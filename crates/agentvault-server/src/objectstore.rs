//! Object-store brokerage.
//!
//! Mints short-lived presigned PUT/GET URLs so agents talk to the object
//! store directly; the server itself only ever deletes objects. Two clients
//! are built at startup: an internal one for deletes and a presigning one
//! that may point at a different, publicly reachable endpoint (dev-mode NAT).

use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::Client;
use tracing::warn;

use agentvault_core::Backup;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("presign {key}: {message}")]
    Presign { key: String, message: String },

    #[error("delete {key}: {message}")]
    Delete { key: String, message: String },

    #[error("broker configuration: {0}")]
    Config(String),
}

pub struct ObjectStoreBroker {
    client: Client,
    presigner: Client,
    bucket: String,
    expiry: Duration,
}

impl ObjectStoreBroker {
    /// Build the internal and presigning clients from configuration.
    /// Credentials resolve once and are shared by both.
    pub async fn connect(config: &Config) -> Result<Self, ObjectStoreError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.object_region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.object_access_key, &config.object_secret_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "agentvault-config",
            ));
        }

        let shared = loader.load().await;

        let build_client = |endpoint: Option<&String>| {
            let mut builder = aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(config.object_force_path_style);
            if let Some(endpoint) = endpoint {
                builder = builder.endpoint_url(endpoint);
            }
            Client::from_conf(builder.build())
        };

        // Presigned URLs must be reachable from the agent's network, which in
        // dev setups differs from the address the server uses internally.
        let presign_endpoint = config
            .object_public_endpoint
            .as_ref()
            .or(config.object_endpoint.as_ref());

        Ok(Self {
            client: build_client(config.object_endpoint.as_ref()),
            presigner: build_client(presign_endpoint),
            bucket: config.object_bucket.clone(),
            expiry: config.presign_expiry(),
        })
    }

    fn presigning_config(&self) -> Result<PresigningConfig, ObjectStoreError> {
        PresigningConfig::expires_in(self.expiry).map_err(|e| ObjectStoreError::Config(e.to_string()))
    }

    /// Presign a PUT for `key`. When `content_length` is given it is signed
    /// into the request, so the store rejects a body of any other size; this
    /// is the sole enforcement of a backup's declared ciphertext length.
    pub async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        content_length: Option<i64>,
    ) -> Result<String, ObjectStoreError> {
        let presigned = self
            .presign_put_request(key, content_type, content_length)
            .await?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_put_request(
        &self,
        key: &str,
        content_type: &str,
        content_length: Option<i64>,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        let mut request = self
            .presigner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);

        if let Some(length) = content_length {
            request = request.content_length(length);
        }

        request
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Presign a GET for `key`; length-unbound.
    pub async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError> {
        let presigned = self
            .presigner
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presigning_config()?)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(presigned.uri().to_string())
    }

    /// Authoritative server-side delete of a single object.
    pub async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Best-effort delete of both of a backup's objects. Metadata is the
    /// source of truth for visibility, so failures are logged and swallowed.
    pub async fn delete_backup_objects(&self, backup: &Backup) {
        if let Err(error) = self.delete(&backup.blob_key).await {
            warn!(key = %backup.blob_key, %error, "failed to delete backup object");
        }
        if let Err(error) = self.delete(&backup.manifest_key).await {
            warn!(key = %backup.manifest_key, %error, "failed to delete manifest object");
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::parse_from([
            "agentvault-server",
            "--object-endpoint",
            "http://127.0.0.1:9000",
            "--object-public-endpoint",
            "http://localhost:19000",
            "--object-bucket",
            "test-backups",
            "--object-access-key",
            "test-access",
            "--object-secret-key",
            "test-secret",
            "--object-force-path-style",
            "true",
        ])
    }

    async fn test_broker() -> ObjectStoreBroker {
        ObjectStoreBroker::connect(&test_config()).await.unwrap()
    }

    #[tokio::test]
    async fn presigned_put_binds_content_length() {
        let broker = test_broker().await;
        let url = broker
            .presign_put("ag_x/t1/backup.ciphertext", "application/octet-stream", Some(4096))
            .await
            .unwrap();

        assert!(url.contains("ag_x/t1/backup.ciphertext"));
        assert!(url.contains("X-Amz-Signature="));
        // Content-Length participates in the signature, so a mismatched body
        // is rejected by the store.
        assert!(url.to_ascii_lowercase().contains("content-length"));
    }

    #[tokio::test]
    async fn presigned_put_without_length_is_unbound() {
        let broker = test_broker().await;
        let url = broker
            .presign_put("ag_x/t1/manifest.meta", "application/octet-stream", None)
            .await
            .unwrap();

        assert!(url.contains("X-Amz-Signature="));
        assert!(!url.to_ascii_lowercase().contains("content-length"));
    }

    #[tokio::test]
    async fn presigned_put_signs_manifest_content_type() {
        let broker = test_broker().await;
        let request = broker
            .presign_put_request("ag_x/t1/manifest.meta", "application/json", None)
            .await
            .unwrap();

        // The content type participates in the signature and must accompany
        // the upload.
        let headers: Vec<(&str, &str)> = request.headers().collect();
        assert!(headers.contains(&("content-type", "application/json")));
        assert!(request.uri().contains("ag_x/t1/manifest.meta"));
    }

    #[tokio::test]
    async fn presigned_urls_use_public_endpoint() {
        let broker = test_broker().await;
        let url = broker.presign_get("ag_x/t1/backup.ciphertext").await.unwrap();

        assert!(url.starts_with("http://localhost:19000/"));
        assert!(url.contains("test-backups"));
    }
}
