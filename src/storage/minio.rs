//! S3-compatible object store client (MinIO).
//!
//! Uses presigned SigV4 URLs for every operation so the same code path
//! serves both server-side transfers and the URLs handed to agents.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;

use super::{ObjectStore, Result, StorageError, MAX_OBJECT_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// MinIO / S3-compatible store using path-style addressing
#[derive(Clone)]
pub struct MinioObjectStore {
    client: reqwest::Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
    region: String,
    presign_ttl_secs: u64,
}

impl MinioObjectStore {
    /// Build from configuration
    pub fn new(config: &ObjectStoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
            presign_ttl_secs: config.presign_ttl_secs,
        }
    }

    /// Presign an arbitrary method against `bucket/key`
    fn presign(&self, method: &str, bucket: &str, key: &str, expires_secs: u64) -> Result<String> {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .ok_or_else(|| StorageError::InvalidConfig(format!("bad endpoint {}", self.endpoint)))?
            .to_string();

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let credential = format!("{}/{scope}", self.access_key);

        let encoded_key = encode_path(key);
        let canonical_uri = format!("/{bucket}/{encoded_key}");

        // Query parameters in canonical (sorted) order
        let query_pairs = [
            ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential", credential),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires_secs.to_string()),
            ("X-Amz-SignedHeaders", "host".to_string()),
        ];
        let canonical_query = query_pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD"
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = hex::encode(self.signing_key(&date_stamp, &string_to_sign));

        Ok(format!(
            "{}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}",
            self.endpoint
        ))
    }

    fn signing_key(&self, date_stamp: &str, string_to_sign: &str) -> Vec<u8> {
        let k_date = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date_stamp.as_bytes());
        let k_region = hmac(&k_date, self.region.as_bytes());
        let k_service = hmac(&k_region, b"s3");
        let k_signing = hmac(&k_service, b"aws4_request");
        hmac(&k_signing, string_to_sign.as_bytes())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Encode an object key per S3 URI rules: each path segment percent-encoded,
/// slashes preserved.
fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl ObjectStore for MinioObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(StorageError::TooLarge(data.len()));
        }
        let url = self.presign("PUT", bucket, key, 300)?;
        let resp = self
            .client
            .put(&url)
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "PUT {bucket}/{key} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.presign("GET", bucket, key, 300)?;
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "GET {bucket}/{key} returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let url = self.presign("DELETE", bucket, key, 300)?;
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::Unavailable(format!(
                "DELETE {bucket}/{key} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str) -> Result<String> {
        self.presign("GET", bucket, key, self.presign_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> MinioObjectStore {
        MinioObjectStore::new(&ObjectStoreConfig {
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key: "aegis".to_string(),
            secret_key: "aegis-secret".to_string(),
            region: "us-east-1".to_string(),
            presign_ttl_secs: 3600,
        })
    }

    #[test]
    fn test_presign_shape() {
        let url = test_store().presign("GET", "rule-bundles", "standard/42.yaml", 3600).unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/rule-bundles/standard/42.yaml?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn test_key_segments_encoded() {
        let encoded = encode_path("org 1/module/file name.pdf");
        assert_eq!(encoded, "org%201/module/file%20name.pdf");
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let cfg = ObjectStoreConfig {
            endpoint: "minio:9000".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            region: "us-east-1".to_string(),
            presign_ttl_secs: 60,
        };
        let store = MinioObjectStore::new(&cfg);
        assert!(store.presign("GET", "b", "k", 60).is_err());
    }
}
