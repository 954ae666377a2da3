use s3::creds::Credentials;
use s3::{Bucket, Region};

const INPUT_PREFIX: &str = "input";
const OUTPUT_PREFIX: &str = "output";

/// S3-compatible object store holding username lists and run reports.
pub struct ObjectStore {
    bucket: Box<Bucket>,
}

impl ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }

    pub async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_code(key, response.status_code())
    }

    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_code(key, response.status_code())?;
        Ok(response.to_vec())
    }

    /// Fetch `input/<name>` and write it to `dest`.
    pub async fn download_input(&self, name: &str, dest: &std::path::Path) -> Result<(), StorageError> {
        let bytes = self.download(&input_key(name)).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes).await?;
        tracing::info!(key = %input_key(name), path = %dest.display(), "Downloaded input list");
        Ok(())
    }

    /// Upload a finished report to `output/<run_id>.jsonl`, returning the key.
    pub async fn upload_report(&self, run_id: &str, src: &std::path::Path) -> Result<String, StorageError> {
        let key = report_key(run_id);
        let bytes = tokio::fs::read(src).await?;
        self.upload(&key, &bytes, "application/x-ndjson").await?;
        tracing::info!(key = %key, bytes = bytes.len(), "Uploaded run report");
        Ok(key)
    }
}

fn input_key(name: &str) -> String {
    format!("{INPUT_PREFIX}/{}", name.trim_start_matches('/'))
}

fn report_key(run_id: &str) -> String {
    format!("{OUTPUT_PREFIX}/{run_id}.jsonl")
}

fn check_code(key: &str, code: u16) -> Result<(), StorageError> {
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(StorageError::Status {
            key: key.to_string(),
            code,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned status {code} for '{key}'")]
    Status { key: String, code: u16 },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
