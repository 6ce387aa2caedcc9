use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use std::path::Path;

use crate::error::{ ClientError, Result };

/// A receipt file picked by the user, held in memory until it is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Encode(format!("no file name in '{}'", path.display())))?;
        let mime = mime_for(&file_name);
        Ok(Self { file_name, mime, bytes })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Base64 of the bytes, computed on the blocking pool.
    pub async fn encode(&self) -> Result<String> {
        let bytes = self.bytes.clone();
        tokio::task
            ::spawn_blocking(move || STANDARD.encode(bytes)).await
            .map_err(|e| ClientError::Encode(e.to_string()))
    }
}

/// MIME type by file extension, `application/octet-stream` when unknown.
pub fn mime_for(file_name: &str) -> String {
    mime_guess::from_path(file_name).first_or_octet_stream().essence_str().to_string()
}
