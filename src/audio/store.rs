//! Durable recording storage

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// Where a recording ended up
#[derive(Debug, Clone)]
pub struct StoredAudio {
    pub locator: String,
    pub content_type: String,
}

/// Tenant-partitioned blob storage for recordings
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Store bytes under `<tenant>/recordings/<call_id>.<ext>`, replacing any previous copy
    async fn put(
        &self,
        tenant_id: &str,
        call_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredAudio>;

    /// Read a previously stored recording back
    async fn get(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed store returning `file://` locators
pub struct LocalAudioStore {
    root: PathBuf,
}

impl LocalAudioStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recording_path(&self, tenant_id: &str, call_id: &str, ext: &str) -> Result<PathBuf> {
        validate_segment(tenant_id)?;
        validate_segment(call_id)?;
        Ok(self
            .root
            .join(tenant_id)
            .join("recordings")
            .join(format!("{}.{}", call_id, ext)))
    }
}

#[async_trait]
impl AudioStore for LocalAudioStore {
    async fn put(
        &self,
        tenant_id: &str,
        call_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredAudio> {
        let ext = extension_for(content_type);
        let path = self.recording_path(tenant_id, call_id, ext)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{}.partial", ext));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let absolute = std::path::absolute(&path)?;
        let locator = Url::from_file_path(&absolute)
            .map_err(|_| Error::Other(format!("Cannot build locator for {}", absolute.display())))?;

        debug!(tenant_id, call_id, bytes = bytes.len(), path = %path.display(), "Stored recording");
        Ok(StoredAudio {
            locator: locator.to_string(),
            content_type: content_type.to_string(),
        })
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let url = Url::parse(locator)?;
        let path = url
            .to_file_path()
            .map_err(|_| Error::Other(format!("Not a file locator: {}", locator)))?;
        let root = std::path::absolute(&self.root)?;
        if !path.starts_with(&root) {
            return Err(Error::Other(format!("Locator outside audio store: {}", locator)));
        }
        Ok(tokio::fs::read(path).await?)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidPayload(format!(
            "Unsafe storage path segment: {:?}",
            segment
        )));
    }
    Ok(())
}

/// File extension for a recording content type
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" => "ogg",
        "audio/webm" => "webm",
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        other => mime_guess::get_mime_extensions_str(other)
            .and_then(|exts| exts.first().copied())
            .unwrap_or("bin"),
    }
}

/// Best-effort content type when the provider did not send one
pub fn guess_content_type(recording_url: &str) -> String {
    let path = Url::parse(recording_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| recording_url.to_string());
    mime_guess::from_path(path)
        .first()
        .filter(|m| m.type_().as_str() == "audio")
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "audio/mpeg".to_string())
}
