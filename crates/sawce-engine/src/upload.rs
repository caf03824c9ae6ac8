use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Per-request temporary file holding an uploaded image.
///
/// The file is deleted exactly once: by `release()`, or on drop if nobody
/// released it first.
#[derive(Debug)]
pub struct SpooledUpload {
    file: Option<NamedTempFile>,
    writer: Option<tokio::fs::File>,
    path: PathBuf,
    len: u64,
}

impl SpooledUpload {
    /// Creates `dir` if needed and an empty spool inside it. The filesystem
    /// calls run on the blocking pool.
    pub async fn create_in(dir: &Path) -> io::Result<Self> {
        let dir = dir.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            tempfile::Builder::new()
                .prefix("upload-")
                .suffix(".img")
                .tempfile_in(&dir)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
        let writer = tokio::fs::File::from_std(file.as_file().try_clone()?);
        let path = file.path().to_path_buf();
        Ok(Self {
            file: Some(file),
            writer: Some(writer),
            path,
            len: 0,
        })
    }

    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "upload spool is no longer writable",
            ));
        };
        writer.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and closes the write handle. The file itself stays until release.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        if self.is_released() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "upload spool was already released",
            ));
        }
        tokio::fs::read(&self.path).await
    }

    pub fn release(&mut self) {
        self.writer = None;
        let Some(file) = self.file.take() else {
            return;
        };
        match file.close() {
            Ok(()) => debug!(path = %self.path.display(), "released upload spool"),
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "failed to delete upload spool"
            ),
        }
    }
}

impl Drop for SpooledUpload {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
enum ImageSource {
    Memory(Vec<u8>),
    Spooled(SpooledUpload),
}

/// The one image taking part in a request, with its declared media type.
#[derive(Debug)]
pub struct ImagePayload {
    source: ImageSource,
    media_type: Option<String>,
}

impl ImagePayload {
    pub fn from_bytes(bytes: Vec<u8>, media_type: Option<String>) -> Self {
        Self {
            source: ImageSource::Memory(bytes),
            media_type,
        }
    }

    pub fn spooled(upload: SpooledUpload, media_type: Option<String>) -> Self {
        Self {
            source: ImageSource::Spooled(upload),
            media_type,
        }
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    pub fn spool_path(&self) -> Option<&Path> {
        match &self.source {
            ImageSource::Spooled(upload) => Some(upload.path()),
            ImageSource::Memory(_) => None,
        }
    }

    pub async fn load(&self) -> io::Result<Vec<u8>> {
        match &self.source {
            ImageSource::Memory(bytes) => Ok(bytes.clone()),
            ImageSource::Spooled(upload) => upload.read().await,
        }
    }

    pub fn release(&mut self) {
        match &mut self.source {
            ImageSource::Spooled(upload) => upload.release(),
            ImageSource::Memory(bytes) => bytes.clear(),
        }
    }
}
