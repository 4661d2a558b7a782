use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use workit_types::models::{Attachment, AttachmentKind};

use crate::error::ApiError;

/// URL prefix under which stored attachments are served
pub const PUBLIC_PREFIX: &str = "/uploads/messages/";

/// 5 MB per attached file
pub const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

/// Files accepted per message
pub const MAX_FILES: usize = 5;

pub const ALLOWED_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

/// A file part received in a multipart message submission.
pub struct IncomingFile {
    pub original_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl IncomingFile {
    pub fn validate(&self) -> Result<(), ApiError> {
        if !ALLOWED_TYPES.contains(&self.content_type.as_str()) {
            return Err(ApiError::BadRequest(
                "Invalid file type. Only images, PDFs, DOC, DOCX, and TXT files are allowed.".into(),
            ));
        }
        if self.data.len() > MAX_FILE_SIZE {
            return Err(ApiError::PayloadTooLarge(format!(
                "File {} exceeds the 5MB limit",
                self.original_name
            )));
        }
        Ok(())
    }
}

/// Attachment files on disk, served back under `/uploads/messages/`.
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub async fn new(root: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(root.join("messages"))
            .await
            .with_context(|| format!("creating upload directory under {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the file as `messages/attachments-<uuid><ext>` and returns the
    /// attachment record pointing at its public URL.
    pub async fn save(&self, file: &IncomingFile) -> anyhow::Result<Attachment> {
        let ext = Path::new(&file.original_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let filename = format!("attachments-{}{}", Uuid::new_v4(), ext);

        let file_path = self.root.join("messages").join(&filename);
        let mut out = tokio::fs::File::create(&file_path)
            .await
            .with_context(|| format!("creating {}", file_path.display()))?;
        out.write_all(&file.data)
            .await
            .with_context(|| format!("writing {}", file_path.display()))?;
        out.flush().await?;

        debug!("Stored attachment {} ({} bytes)", filename, file.data.len());

        Ok(Attachment {
            kind: AttachmentKind::from_content_type(&file.content_type),
            url: format!("{}{}", PUBLIC_PREFIX, filename),
            name: Some(file.original_name.clone()),
            size: Some(file.data.len() as u64),
            content_type: Some(file.content_type.clone()),
        })
    }
}

impl UploadStore {
    /// Deletes files written by [`save`](Self::save) for a submission that
    /// was not stored. Links and foreign URLs are skipped; failures are
    /// logged.
    pub async fn discard(&self, attachments: &[Attachment]) {
        for att in attachments {
            let Some(filename) = att.url.strip_prefix(PUBLIC_PREFIX) else {
                continue;
            };
            if filename.is_empty()
                || filename.contains(['/', '\\'])
                || filename.starts_with('.')
            {
                continue;
            }
            let path = self.root.join("messages").join(filename);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Discarded attachment {}", filename),
                Err(e) => warn!("Failed to discard {}: {}", path.display(), e),
            }
        }
    }
}
