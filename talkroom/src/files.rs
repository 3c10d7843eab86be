use std::path::Path;

use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use crate::backend::{Backend, Credential};
use crate::error::{ChatError, Result};
use crate::session::Session;

pub const ROOM_ICONS_BUCKET: &str = "room-icons";
pub const AVATARS_BUCKET: &str = "avatars";

/// Image types accepted for icons and avatars.
pub const ALLOWED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// An image that passed validation and is ready to upload.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl ImageUpload {
    fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            _ => "webp",
        }
    }

    /// Random object name keeping the type's extension.
    pub fn object_name(&self) -> String {
        format!("{}.{}", Uuid::new_v4(), self.extension())
    }
}

/// Check size and type. The type is sniffed from the content and falls back
/// to the file extension.
pub fn validate_image(file_name: &str, data: Bytes, max_bytes: u64) -> Result<ImageUpload> {
    if data.is_empty() {
        return Err(ChatError::validation("file is empty"));
    }
    if data.len() as u64 > max_bytes {
        return Err(ChatError::validation(format!(
            "file must be {}MB or smaller",
            max_bytes / (1024 * 1024)
        )));
    }
    let content_type = infer::get(&data)
        .map(|t| t.mime_type().to_string())
        .or_else(|| {
            mime_guess::from_path(file_name)
                .first()
                .map(|m| m.essence_str().to_string())
        })
        .unwrap_or_else(|| "application/octet-stream".into());
    if !ALLOWED_IMAGE_TYPES.contains(&content_type.as_str()) {
        return Err(ChatError::validation(format!(
            "unsupported file type {content_type}; use JPEG, PNG, GIF or WebP"
        )));
    }
    Ok(ImageUpload {
        file_name: file_name.to_string(),
        content_type,
        data,
    })
}

/// Read and validate an image from disk, refusing oversized files before reading them.
pub async fn read_image(path: &Path, max_bytes: u64) -> Result<ImageUpload> {
    let meta = fs::metadata(path).await?;
    if meta.len() > max_bytes {
        return Err(ChatError::validation(format!(
            "file must be {}MB or smaller",
            max_bytes / (1024 * 1024)
        )));
    }
    let data = Bytes::from(fs::read(path).await?);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".into());
    validate_image(&name, data, max_bytes)
}

/// Upload to a bucket and return the object's public URL.
pub async fn store_image(
    backend: &dyn Backend,
    session: &Session,
    bucket: &str,
    upload: ImageUpload,
) -> Result<String> {
    let name = upload.object_name();
    backend
        .upload(
            Credential::User(session),
            bucket,
            &name,
            upload.data,
            &upload.content_type,
        )
        .await?;
    tracing::info!(bucket, object = %name, "image uploaded");
    Ok(backend.public_url(bucket, &name))
}
