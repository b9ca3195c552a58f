//! Local file helpers for attaching and exporting media.

use std::path::Path;

use anyhow::Context;
use proto::MediaAttachment;

/// Guesses a MIME type from the file extension. Unknown extensions map to
/// `application/octet-stream`, which the upload stage rejects.
pub fn mime_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Reads a local file into an upload attachment.
pub async fn read_attachment(path: &Path) -> anyhow::Result<MediaAttachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    Ok(MediaAttachment::new(filename, data, mime_from_path(path)))
}
