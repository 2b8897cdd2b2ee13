// src/storage/mod.rs — Durable object storage boundary

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::infra::errors::GenTaskError;

pub use local::LocalObjectStorage;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes under `key`; returns the durable public URL.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, GenTaskError>;

    /// Whether a URL already points at durable storage (no re-hosting needed).
    fn is_durable(&self, url: &str) -> bool;
}

/// Content-addressed key: `results/YYYY/MM/DD/<sha256>.<ext>`.
pub fn object_key(bytes: &[u8], content_type: &str, now: DateTime<Utc>) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!(
        "results/{}/{}.{}",
        now.format("%Y/%m/%d"),
        digest,
        extension_for(content_type)
    )
}

/// File extension for a MIME type (parameters ignored).
pub fn extension_for(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
}

/// Guess a MIME type from a URL path when the server did not send one.
pub fn content_type_from_url(url: &str) -> Option<&'static str> {
    content_type_for_path(url::Url::parse(url).ok()?.path())
}

/// MIME type for a file name or object key, by extension.
pub fn content_type_for_path(path: &str) -> Option<&'static str> {
    let path = path.to_ascii_lowercase();
    let ext = path.rsplit_once('.')?.1.to_string();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_is_content_addressed() {
        let now = DateTime::parse_from_rfc3339("2026-10-19T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = object_key(b"hello", "image/png", now);
        assert_eq!(
            a,
            "results/2026/10/19/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.png"
        );
        assert_eq!(a, object_key(b"hello", "image/png", now));
        assert_ne!(a, object_key(b"hello!", "image/png", now));
    }

    #[test]
    fn test_extensions() {
        assert_eq!(extension_for("text/plain; charset=utf-8"), "txt");
        assert_eq!(extension_for("VIDEO/MP4"), "mp4");
        assert_eq!(extension_for("application/octet-stream"), "bin");
        assert_eq!(content_type_from_url("https://x/a/b.JPG?sig=1"), Some("image/jpeg"));
        assert_eq!(content_type_from_url("https://x/a/b"), None);
        assert_eq!(content_type_for_path("results/2026/10/19/x.mp4"), Some("video/mp4"));
    }
}
