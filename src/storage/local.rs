// src/storage/local.rs — Filesystem object storage served under a public base URL

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::ObjectStorage;
use crate::infra::errors::GenTaskError;

pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
    durable_hosts: Vec<String>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            durable_hosts: Vec::new(),
        }
    }

    /// Extra hosts whose URLs count as durable (a CDN in front of the bucket).
    pub fn with_durable_hosts(mut self, hosts: Vec<String>) -> Self {
        self.durable_hosts = hosts;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root. Rejects keys that escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, GenTaskError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(GenTaskError::Storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GenTaskError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, GenTaskError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GenTaskError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        // Write then rename so a reader never sees a partial object
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| GenTaskError::Storage(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| GenTaskError::Storage(format!("rename {}: {e}", path.display())))?;

        tracing::debug!(key, bytes = bytes.len(), "Stored object");
        Ok(format!("{}/{}", self.public_base_url, key))
    }

    fn is_durable(&self, url: &str) -> bool {
        if url.starts_with(&format!("{}/", self.public_base_url)) {
            return true;
        }
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) => self
                .durable_hosts
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host)),
            None => false,
        }
    }
}
