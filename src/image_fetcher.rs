use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Retrieves raw image bytes. No retry and no caching at this layer.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> SyncResult<Vec<u8>>;
}

pub struct HttpImageFetcher {
    agent: ureq::Agent,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_bytes(&self, url: &str) -> SyncResult<Vec<u8>> {
        if url.is_empty() {
            return Err(SyncError::DownloadFailed("empty image URL".to_string()));
        }

        let agent = self.agent.clone();
        let target = url.to_string();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ureq::Error> {
            let mut response = agent.get(target.as_str()).call()?;
            response.body_mut().read_to_vec()
        })
        .await
        .map_err(|e| SyncError::DownloadFailed(format!("download task aborted: {}", e)))?
        .map_err(|e| SyncError::DownloadFailed(format!("{}: {}", url, e)))?;

        if bytes.is_empty() {
            return Err(SyncError::DownloadFailed(format!("{}: empty body", url)));
        }

        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}
