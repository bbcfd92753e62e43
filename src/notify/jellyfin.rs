//! Jellyfin library refresh notifications.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, error};

use crate::config::JellyfinConfig;
use crate::error::NotifyError;

/// Minimal client for the Jellyfin media-update endpoint.
pub struct JellyfinClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct UpdatePayload {
    #[serde(rename = "Updates")]
    updates: Vec<UpdateEntry>,
}

#[derive(Serialize)]
struct UpdateEntry {
    #[serde(rename = "Path")]
    path: String,
}

impl JellyfinClient {
    pub fn new(config: &JellyfinConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Tells Jellyfin that `path` changed on disk.
    pub async fn refresh_path(&self, path: &Path) -> Result<(), NotifyError> {
        let payload = UpdatePayload {
            updates: vec![UpdateEntry {
                path: path.to_string_lossy().to_string(),
            }],
        };
        let response = self
            .client
            .post(format!("{}/Library/Media/Updated", self.base_url))
            .header("X-Emby-Token", &self.token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::RefreshFailed {
                status: status.as_u16(),
            });
        }
        debug!(path = %path.display(), "Media server refresh sent");
        Ok(())
    }

    /// Best-effort refresh: failures are logged, never propagated.
    pub async fn refresh_best_effort(&self, path: &Path) {
        if let Err(e) = self.refresh_path(path).await {
            error!(path = %path.display(), error = %e, "Media server refresh failed");
        }
    }
}
