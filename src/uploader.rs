/*
 * Call Insights - Rust Edition
 * Copyright (c) 2025 Call Insights Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;

use crate::config::StorageConfig;

/// The daily side task run by the worker loop. Kept as a trait so tests can
/// observe invocations without a blob store.
#[async_trait]
pub trait SideTask: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// Uploads the rolling log files to blob storage, one PUT per file.
pub struct LogUploader {
    client: Client,
    account_url: String,
    container: String,
    access_token: String,
    log_dir: PathBuf,
}

impl LogUploader {
    pub fn new(storage: &StorageConfig, log_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            account_url: storage.account_url.clone(),
            container: storage.log_container.clone(),
            access_token: storage.access_token.clone(),
            log_dir,
        }
    }

    async fn upload_file(&self, path: &PathBuf, blob_name: &str) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading log file {}", path.display()))?;

        let url = format!(
            "{}/{}/{}",
            self.account_url.trim_end_matches('/'),
            self.container,
            blob_name
        );

        let response = self
            .client
            .put(&url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("x-ms-version", "2021-08-06")
            .body(data)
            .send()
            .await
            .with_context(|| format!("uploading log file {blob_name}"))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("log upload of {blob_name} returned {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl SideTask for LogUploader {
    async fn run(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.log_dir)
            .await
            .with_context(|| format!("reading log directory {}", self.log_dir.display()))?;

        let mut uploaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            self.upload_file(&path, name).await?;
            uploaded += 1;
        }

        tracing::info!(uploaded, "Log upload completed");
        Ok(())
    }
}
