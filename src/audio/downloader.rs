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
use futures::StreamExt;
use reqwest::Client;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;

/// Fetches the input blob into a per-run scratch directory. The directory is
/// removed when the downloader is dropped, success or failure.
pub struct AudioDownloader {
    client: Client,
    account_url: String,
    container: String,
    access_token: String,
    scratch: TempDir,
}

impl AudioDownloader {
    pub fn new(storage: &StorageConfig) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("whisper_audio_")
            .tempdir()
            .context("Failed to create download scratch directory")?;
        tracing::debug!(dir = %scratch.path().display(), "Created download scratch directory");

        Ok(Self {
            client: Client::new(),
            account_url: storage.account_url.clone(),
            container: storage.audio_container.clone(),
            access_token: storage.access_token.clone(),
            scratch,
        })
    }

    /// Stream the blob to disk and return the local path.
    pub async fn download(&self, filename: &str) -> Result<PathBuf> {
        let url = format!(
            "{}/{}/{}",
            self.account_url.trim_end_matches('/'),
            self.container,
            filename
        );
        tracing::info!(filename, "Downloading audio file");

        let mut request = self.client.get(&url);
        if !self.access_token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.access_token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Download request for {filename} failed"))?;

        if !response.status().is_success() {
            anyhow::bail!("download of {filename} returned {}", response.status());
        }

        let local_path = self.scratch.path().join(sanitize_filename(filename));
        let mut file = tokio::fs::File::create(&local_path)
            .await
            .with_context(|| format!("Failed to create {}", local_path.display()))?;

        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Download stream interrupted")?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await.context("Write to scratch file failed")?;
        }
        file.flush().await?;

        tracing::info!(filename, bytes = total, path = %local_path.display(), "Download complete");
        Ok(local_path)
    }
}

/// Blob names can carry path separators; the local copy must stay inside the
/// scratch directory.
fn sanitize_filename(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("audio.bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(url: &str) -> StorageConfig {
        StorageConfig {
            account_url: url.to_string(),
            audio_container: "audio-files".to_string(),
            log_container: "service-logs".to_string(),
            access_token: String::new(),
        }
    }

    #[test]
    fn filenames_are_stripped_to_their_basename() {
        assert_eq!(sanitize_filename("calls/2024/rec.wav"), "rec.wav");
        assert_eq!(sanitize_filename("rec.wav"), "rec.wav");
        assert_eq!(sanitize_filename("..\\evil.wav"), "evil.wav");
    }

    #[tokio::test]
    async fn downloads_blob_to_scratch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/audio-files/rec.wav")
            .with_status(200)
            .with_body(vec![1u8, 2, 3, 4])
            .create_async()
            .await;

        let downloader = AudioDownloader::new(&storage(&server.url())).unwrap();
        let path = downloader.download("rec.wav").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn missing_blob_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/audio-files/missing.wav")
            .with_status(404)
            .create_async()
            .await;

        let downloader = AudioDownloader::new(&storage(&server.url())).unwrap();
        assert!(downloader.download("missing.wav").await.is_err());
    }

    #[tokio::test]
    async fn scratch_directory_is_removed_on_drop() {
        let server = mockito::Server::new_async().await;
        let downloader = AudioDownloader::new(&storage(&server.url())).unwrap();
        let dir = downloader.scratch.path().to_path_buf();
        assert!(dir.exists());
        drop(downloader);
        assert!(!dir.exists());
    }
}
