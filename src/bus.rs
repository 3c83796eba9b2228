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
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Client;
use sha2::Sha256;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::BusConfig;

type HmacSha256 = Hmac<Sha256>;

/// One queue endpoint. Receiving is destructive (receive-and-delete): a
/// message is acknowledged the moment it is handed to the caller, which is
/// the at-most-once contract the worker loop is built on.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `max_wait` for the
    /// first one.
    async fn receive_batch(&self, max_messages: usize, max_wait: Duration) -> Result<Vec<String>>;

    async fn send(&self, body: &str) -> Result<()>;

    /// Enqueue a message that becomes visible at `enqueue_at`.
    async fn schedule(&self, body: &str, enqueue_at: DateTime<Utc>) -> Result<()>;
}

/// Service-Bus queue client over the REST surface, authenticated with SAS
/// tokens signed per request.
pub struct ServiceBusQueue {
    client: Client,
    namespace: String,
    queue: String,
    sas_key_name: String,
    sas_key: String,
}

impl ServiceBusQueue {
    pub fn new(config: &BusConfig, queue: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            namespace: config.namespace.clone(),
            queue: queue.into(),
            sas_key_name: config.sas_key_name.clone(),
            sas_key: config.sas_key.clone(),
        }
    }

    fn queue_url(&self) -> String {
        format!("https://{}/{}", self.namespace, self.queue)
    }

    /// SAS token: base64(HMAC-SHA256(key, encoded_uri + "\n" + expiry)),
    /// valid for one hour.
    fn sas_token(&self) -> Result<String> {
        let uri = urlencoding::encode(&self.queue_url()).into_owned();
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_secs()
            + 3600;

        let string_to_sign = format!("{uri}\n{expiry}");
        let mut mac = HmacSha256::new_from_slice(self.sas_key.as_bytes())
            .context("invalid SAS key length")?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={uri}&sig={}&se={expiry}&skn={}",
            urlencoding::encode(&signature),
            self.sas_key_name
        ))
    }
}

#[async_trait]
impl MessageQueue for ServiceBusQueue {
    async fn receive_batch(&self, max_messages: usize, max_wait: Duration) -> Result<Vec<String>> {
        let mut messages = Vec::new();

        for index in 0..max_messages {
            // only the first receive waits for the queue; the rest of the
            // batch drains whatever is already there
            let timeout = if index == 0 { max_wait.as_secs() } else { 0 };
            let url = format!("{}/messages/head?timeout={}", self.queue_url(), timeout);

            let response = self
                .client
                .delete(&url)
                .header("Authorization", self.sas_token()?)
                .send()
                .await
                .with_context(|| format!("receive from queue {} failed", self.queue))?;

            match response.status().as_u16() {
                200 => {
                    let body = response.text().await.context("reading message body")?;
                    messages.push(body);
                }
                204 => break, // queue drained
                status => {
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("receive from queue {} returned {status}: {body}", self.queue);
                }
            }
        }

        Ok(messages)
    }

    async fn send(&self, body: &str) -> Result<()> {
        let url = format!("{}/messages", self.queue_url());
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.sas_token()?)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("send to queue {} failed", self.queue))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("send to queue {} returned {status}: {text}", self.queue);
        }
        Ok(())
    }

    async fn schedule(&self, body: &str, enqueue_at: DateTime<Utc>) -> Result<()> {
        let url = format!("{}/messages", self.queue_url());
        let broker_properties = serde_json::json!({
            "ScheduledEnqueueTimeUtc": enqueue_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.sas_token()?)
            .header("Content-Type", "application/json")
            .header("BrokerProperties", broker_properties.to_string())
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("schedule on queue {} failed", self.queue))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("schedule on queue {} returned {status}: {text}", self.queue);
        }
        Ok(())
    }
}

/// In-memory queue used by tests and local runs without a bus deployment.
#[derive(Default)]
pub struct InMemoryQueue {
    messages: Mutex<VecDeque<(String, Option<DateTime<Utc>>)>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all queued bodies, due or not.
    pub fn drain_all(&self) -> Vec<String> {
        self.messages
            .lock()
            .drain(..)
            .map(|(body, _)| body)
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive_batch(&self, max_messages: usize, _max_wait: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut queue = self.messages.lock();
        let mut received = Vec::new();
        let mut remaining = VecDeque::new();

        while let Some((body, due)) = queue.pop_front() {
            let is_due = due.map(|at| at <= now).unwrap_or(true);
            if is_due && received.len() < max_messages {
                received.push(body);
            } else {
                remaining.push_back((body, due));
            }
        }

        *queue = remaining;
        Ok(received)
    }

    async fn send(&self, body: &str) -> Result<()> {
        self.messages.lock().push_back((body.to_string(), None));
        Ok(())
    }

    async fn schedule(&self, body: &str, enqueue_at: DateTime<Utc>) -> Result<()> {
        self.messages
            .lock()
            .push_back((body.to_string(), Some(enqueue_at)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_queue_respects_batch_size_and_order() {
        let queue = InMemoryQueue::new();
        for i in 0..5 {
            queue.send(&format!("msg-{i}")).await.unwrap();
        }

        let batch = queue.receive_batch(3, Duration::from_secs(3)).await.unwrap();
        assert_eq!(batch, ["msg-0", "msg-1", "msg-2"]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn scheduled_messages_stay_hidden_until_due() {
        let queue = InMemoryQueue::new();
        queue
            .schedule("later", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        queue
            .schedule("now", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let batch = queue.receive_batch(10, Duration::from_secs(3)).await.unwrap();
        assert_eq!(batch, ["now"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn sas_token_is_well_formed() {
        let config = BusConfig {
            namespace: "example.servicebus.windows.net".to_string(),
            in_queue: "in".to_string(),
            out_queue: "out".to_string(),
            command_queue: "commands".to_string(),
            sas_key_name: "RootManageSharedAccessKey".to_string(),
            sas_key: "secret-key-material".to_string(),
        };
        let queue = ServiceBusQueue::new(&config, "in");
        let token = queue.sas_token().unwrap();

        assert!(token.starts_with("SharedAccessSignature sr="));
        assert!(token.contains("&sig="));
        assert!(token.contains("&se="));
        assert!(token.ends_with("&skn=RootManageSharedAccessKey"));
    }
}
