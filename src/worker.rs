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

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageQueue;
use crate::error::WorkerError;
use crate::uploader::SideTask;

const RECEIVE_WAIT: Duration = Duration::from_secs(3);
const MAX_SLEEP_SECONDS: u64 = 10;
const MAX_UPLOAD_ATTEMPTS_PER_DAY: u32 = 20;

/// One worker family's message processor.
///
/// `handle` parses the raw payload and produces the result envelope;
/// `failure_envelope` builds the best-effort `message="failed"` body when
/// processing errors or times out (`None` when not even an id can be
/// recovered, in which case the message is dropped).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn family(&self) -> &str;

    async fn handle(&self, raw_message: &str) -> Result<serde_json::Value, WorkerError>;

    fn failure_envelope(&self, raw_message: &str, error: &WorkerError)
        -> Option<serde_json::Value>;
}

/// Counters exposed for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServiceStats {
    pub total_received: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_timeouts: u64,
}

/// The long-running loop of one worker family.
///
/// Messages are acknowledged by the act of receiving them (receive-and-
/// delete): a crash between receive and publish loses the result, which is
/// the accepted trade-off against redelivering poison messages forever.
pub struct Service {
    in_queue: Arc<dyn MessageQueue>,
    out_queue: Arc<dyn MessageQueue>,
    command_queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    side_task: Arc<dyn SideTask>,
    batch_size: usize,
    handler_timeout: Duration,
    target_upload_time: NaiveTime,

    sleep_seconds: u64,
    stats: ServiceStats,
    marker_sent_date: Option<NaiveDate>,
    last_upload_date: Option<NaiveDate>,
    upload_pending: bool,
    upload_attempts_today: u32,
    attempts_date: Option<NaiveDate>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_queue: Arc<dyn MessageQueue>,
        out_queue: Arc<dyn MessageQueue>,
        command_queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
        side_task: Arc<dyn SideTask>,
        batch_size: usize,
        handler_timeout: Duration,
        target_upload_time: NaiveTime,
    ) -> Self {
        Self {
            in_queue,
            out_queue,
            command_queue,
            handler,
            side_task,
            batch_size,
            handler_timeout,
            target_upload_time,
            sleep_seconds: 4,
            stats: ServiceStats::default(),
            marker_sent_date: None,
            last_upload_date: None,
            upload_pending: false,
            upload_attempts_today: 0,
            attempts_date: None,
        }
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats
    }

    pub fn sleep_seconds(&self) -> u64 {
        self.sleep_seconds
    }

    pub async fn run(mut self) {
        tracing::info!(family = self.handler.family(), "Worker loop starting");
        loop {
            self.run_iteration().await;
            tokio::time::sleep(Duration::from_secs(self.sleep_seconds)).await;
        }
    }

    /// One batch: receive, process, adapt the sleep interval, service the
    /// daily side task. Returns the number of messages processed.
    pub async fn run_iteration(&mut self) -> usize {
        let processed = self.process_batch().await;

        if processed > 0 {
            self.sleep_seconds = 1;
        } else if self.sleep_seconds < MAX_SLEEP_SECONDS {
            self.sleep_seconds += 1;
        }

        tracing::info!(
            family = self.handler.family(),
            processed,
            sleep_seconds = self.sleep_seconds,
            total = self.stats.total_received,
            "Batch completed"
        );

        self.send_scheduled_marker().await;
        self.receive_scheduled_marker().await;

        processed
    }

    async fn process_batch(&mut self) -> usize {
        let messages = match self
            .in_queue
            .receive_batch(self.batch_size, RECEIVE_WAIT)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(family = self.handler.family(), error = %e, "Receive failed");
                return 0;
            }
        };

        if messages.is_empty() {
            tracing::debug!(family = self.handler.family(), "No messages to process");
            return 0;
        }

        let mut processed = 0;
        for raw_message in messages {
            // receive already removed the message from the queue; from here
            // on every outcome must end in a published envelope or a logged
            // drop, never a redelivery
            self.stats.total_received += 1;
            self.process_message(&raw_message).await;
            processed += 1;
        }
        processed
    }

    async fn process_message(&mut self, raw_message: &str) {
        let started = std::time::Instant::now();

        let outcome = tokio::time::timeout(self.handler_timeout, self.handler.handle(raw_message))
            .await;

        let envelope = match outcome {
            Ok(Ok(envelope)) => {
                tracing::info!(
                    family = self.handler.family(),
                    elapsed = ?started.elapsed(),
                    "Message processed"
                );
                Some(envelope)
            }
            Ok(Err(err)) => {
                tracing::warn!(family = self.handler.family(), error = %err, "Handler failed");
                self.stats.total_failed += 1;
                self.handler.failure_envelope(raw_message, &err)
            }
            Err(_) => {
                let err = WorkerError::Timeout(self.handler_timeout.as_secs());
                tracing::warn!(family = self.handler.family(), error = %err, "Handler timed out");
                self.stats.total_timeouts += 1;
                self.handler.failure_envelope(raw_message, &err)
            }
        };

        let Some(envelope) = envelope else {
            tracing::warn!(
                family = self.handler.family(),
                "No recoverable envelope, dropping message"
            );
            return;
        };

        match self.out_queue.send(&envelope.to_string()).await {
            Ok(()) => {
                self.stats.total_sent += 1;
            }
            Err(e) => {
                tracing::warn!(family = self.handler.family(), error = %e, "Publish failed");
            }
        }
    }

    /// Once per UTC day, before the target time, drop a marker on the
    /// command queue that becomes visible at the target time.
    async fn send_scheduled_marker(&mut self) {
        let now = Utc::now();
        let today = now.date_naive();
        let target = today.and_time(self.target_upload_time).and_utc();

        if self.marker_sent_date == Some(today) || now >= target {
            return;
        }

        match self
            .command_queue
            .schedule("log-upload-marker", target)
            .await
        {
            Ok(()) => {
                tracing::info!(%target, "Scheduled daily log upload marker");
                self.marker_sent_date = Some(today);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error sending scheduled marker");
            }
        }
    }

    /// After the target time, pick up the marker and run the upload, capped
    /// at 20 attempts per day. Side-task failures never fail the loop.
    async fn receive_scheduled_marker(&mut self) {
        let now = Utc::now();
        let today = now.date_naive();
        let target = today.and_time(self.target_upload_time).and_utc();

        if self.attempts_date != Some(today) {
            self.attempts_date = Some(today);
            self.upload_attempts_today = 0;
            self.upload_pending = false;
        }

        if now < target || self.last_upload_date == Some(today) {
            return;
        }

        if !self.upload_pending {
            match self.command_queue.receive_batch(1, RECEIVE_WAIT).await {
                Ok(markers) if !markers.is_empty() => {
                    tracing::info!("Received log upload marker");
                    self.upload_pending = true;
                }
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Error receiving scheduled marker");
                    return;
                }
            }
        }

        if self.upload_attempts_today >= MAX_UPLOAD_ATTEMPTS_PER_DAY {
            tracing::warn!("Max upload attempts reached, giving up for today");
            self.last_upload_date = Some(today);
            self.upload_pending = false;
            return;
        }

        self.upload_attempts_today += 1;
        match self.side_task.run().await {
            Ok(()) => {
                tracing::info!("Daily log upload succeeded");
                self.last_upload_date = Some(today);
                self.upload_pending = false;
            }
            Err(e) => {
                tracing::warn!(
                    attempt = self.upload_attempts_today,
                    error = %e,
                    "Daily log upload failed"
                );
            }
        }
    }
}
