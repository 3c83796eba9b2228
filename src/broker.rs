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

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Why a `lock` call was denied.
///
/// The two kinds are load-bearing for callers: `RateLimitExceeded` is
/// retryable once the window resets, `TokenLimitExceeded` can never succeed
/// because the estimate alone is larger than the whole per-minute budget.
/// The `Display` strings are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    RateLimitExceeded,
    TokenLimitExceeded,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            DenyReason::TokenLimitExceeded => write!(f, "token_limit_exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Allowed {
        request_id: String,
    },
    Denied {
        reason: DenyReason,
        reset_seconds: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrokerStatus {
    pub available_tokens: u64,
    pub used_tokens: u64,
    pub locked_tokens: u64,
    pub reset_time_seconds: u64,
}

/// An admission record held between `lock` and `commit`/`release`.
#[derive(Debug, Clone)]
struct Reservation {
    app_id: String,
    locked: u64,
    acquired_at: Instant,
}

struct BrokerState {
    window_start: Instant,
    used: u64,
    locked: u64,
    reservations: HashMap<String, Reservation>,
}

enum Authorization {
    Ok,
    WrongApp,
    Unknown,
}

fn authorize(state: &BrokerState, app_id: &str, request_id: &str) -> Authorization {
    match state.reservations.get(request_id) {
        Some(reservation) if reservation.app_id == app_id => Authorization::Ok,
        Some(_) => Authorization::WrongApp,
        None => Authorization::Unknown,
    }
}

/// Admission control for a shared per-minute token quota.
///
/// All operations serialize on one mutex and are O(1) amortized; the mutex
/// is never held across an await point. Reservations survive window resets
/// (their locked tokens count against the new window until committed or
/// released) and are reclaimed by [`sweep_expired`](Self::sweep_expired)
/// once they outlive the TTL.
pub struct TokenBudgetBroker {
    tokens_per_minute: u64,
    window: Duration,
    reservation_ttl: Duration,
    state: Mutex<BrokerState>,
}

impl TokenBudgetBroker {
    pub fn new(tokens_per_minute: u64) -> Self {
        Self::with_timing(
            tokens_per_minute,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    }

    /// Constructor with explicit window and reservation TTL; tests compress
    /// time through this.
    pub fn with_timing(tokens_per_minute: u64, window: Duration, reservation_ttl: Duration) -> Self {
        Self {
            tokens_per_minute,
            window,
            reservation_ttl,
            state: Mutex::new(BrokerState {
                window_start: Instant::now(),
                used: 0,
                locked: 0,
                reservations: HashMap::new(),
            }),
        }
    }

    pub fn tokens_per_minute(&self) -> u64 {
        self.tokens_per_minute
    }

    /// Try to reserve `estimated_tokens` for `app_id` within the current
    /// window.
    pub fn lock(&self, app_id: &str, estimated_tokens: u64) -> LockOutcome {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        let reset_seconds = self.reset_seconds(&state);

        if estimated_tokens > self.tokens_per_minute {
            tracing::warn!(
                app_id,
                estimated_tokens,
                limit = self.tokens_per_minute,
                "Denying request larger than the whole window budget"
            );
            return LockOutcome::Denied {
                reason: DenyReason::TokenLimitExceeded,
                reset_seconds,
            };
        }

        if state.used + state.locked + estimated_tokens > self.tokens_per_minute {
            tracing::info!(
                app_id,
                estimated_tokens,
                used = state.used,
                locked = state.locked,
                reset_seconds,
                "Rate limit would be exceeded, denying lock"
            );
            return LockOutcome::Denied {
                reason: DenyReason::RateLimitExceeded,
                reset_seconds,
            };
        }

        let request_id = Uuid::new_v4().to_string();
        state.locked += estimated_tokens;
        state.reservations.insert(
            request_id.clone(),
            Reservation {
                app_id: app_id.to_string(),
                locked: estimated_tokens,
                acquired_at: Instant::now(),
            },
        );

        tracing::debug!(app_id, estimated_tokens, %request_id, "Locked tokens");
        LockOutcome::Allowed { request_id }
    }

    /// Report actual usage for a LOCKED reservation. The estimate is
    /// unlocked and the actual prompt+completion count is charged to `used`.
    /// Returns false for unknown request ids or an `app_id` mismatch; a
    /// forgotten reservation never corrupts window accounting.
    pub fn commit(
        &self,
        app_id: &str,
        request_id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> bool {
        let mut state = self.state.lock();
        self.roll_window(&mut state);

        match authorize(&state, app_id, request_id) {
            Authorization::Ok => {
                if let Some(reservation) = state.reservations.remove(request_id) {
                    state.locked = state.locked.saturating_sub(reservation.locked);
                    state.used += prompt_tokens + completion_tokens;
                }
                tracing::debug!(
                    app_id,
                    %request_id,
                    prompt_tokens,
                    completion_tokens,
                    "Committed token usage"
                );
                true
            }
            Authorization::WrongApp => {
                tracing::warn!(app_id, %request_id, "Commit denied: app_id mismatch");
                false
            }
            Authorization::Unknown => {
                tracing::warn!(app_id, %request_id, "Commit denied: unknown request_id");
                false
            }
        }
    }

    /// Drop a LOCKED reservation without charging anything.
    pub fn release(&self, app_id: &str, request_id: &str) -> bool {
        let mut state = self.state.lock();
        self.roll_window(&mut state);

        match authorize(&state, app_id, request_id) {
            Authorization::Ok => {
                if let Some(reservation) = state.reservations.remove(request_id) {
                    state.locked = state.locked.saturating_sub(reservation.locked);
                }
                tracing::debug!(app_id, %request_id, "Released locked tokens");
                true
            }
            Authorization::WrongApp => {
                tracing::warn!(app_id, %request_id, "Release denied: app_id mismatch");
                false
            }
            Authorization::Unknown => {
                tracing::warn!(app_id, %request_id, "Release denied: unknown request_id");
                false
            }
        }
    }

    pub fn status(&self) -> BrokerStatus {
        let mut state = self.state.lock();
        self.roll_window(&mut state);
        BrokerStatus {
            available_tokens: self
                .tokens_per_minute
                .saturating_sub(state.used + state.locked),
            used_tokens: state.used,
            locked_tokens: state.locked,
            reset_time_seconds: self.reset_seconds(&state),
        }
    }

    /// Reclaim LOCKED reservations older than the TTL. Abandoned calls
    /// (handler timeouts, crashed tasks) land here. Returns how many were
    /// reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let ttl = self.reservation_ttl;
        let expired: Vec<String> = state
            .reservations
            .iter()
            .filter(|(_, r)| now.duration_since(r.acquired_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(reservation) = state.reservations.remove(id) {
                state.locked = state.locked.saturating_sub(reservation.locked);
                tracing::warn!(
                    request_id = %id,
                    app_id = %reservation.app_id,
                    locked = reservation.locked,
                    "Reclaimed orphaned reservation"
                );
            }
        }
        expired.len()
    }

    /// Spawn the background sweep for orphaned reservations.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reclaimed = broker.sweep_expired();
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "Reservation sweep reclaimed orphaned locks");
                }
            }
        })
    }

    /// On window expiry, reset `used` and recompute `locked` from the live
    /// reservations. Runs at every admission decision and status read.
    fn roll_window(&self, state: &mut BrokerState) {
        if state.window_start.elapsed() >= self.window {
            state.window_start = Instant::now();
            state.used = 0;
            state.locked = state.reservations.values().map(|r| r.locked).sum();
            tracing::debug!(locked = state.locked, "Token window reset");
        }
    }

    fn reset_seconds(&self, state: &BrokerState) -> u64 {
        self.window
            .as_secs()
            .saturating_sub(state.window_start.elapsed().as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn broker(limit: u64) -> TokenBudgetBroker {
        TokenBudgetBroker::new(limit)
    }

    fn lock_id(broker: &TokenBudgetBroker, app_id: &str, tokens: u64) -> String {
        match broker.lock(app_id, tokens) {
            LockOutcome::Allowed { request_id } => request_id,
            LockOutcome::Denied { reason, .. } => panic!("lock denied: {reason}"),
        }
    }

    #[test]
    fn lock_succeeds_when_budget_available() {
        let broker = broker(100_000);
        let outcome = broker.lock("test_app", 5_000);
        assert!(matches!(outcome, LockOutcome::Allowed { .. }));

        let status = broker.status();
        assert_eq!(status.locked_tokens, 5_000);
        assert_eq!(status.used_tokens, 0);
    }

    #[test]
    fn lock_denied_when_budget_exhausted() {
        let broker = broker(100_000);
        lock_id(&broker, "test_app", 90_000);

        match broker.lock("test_app", 15_000) {
            LockOutcome::Denied { reason, .. } => {
                assert_eq!(reason, DenyReason::RateLimitExceeded);
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(broker.status().locked_tokens, 90_000);
    }

    #[test]
    fn oversized_estimate_is_a_token_limit_denial() {
        let broker = broker(100);
        match broker.lock("test_app", 101) {
            LockOutcome::Denied { reason, .. } => {
                assert_eq!(reason, DenyReason::TokenLimitExceeded);
                assert_eq!(reason.to_string(), "token_limit_exceeded");
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn commit_charges_actuals_not_the_estimate() {
        let broker = broker(100_000);
        let id = lock_id(&broker, "test_app", 5_000);

        assert!(broker.commit("test_app", &id, 2_000, 1_000));

        let status = broker.status();
        assert_eq!(status.locked_tokens, 0);
        assert_eq!(status.used_tokens, 3_000);
        // request id is single-use
        assert!(!broker.commit("test_app", &id, 1, 1));
    }

    #[test]
    fn commit_rejects_unknown_request_id() {
        let broker = broker(100_000);
        assert!(!broker.commit("test_app", "no-such-id", 2_000, 1_000));
        let status = broker.status();
        assert_eq!(status.locked_tokens, 0);
        assert_eq!(status.used_tokens, 0);
    }

    #[test]
    fn commit_rejects_app_id_mismatch() {
        let broker = broker(100_000);
        let id = lock_id(&broker, "test_app", 5_000);

        assert!(!broker.commit("different_app", &id, 2_000, 1_000));
        let status = broker.status();
        assert_eq!(status.locked_tokens, 5_000);
        assert_eq!(status.used_tokens, 0);
    }

    #[test]
    fn release_returns_tokens_without_charging() {
        let broker = broker(100_000);
        let id = lock_id(&broker, "test_app", 5_000);

        assert!(broker.release("test_app", &id));
        let status = broker.status();
        assert_eq!(status.locked_tokens, 0);
        assert_eq!(status.used_tokens, 0);
        assert!(!broker.release("test_app", &id));
    }

    #[test]
    fn release_rejects_app_id_mismatch() {
        let broker = broker(100_000);
        let id = lock_id(&broker, "test_app", 5_000);

        assert!(!broker.release("different_app", &id));
        assert_eq!(broker.status().locked_tokens, 5_000);
    }

    #[test]
    fn status_reflects_used_and_locked() {
        let broker = broker(100_000);
        let id = lock_id(&broker, "test_app", 5_000);
        broker.commit("test_app", &id, 2_000, 1_000);
        lock_id(&broker, "test_app", 10_000);

        let status = broker.status();
        assert_eq!(status.used_tokens, 3_000);
        assert_eq!(status.locked_tokens, 10_000);
        assert_eq!(status.available_tokens, 100_000 - 3_000 - 10_000);
    }

    #[test]
    fn window_reset_clears_used_but_keeps_live_reservations() {
        let broker = TokenBudgetBroker::with_timing(
            1_000,
            Duration::from_millis(40),
            Duration::from_secs(300),
        );
        let committed = lock_id(&broker, "app", 300);
        broker.commit("app", &committed, 200, 100);
        let _held = lock_id(&broker, "app", 400);

        thread::sleep(Duration::from_millis(60));

        let status = broker.status();
        assert_eq!(status.used_tokens, 0);
        // the outstanding reservation still counts against the new window
        assert_eq!(status.locked_tokens, 400);
    }

    #[test]
    fn denied_lock_succeeds_after_window_reset() {
        let broker = TokenBudgetBroker::with_timing(
            100,
            Duration::from_millis(40),
            Duration::from_secs(300),
        );
        let id = lock_id(&broker, "app", 60);
        broker.commit("app", &id, 40, 20);
        assert!(matches!(
            broker.lock("app", 60),
            LockOutcome::Denied {
                reason: DenyReason::RateLimitExceeded,
                ..
            }
        ));

        thread::sleep(Duration::from_millis(60));
        assert!(matches!(broker.lock("app", 60), LockOutcome::Allowed { .. }));
    }

    #[test]
    fn sweep_reclaims_orphaned_reservations() {
        let broker = TokenBudgetBroker::with_timing(
            1_000,
            Duration::from_secs(60),
            Duration::from_millis(30),
        );
        lock_id(&broker, "app", 500);
        assert_eq!(broker.status().locked_tokens, 500);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(broker.sweep_expired(), 1);
        assert_eq!(broker.status().locked_tokens, 0);
    }

    #[test]
    fn concurrent_locks_never_oversubscribe_the_window() {
        let broker = Arc::new(broker(50_000));
        let mut handles = Vec::new();

        for _ in 0..3 {
            let broker = Arc::clone(&broker);
            handles.push(thread::spawn(move || {
                match broker.lock("app", 20_000) {
                    LockOutcome::Allowed { request_id } => {
                        broker.commit("app", &request_id, 10_000, 10_000)
                    }
                    LockOutcome::Denied { .. } => false,
                }
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        // two fit in the window, the third is denied
        assert_eq!(admitted, 2);
        let status = broker.status();
        assert!(status.used_tokens <= 50_000);
        assert_eq!(status.locked_tokens, 0);
    }
}
