//! Retry scheduler for cards stuck in PAID.
//!
//! An external trigger (cron, timer service) calls [`RetryScheduler::run_retry_batch`]
//! with the shared bearer secret. Each call claims up to `batch_size` due cards,
//! oldest-due first, and tries to publish each one. Failures are isolated per card.

use crate::config::RetryConfig;
use crate::error::{PublishError, Result};
use crate::lifecycle::{FailureRecord, LifecycleController};
use crate::repository::{CardRepository, ClaimedRetry};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt - 1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let multiplier = 1i32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// When the next attempt is due after `attempts` failures, or `None` once the cap is reached
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        Some(now + self.delay_for_attempt(attempts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Published,
    Rescheduled,
    /// Attempt cap reached; the card stays PAID for manual follow-up
    Exhausted,
    /// Card no longer eligible or changed by another writer
    Skipped,
    /// Bookkeeping itself could not be written
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardRetryResult {
    pub card_id: Uuid,
    pub outcome: RetryOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryBatchReport {
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<CardRetryResult>,
}

impl RetryBatchReport {
    fn from_results(results: Vec<CardRetryResult>) -> Self {
        let mut report = Self {
            attempted: results.len(),
            ..Default::default()
        };
        for result in &results {
            match result.outcome {
                RetryOutcome::Published => report.published += 1,
                RetryOutcome::Skipped => report.skipped += 1,
                RetryOutcome::Rescheduled | RetryOutcome::Exhausted | RetryOutcome::Failed => {
                    report.failed += 1
                }
            }
        }
        report.results = results;
        report
    }
}

/// Compare two secrets without short-circuiting on the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct RetryScheduler {
    controller: Arc<LifecycleController>,
    repository: Arc<dyn CardRepository>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(
        controller: Arc<LifecycleController>,
        repository: Arc<dyn CardRepository>,
        config: RetryConfig,
    ) -> Self {
        Self {
            controller,
            repository,
            config,
        }
    }

    /// Reject unless a non-blank secret is configured and the credential matches it
    pub fn authorize(&self, credential: Option<&str>) -> Result<()> {
        let secret = match self.config.secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("Retry batch invoked but no retry secret is configured");
                return Err(PublishError::Unauthorized);
            }
        };

        match credential {
            Some(credential) if constant_time_eq(credential.trim().as_bytes(), secret.as_bytes()) => {
                Ok(())
            }
            _ => Err(PublishError::Unauthorized),
        }
    }

    #[instrument(skip(self, credential))]
    pub async fn run_retry_batch(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RetryBatchReport> {
        if let Err(e) = self.authorize(credential) {
            metrics::counter!("publisher.retry.unauthorized").increment(1);
            return Err(e);
        }

        let claims = self
            .repository
            .claim_due_retries(now, self.config.batch_size, self.config.claim_lease())
            .await?;
        debug!(claimed = claims.len(), "Claimed cards due for retry");

        let results: Vec<CardRetryResult> = stream::iter(claims)
            .map(|claim| self.retry_card(claim, now))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let report = RetryBatchReport::from_results(results);

        metrics::counter!("publisher.retry.batches").increment(1);
        metrics::counter!("publisher.retry.attempted").increment(report.attempted as u64);
        metrics::counter!("publisher.retry.published").increment(report.published as u64);
        metrics::counter!("publisher.retry.failed").increment(report.failed as u64);

        info!(
            attempted = report.attempted,
            published = report.published,
            failed = report.failed,
            skipped = report.skipped,
            "Retry batch finished"
        );

        Ok(report)
    }

    async fn retry_card(&self, claim: ClaimedRetry, now: DateTime<Utc>) -> CardRetryResult {
        let card_id = claim.card_id;

        let error = match self.controller.publish_paid_at(card_id, now).await {
            Ok(_) => {
                return CardRetryResult {
                    card_id,
                    outcome: RetryOutcome::Published,
                    attempts: claim.attempts,
                    next_retry_at: None,
                    error: None,
                }
            }
            // Published or archived by someone else since the claim
            Err(e @ (PublishError::InvalidStatus { .. } | PublishError::CardNotFound(_))) => {
                debug!(card_id = %card_id, error = %e, "Skipping retry");
                return CardRetryResult {
                    card_id,
                    outcome: RetryOutcome::Skipped,
                    attempts: claim.attempts,
                    next_retry_at: None,
                    error: Some(e.to_string()),
                };
            }
            Err(e) => e,
        };

        warn!(card_id = %card_id, attempts = claim.attempts, error = %error, "Retry attempt failed");

        let (outcome, attempts, next_retry_at) = match self
            .controller
            .record_failure(card_id, claim.attempts, &error, now)
            .await
        {
            Ok(FailureRecord::Scheduled {
                attempts,
                next_retry_at,
            }) => (RetryOutcome::Rescheduled, attempts, Some(next_retry_at)),
            Ok(FailureRecord::Exhausted { attempts }) => (RetryOutcome::Exhausted, attempts, None),
            Ok(FailureRecord::Superseded) => (RetryOutcome::Skipped, claim.attempts, None),
            Err(e) => {
                warn!(card_id = %card_id, error = %e, "Failed to record retry failure");
                (RetryOutcome::Failed, claim.attempts, None)
            }
        };

        CardRetryResult {
            card_id,
            outcome,
            attempts,
            next_retry_at,
            error: Some(error.to_string()),
        }
    }
}
