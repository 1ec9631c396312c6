// src/monitoring/key_health.rs

use crate::config::UpstreamConfig;
use crate::error::{AppError, Result};
use crate::handlers::base::{upstream_message, Action};
use crate::handlers::processor::ResponseProcessor;
use crate::key_manager::{KeyPoolManager, ProbeTarget, TestOutcome};
use crate::metrics;
use crate::storage::{preview_key, KeyStatus};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::StatusCode;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Максимальное число одновременных проверок в одном батче.
const MAX_TEST_BATCH: usize = 50;

/// Raw upstream answer to a probe request.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Sends one lightweight authenticated request upstream.
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    async fn send(&self, credential: &str) -> Result<ProbeResponse>;
}

/// Probe over HTTP: a one-message chat completion capped at a few tokens.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, upstream: &UpstreamConfig) -> Self {
        Self {
            client,
            url: upstream.probe_url.clone(),
            model: upstream.probe_model.clone(),
        }
    }
}

#[async_trait]
impl UpstreamProbe for HttpProbe {
    async fn send(&self, credential: &str) -> Result<ProbeResponse> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": 10,
                "messages": [{ "role": "user", "content": "test" }],
                "stream": false,
            }))
            .send()
            .await?;
        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| AppError::Internal(format!("upstream returned an invalid status: {e}")))?;
        let body = response.bytes().await?;
        Ok(ProbeResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyTestReport {
    pub success: bool,
    /// Last upstream status seen; `None` when no response ever arrived.
    pub status: Option<u16>,
    pub message: String,
    pub key_status: KeyStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestAllSummary {
    pub total: usize,
    pub tested: usize,
    pub success: usize,
    pub failed: usize,
    pub banned: usize,
}

/// Result of one probe run before it is applied to the pool.
struct ProbeVerdict {
    outcome: TestOutcome,
    status: Option<u16>,
    message: String,
}

/// Тестирование ключей против upstream.
#[derive(Clone)]
pub struct KeyHealthProbe {
    pool: Arc<KeyPoolManager>,
    upstream: Arc<dyn UpstreamProbe>,
    processor: ResponseProcessor,
}

impl KeyHealthProbe {
    pub fn new(pool: Arc<KeyPoolManager>, upstream: Arc<dyn UpstreamProbe>) -> Self {
        Self {
            pool,
            upstream,
            processor: ResponseProcessor::standard(),
        }
    }

    /// Probes key `id` and writes the verdict through to the pool.
    #[instrument(skip(self), fields(key.id = %id))]
    pub async fn test_key(&self, id: &str) -> Result<KeyTestReport> {
        let target = self.pool.probe_target(id)?;
        let verdict = self.run(&target).await;

        let result = match verdict.outcome {
            TestOutcome::Passed => "success",
            TestOutcome::Banned { .. } => "banned",
            TestOutcome::Disabled { .. } => "disabled",
        };
        metrics::record_probe(result);
        let success = verdict.outcome == TestOutcome::Passed;

        // Ключ мог быть удалён, пока шла проверка: тогда NotFound.
        let record = self.pool.apply_test_outcome(id, verdict.outcome).await?;
        info!(
            key.preview = %record.preview(),
            result,
            status = ?verdict.status,
            key_status = %record.status,
            "Key test finished"
        );
        Ok(KeyTestReport {
            success,
            status: verdict.status,
            message: verdict.message,
            key_status: record.status,
        })
    }

    /// Runs the probe with retries for transient failures only.
    async fn run(&self, target: &ProbeTarget) -> ProbeVerdict {
        let attempts = target.retry.attempts();
        let mut last_status = None;
        let mut last_error = String::from("Key test was not attempted");

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(attempt, attempts, "Retrying key test");
                tokio::time::sleep(target.retry.delay()).await;
            }

            let response = match tokio::time::timeout(target.timeout, self.upstream.send(&target.key)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    last_error = format!("Network error: {e}");
                    warn!(attempt, error = %e, key.preview = %preview_key(&target.key), "Key test request failed");
                    continue;
                }
                Err(_) => {
                    last_error = format!("Timeout after {}ms", target.timeout.as_millis());
                    warn!(attempt, key.preview = %preview_key(&target.key), "Key test timed out");
                    continue;
                }
            };

            let status = response.status;
            last_status = Some(status.as_u16());
            let action = self.processor.classify(status, &response.body);
            match action {
                Action::Success => {
                    return ProbeVerdict {
                        outcome: TestOutcome::Passed,
                        status: last_status,
                        message: "Key is valid".to_string(),
                    };
                }
                Action::PaymentRequired { reason } => {
                    let detail = format!("{}: {}", status.as_u16(), reason);
                    let ban = target.auto_ban.enabled && target.auto_ban.ban_402;
                    return verdict_for_rejection(ban, reason, detail, last_status);
                }
                Action::InvalidKey { reason } => {
                    let detail = format!("{}: {}", status.as_u16(), reason);
                    let ban = target.auto_ban.enabled && target.auto_ban.ban_401;
                    return verdict_for_rejection(ban, reason, detail, last_status);
                }
                Action::ReturnToClient => {
                    let default = status.canonical_reason().unwrap_or("Client error");
                    let detail = format!("{}: {}", status.as_u16(), upstream_message(&response.body, default));
                    return ProbeVerdict {
                        outcome: TestOutcome::Disabled { detail: detail.clone() },
                        status: last_status,
                        message: detail,
                    };
                }
                Action::RetryNextKey { reason } => {
                    last_error = format!("{}: {}", status.as_u16(), reason);
                    warn!(attempt, status = status.as_u16(), "Transient key test failure");
                }
            }
        }

        ProbeVerdict {
            outcome: TestOutcome::Disabled {
                detail: last_error.clone(),
            },
            status: last_status,
            message: last_error,
        }
    }

    /// Tests every non-banned key in bounded concurrent batches.
    pub async fn test_all_keys(&self) -> TestAllSummary {
        let ids = self.pool.testable_key_ids();
        let config = self.pool.config();
        let batch_size = config.performance.concurrent_limit.clamp(1, MAX_TEST_BATCH);
        let pause = Duration::from_millis(config.performance.batch_pause_ms);

        let mut summary = TestAllSummary {
            total: ids.len(),
            ..TestAllSummary::default()
        };
        info!(total = summary.total, batch_size, "Testing all keys");

        let batches: Vec<&[String]> = ids.chunks(batch_size).collect();
        let batch_count = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let results = join_all(batch.iter().map(|id| self.test_key(id))).await;
            for (id, result) in batch.iter().zip(results) {
                summary.tested += 1;
                match result {
                    Ok(report) if report.success => summary.success += 1,
                    Ok(report) => {
                        summary.failed += 1;
                        if report.key_status == KeyStatus::Banned {
                            summary.banned += 1;
                        }
                    }
                    Err(e) => {
                        summary.failed += 1;
                        warn!(key.id = %id, error = %e, "Key test aborted");
                    }
                }
            }
            if i + 1 < batch_count && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        info!(
            tested = summary.tested,
            success = summary.success,
            failed = summary.failed,
            banned = summary.banned,
            "Key test run finished"
        );
        summary
    }
}

fn verdict_for_rejection(ban: bool, reason: String, detail: String, status: Option<u16>) -> ProbeVerdict {
    let outcome = if ban {
        TestOutcome::Banned {
            reason,
            detail: detail.clone(),
        }
    } else {
        TestOutcome::Disabled { detail: detail.clone() }
    };
    ProbeVerdict {
        outcome,
        status,
        message: detail,
    }
}
