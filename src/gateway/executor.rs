//! Single-request execution with key rotation.
//!
//! One logical `call` may issue several attempts: a rate-limited or rejected
//! key is recorded against the registry and the next key takes over, so a
//! single misbehaving credential never fails the caller. Acquisition order
//! is fixed: governor slot first, then key registry, then everything that
//! touches the database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::archive::{RawArchiveWriter, RawCall};
use super::governor::ConcurrencyGovernor;
use crate::config::Settings;
use crate::error::{sanitize_detail, BatchError};
use crate::keys::{KeyLease, KeyOutcome, KeyRegistry};
use crate::providers::{self, Provider};

/// Upper bound on key rotations for one logical call.
const MAX_ATTEMPTS: u32 = 4;

const USER_AGENT: &str = concat!("tourbatch/", env!("CARGO_PKG_VERSION"));

/// Gateway error text the provider emits when a key's daily allowance is
/// spent.
const RATE_LIMIT_MARKER: &str = "LIMITED_NUMBER_OF_SERVICE_REQUESTS_EXCEEDS";
/// Gateway error text for an unknown or unapproved key.
const AUTH_MARKER: &str = "SERVICE_KEY_IS_NOT_REGISTERED";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub kto_base_url: String,
    pub kma_base_url: String,
    pub request_timeout: Duration,
    pub app_name: String,
}

impl ExecutorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            kto_base_url: settings.kto.base_url.clone(),
            kma_base_url: settings.kma.base_url.clone(),
            request_timeout: settings.request_timeout,
            app_name: "tourbatch".to_string(),
        }
    }
}

/// One call as a job sees it.
pub struct CallSpec<'a> {
    pub provider: Provider,
    pub endpoint: &'a str,
    pub params: Vec<(String, String)>,
    pub store_raw: bool,
}

/// Structured response returned to jobs.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub duration_ms: u64,
    pub key_hash: String,
    pub raw_id: Option<String>,
}

pub struct HttpExecutor {
    client: Client,
    registry: Arc<KeyRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    archive: Arc<RawArchiveWriter>,
    config: ExecutorConfig,
}

impl HttpExecutor {
    pub fn new(
        registry: Arc<KeyRegistry>,
        governor: Arc<ConcurrencyGovernor>,
        archive: Arc<RawArchiveWriter>,
        config: ExecutorConfig,
    ) -> Result<Self, BatchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BatchError::Config {
                detail: format!("http client construction failed: {e}"),
            })?;
        Ok(Self {
            client,
            registry,
            governor,
            archive,
            config,
        })
    }

    /// Execute one logical call, rotating keys as outcomes demand.
    pub async fn call(&self, spec: CallSpec<'_>) -> Result<ApiResponse, BatchError> {
        let mut last_error: Option<BatchError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let slot = self.governor.acquire(spec.provider).await?;
            let lease = match self.registry.acquire(spec.provider) {
                Ok(lease) => lease,
                // Exhaustion ends the call; a prior attempt's error is more
                // specific only when rotation itself caused the exhaustion.
                Err(e) => {
                    drop(slot);
                    return Err(e);
                }
            };

            let (outcome, result) = self.execute_once(&spec, &lease).await;
            drop(slot);

            self.registry.record(spec.provider, &lease.hash, outcome);
            self.governor
                .report(spec.provider, outcome == KeyOutcome::Ok)
                .await;

            match outcome {
                KeyOutcome::Ok => return result,
                KeyOutcome::RateLimited => {
                    debug!(
                        "{} key {} rate limited on {}, rotating (attempt {attempt})",
                        spec.provider, lease.hash, spec.endpoint
                    );
                }
                KeyOutcome::AuthError => {
                    warn!(
                        "{} key {} rejected on {}, rotating (attempt {attempt})",
                        spec.provider, lease.hash, spec.endpoint
                    );
                }
                KeyOutcome::TransientError => {}
            }
            if let Err(e) = result {
                last_error = Some(e);
            }
        }

        Err(last_error.unwrap_or(BatchError::Transient {
            detail: "call attempts exhausted".to_string(),
        }))
    }

    /// Probe disabled keys whose cooldown elapsed with a cheap request and
    /// reactivate the ones that answer. Returns how many came back.
    pub async fn probe(
        &self,
        provider: Provider,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> usize {
        let candidates = self.registry.probe_candidates(provider);
        let mut reactivated = 0;

        for lease in candidates {
            let Ok(slot) = self.governor.acquire(provider).await else {
                break;
            };
            let spec = CallSpec {
                provider,
                endpoint,
                params: params.clone(),
                store_raw: false,
            };
            let (outcome, _) = self.execute_once(&spec, &lease).await;
            drop(slot);
            self.governor.report(provider, outcome == KeyOutcome::Ok).await;

            if outcome == KeyOutcome::Ok {
                self.registry.reactivate(provider, &lease.hash);
                reactivated += 1;
            } else {
                self.registry.defer_probe(provider, &lease.hash);
            }
        }
        reactivated
    }

    async fn execute_once(
        &self,
        spec: &CallSpec<'_>,
        lease: &KeyLease,
    ) -> (KeyOutcome, Result<ApiResponse, BatchError>) {
        let base = match spec.provider {
            Provider::Kto => &self.config.kto_base_url,
            Provider::Kma => &self.config.kma_base_url,
        };
        let url = format!("{}/{}", base.trim_end_matches('/'), spec.endpoint);

        let mut query = self.common_params(spec.provider);
        query.extend(spec.params.iter().cloned());
        let mut signed = query.clone();
        signed.push(("serviceKey".to_string(), lease.secret.clone()));

        let started = Instant::now();
        let send_result = self.client.get(&url).query(&signed).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, text) = match send_result {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(text) => (status, text),
                    Err(e) => {
                        let detail = sanitize_detail(&e.to_string());
                        return (
                            KeyOutcome::TransientError,
                            Err(BatchError::Transient {
                                detail: format!("response read failed: {detail}"),
                            }),
                        );
                    }
                }
            }
            Err(e) => {
                let detail = sanitize_detail(&e.to_string());
                if spec.store_raw {
                    let body = serde_json::json!({ "transport_error": detail });
                    self.archive
                        .archive(RawCall {
                            provider: spec.provider,
                            endpoint: spec.endpoint,
                            params: &query,
                            status: 0,
                            body: &body,
                            duration_ms,
                            key_hash: &lease.hash,
                        })
                        .await;
                }
                return (
                    KeyOutcome::TransientError,
                    Err(BatchError::Transient {
                        detail: format!("request failed: {detail}"),
                    }),
                );
            }
        };

        let parsed: Option<Value> = serde_json::from_str(&text).ok();
        let body = parsed
            .clone()
            .unwrap_or_else(|| Value::String(text.clone()));

        let raw_id = if spec.store_raw {
            self.archive
                .archive(RawCall {
                    provider: spec.provider,
                    endpoint: spec.endpoint,
                    params: &query,
                    status,
                    body: &body,
                    duration_ms,
                    key_hash: &lease.hash,
                })
                .await
        } else {
            None
        };

        let outcome = classify(status, &text, parsed.as_ref());
        let result = match outcome {
            KeyOutcome::Ok => Ok(ApiResponse {
                status,
                body,
                duration_ms,
                key_hash: lease.hash.clone(),
                raw_id,
            }),
            KeyOutcome::RateLimited => Err(BatchError::RateLimited {
                provider: spec.provider,
            }),
            KeyOutcome::AuthError => Err(BatchError::Auth {
                provider: spec.provider,
                detail: sanitize_detail(provider_error_text(parsed.as_ref(), &text)),
            }),
            KeyOutcome::TransientError => Err(BatchError::Transient {
                detail: sanitize_detail(&format!(
                    "HTTP {status}: {}",
                    provider_error_text(parsed.as_ref(), &text)
                )),
            }),
        };
        (outcome, result)
    }

    fn common_params(&self, provider: Provider) -> Vec<(String, String)> {
        match provider {
            Provider::Kto => vec![
                ("MobileOS".to_string(), "ETC".to_string()),
                ("MobileApp".to_string(), self.config.app_name.clone()),
                ("_type".to_string(), "json".to_string()),
            ],
            Provider::Kma => vec![("dataType".to_string(), "JSON".to_string())],
        }
    }
}

/// Map a finished request to a key outcome.
///
/// The gateway reports quota and credential problems both through HTTP
/// status codes and through error text inside an otherwise-200 envelope
/// (sometimes as an XML document), so the body text is consulted first.
pub fn classify(status: u16, body_text: &str, parsed: Option<&Value>) -> KeyOutcome {
    if status == 429 || body_text.contains(RATE_LIMIT_MARKER) {
        return KeyOutcome::RateLimited;
    }
    if status == 401 || status == 403 || body_text.contains(AUTH_MARKER) {
        return KeyOutcome::AuthError;
    }
    if status >= 500 {
        return KeyOutcome::TransientError;
    }

    let Some(body) = parsed else {
        // Unparseable 2xx/4xx body (e.g. an XML error document that did not
        // match the markers above).
        return KeyOutcome::TransientError;
    };

    match providers::result_code(body) {
        Some(code) if providers::is_success_code(code) => KeyOutcome::Ok,
        Some(_) => KeyOutcome::TransientError,
        None => KeyOutcome::TransientError,
    }
}

fn provider_error_text<'a>(parsed: Option<&'a Value>, raw: &'a str) -> &'a str {
    parsed
        .and_then(providers::result_msg)
        .unwrap_or_else(|| raw.get(..200).unwrap_or(raw))
}
