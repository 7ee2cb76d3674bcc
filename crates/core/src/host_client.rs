//! Thin, retrying interface to the host's entity API (§4.2). Real traffic
//! goes through `HttpHostClient` over `reqwest` with bearer-token auth,
//! following the teacher's pattern of putting network machinery in its own
//! module (`mqtt.rs`) and keeping the message/topic shapes next to it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::error::HostError;
use crate::model::EntityRef;

/// Bounded retries on transient failures: ≤3 tries, initial backoff 1s,
/// doubling, capped at 4s (§4.2).
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(4);
const PER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads may be cached for at most 1s to cheapen tight loops.
const READ_CACHE_TTL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait HostClient: Send + Sync {
    async fn read_time_of_day(&self, entity: &EntityRef) -> Result<String, HostError>;
    async fn read_number(&self, entity: &EntityRef) -> Result<f64, HostError>;
    async fn read_bool(&self, entity: &EntityRef) -> Result<bool, HostError>;
    async fn set_bool(&self, entity: &EntityRef, value: bool) -> Result<(), HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CachedValue {
    Bool(bool),
    Number(f64),
}

// ---------------------------------------------------------------------------
// Production implementation
// ---------------------------------------------------------------------------

/// Wire shape of a host entity's state, as returned by the host's entity API.
#[derive(Debug, Deserialize)]
struct EntityState {
    state: String,
}

pub struct HttpHostClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    cache: Mutex<HashMap<EntityRef, (Instant, CachedValue)>>,
}

impl HttpHostClient {
    pub fn new(base_url: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PER_REQUEST_TIMEOUT)
            .build()
            .expect("failed to build host http client");

        Self {
            http,
            base_url,
            token,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn state_url(&self, entity: &EntityRef) -> String {
        format!("{}/api/states/{}", self.base_url.trim_end_matches('/'), entity)
    }

    fn service_url(&self, domain: &str, service: &str) -> String {
        format!(
            "{}/api/services/{}/{}",
            self.base_url.trim_end_matches('/'),
            domain,
            service
        )
    }

    async fn cached(&self, entity: &EntityRef) -> Option<CachedValue> {
        let cache = self.cache.lock().await;
        let (at, v) = cache.get(entity)?;
        if at.elapsed() <= READ_CACHE_TTL {
            Some(*v)
        } else {
            None
        }
    }

    async fn cache_put(&self, entity: &EntityRef, v: CachedValue) {
        let mut cache = self.cache.lock().await;
        cache.insert(entity.clone(), (Instant::now(), v));
    }

    /// Runs `op` with bounded exponential-backoff retry on transient errors;
    /// permanent errors surface immediately (§4.2/§7).
    async fn with_retry<T, F, Fut>(&self, entity: &EntityRef, op: F) -> Result<T, HostError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, HostError>>,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    warn!(
                        entity = %entity,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        "transient host error — retrying"
                    );
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("loop always runs at least once"))
    }

    async fn get_state(&self, entity: &EntityRef) -> Result<String, HostError> {
        let resp = self
            .http
            .get(self.state_url(entity))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HostError::Transient {
                entity: entity.to_string(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(HostError::Transient {
                entity: entity.to_string(),
                detail: format!("http {status}"),
            });
        }
        if !status.is_success() {
            return Err(HostError::Permanent {
                entity: entity.to_string(),
                detail: format!("http {status}"),
            });
        }

        let body: EntityState = resp.json().await.map_err(|e| HostError::Permanent {
            entity: entity.to_string(),
            detail: format!("malformed entity state response: {e}"),
        })?;

        Ok(body.state)
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity: &EntityRef,
    ) -> Result<(), HostError> {
        let body = serde_json::json!({ "entity_id": entity.0 });
        let resp = self
            .http
            .post(self.service_url(domain, service))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Transient {
                entity: entity.to_string(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(HostError::Transient {
                entity: entity.to_string(),
                detail: format!("http {status}"),
            });
        }
        if !status.is_success() {
            return Err(HostError::Permanent {
                entity: entity.to_string(),
                detail: format!("http {status}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HostClient for HttpHostClient {
    async fn read_time_of_day(&self, entity: &EntityRef) -> Result<String, HostError> {
        self.with_retry(entity, || self.get_state(entity)).await
    }

    async fn read_number(&self, entity: &EntityRef) -> Result<f64, HostError> {
        if let Some(CachedValue::Number(v)) = self.cached(entity).await {
            return Ok(v);
        }
        let raw = self.with_retry(entity, || self.get_state(entity)).await?;
        let value: f64 = raw.trim().parse().map_err(|_| HostError::Permanent {
            entity: entity.to_string(),
            detail: format!("expected numeric state, got '{raw}'"),
        })?;
        self.cache_put(entity, CachedValue::Number(value)).await;
        Ok(value)
    }

    async fn read_bool(&self, entity: &EntityRef) -> Result<bool, HostError> {
        if let Some(CachedValue::Bool(v)) = self.cached(entity).await {
            return Ok(v);
        }
        let raw = self.with_retry(entity, || self.get_state(entity)).await?;
        let value = match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => true,
            "off" | "false" | "0" => false,
            other => {
                return Err(HostError::Permanent {
                    entity: entity.to_string(),
                    detail: format!("expected on/off state, got '{other}'"),
                })
            }
        };
        self.cache_put(entity, CachedValue::Bool(value)).await;
        Ok(value)
    }

    async fn set_bool(&self, entity: &EntityRef, value: bool) -> Result<(), HostError> {
        let service = if value { "turn_on" } else { "turn_off" };
        self.with_retry(entity, || self.call_service("switch", service, entity))
            .await?;
        self.cache_put(entity, CachedValue::Bool(value)).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
