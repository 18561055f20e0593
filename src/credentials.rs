use crate::error::{Error, Result, ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Primary,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => f.write_str("free"),
            Tier::Primary => f.write_str("primary"),
        }
    }
}

#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub tier: Tier,
    pub secret: Option<String>,
}

impl Credential {
    pub fn free(id: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            id: id.into(),
            tier: Tier::Free,
            secret,
        }
    }

    pub fn primary(id: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            id: id.into(),
            tier: Tier::Primary,
            secret,
        }
    }

    fn usable_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("configured", &self.usable_secret().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageState {
    pub prefer_primary: bool,
    pub consecutive_primary_failures: u32,
    pub last_failure_reason: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Builds a client for one secret and checks that it works with a cheap call.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: Send;

    async fn connect(&self, secret: &str) -> std::result::Result<Self::Client, ServiceError>;
}

pub struct Acquired<C> {
    pub client: C,
    pub credential_id: String,
    pub tier: Tier,
}

pub struct CredentialPool {
    context: String,
    entries: Vec<Credential>,
    threshold: u32,
    state: Mutex<UsageState>,
}

impl CredentialPool {
    pub fn new(context: impl Into<String>, entries: Vec<Credential>, threshold: u32) -> Self {
        Self {
            context: context.into(),
            entries,
            threshold: threshold.max(1),
            state: Mutex::new(UsageState::default()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn usage(&self) -> UsageState {
        self.lock().clone()
    }

    /// The tier the next call will most likely run on.
    pub fn current_tier(&self) -> Tier {
        if self.lock().prefer_primary || self.free_entries().next().is_none() {
            Tier::Primary
        } else {
            Tier::Free
        }
    }

    /// Find a working client: free keys first, then the primary key.
    pub async fn acquire<K: Connector>(
        &self,
        connector: &K,
        force_primary: bool,
    ) -> Result<Acquired<K::Client>> {
        if let Some(found) = self.try_free(connector, force_primary).await {
            return Ok(found);
        }
        let acquired = self.connect_primary(connector).await?;
        self.record_primary_success();
        Ok(acquired)
    }

    /// Acquire a client and run `op` with it, feeding the outcome of `op`
    /// back into the rotation state. A rate-limited free key moves on to the
    /// next free key; any other free failure switches the context to the
    /// primary key, whose failures count towards the breaker.
    pub async fn execute<K, F, Fut, T>(&self, connector: &K, force_primary: bool, op: F) -> Result<T>
    where
        K: Connector,
        F: Fn(K::Client) -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        if !force_primary {
            for cred in self.free_entries() {
                if self.lock().prefer_primary {
                    break;
                }
                let Some(secret) = cred.usable_secret() else {
                    continue;
                };
                let outcome = match connector.connect(secret).await {
                    Ok(client) => op(client).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(value) => {
                        debug!(context = %self.context, key = %cred.id, "free key served request");
                        return Ok(value);
                    }
                    Err(err) => {
                        if !self.record_free_failure(cred, &err) {
                            break;
                        }
                    }
                }
            }
        }

        let acquired = self.connect_primary(connector).await?;
        match op(acquired.client).await {
            Ok(value) => {
                self.record_primary_success();
                Ok(value)
            }
            Err(err) => Err(self.record_primary_failure(err)),
        }
    }

    async fn try_free<K: Connector>(
        &self,
        connector: &K,
        force_primary: bool,
    ) -> Option<Acquired<K::Client>> {
        if force_primary {
            return None;
        }
        for cred in self.free_entries() {
            if self.lock().prefer_primary {
                return None;
            }
            let Some(secret) = cred.usable_secret() else {
                continue;
            };
            match connector.connect(secret).await {
                Ok(client) => {
                    info!(context = %self.context, key = %cred.id, "using free key");
                    return Some(Acquired {
                        client,
                        credential_id: cred.id.clone(),
                        tier: Tier::Free,
                    });
                }
                Err(err) => {
                    if !self.record_free_failure(cred, &err) {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Probe the primary key. A failed probe counts against the breaker;
    /// a successful probe does not reset it.
    async fn connect_primary<K: Connector>(&self, connector: &K) -> Result<Acquired<K::Client>> {
        let primary = self
            .entries
            .iter()
            .find(|c| c.tier == Tier::Primary && c.usable_secret().is_some())
            .ok_or_else(|| Error::NoCredentials {
                context: self.context.clone(),
            })?;
        let secret = primary.usable_secret().unwrap_or_default();
        match connector.connect(secret).await {
            Ok(client) => Ok(Acquired {
                client,
                credential_id: primary.id.clone(),
                tier: Tier::Primary,
            }),
            Err(err) => Err(self.record_primary_failure(err)),
        }
    }

    fn free_entries(&self) -> impl Iterator<Item = &Credential> {
        self.entries
            .iter()
            .filter(|c| c.tier == Tier::Free && c.usable_secret().is_some())
    }

    /// Returns true when rotation may continue with the next free key.
    fn record_free_failure(&self, cred: &Credential, err: &ServiceError) -> bool {
        if err.is_rate_limit() {
            warn!(context = %self.context, key = %cred.id, "free key rate limited, rotating: {err}");
            return true;
        }
        let mut state = self.lock();
        state.prefer_primary = true;
        state.last_failure_reason = Some(format!("{}: {err}", cred.id));
        state.last_failure_at = Some(Utc::now());
        warn!(context = %self.context, key = %cred.id, "free key failed, switching to primary: {err}");
        false
    }

    fn record_primary_failure(&self, err: ServiceError) -> Error {
        let mut state = self.lock();
        state.consecutive_primary_failures += 1;
        state.last_failure_reason = Some(err.to_string());
        state.last_failure_at = Some(Utc::now());
        let failures = state.consecutive_primary_failures;
        if failures >= self.threshold {
            warn!(context = %self.context, failures, "primary key circuit open");
            return Error::CircuitOpen {
                context: self.context.clone(),
                failures,
                last_failure: err.to_string(),
            };
        }
        warn!(
            context = %self.context,
            failures,
            threshold = self.threshold,
            "primary key failed: {err}"
        );
        Error::Service(err)
    }

    fn record_primary_success(&self) {
        let mut state = self.lock();
        if state.consecutive_primary_failures > 0 {
            info!(context = %self.context, "primary key recovered");
        }
        state.consecutive_primary_failures = 0;
        state.last_failure_reason = None;
        state.last_failure_at = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
