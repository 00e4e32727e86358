//! Authenticated request/response transport to the homeserver.
//!
//! Every call carries the access token as a bearer header and a per-call
//! timeout. Two timeout classes exist: control calls (30s) and long calls
//! (120s) for the sync long-poll and history pages, both of which may
//! legitimately block server-side waiting for data.
//!
//! Retrying is not automatic. Call sites that know a request is safe to
//! repeat wrap it in [`with_retry`] with an explicit [`RetryPolicy`].

use crate::{Error, Result};
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Configuration for the homeserver transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the homeserver, e.g. `https://matrix.example.org`.
    pub homeserver_url: String,

    /// Access token sent as `Authorization: Bearer`.
    pub access_token: String,

    /// Timeout for short control calls.
    pub control_timeout: Duration,

    /// Timeout for the long-poll and history page fetches.
    pub long_timeout: Duration,
}

impl TransportConfig {
    pub fn new(homeserver_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            homeserver_url: homeserver_url.into(),
            access_token: access_token.into(),
            control_timeout: Duration::from_secs(30),
            long_timeout: Duration::from_secs(120),
        }
    }
}

/// Which timeout class a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Control,
    Long,
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: usize,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// History page fetches: 15 attempts, one second apart.
    pub const HISTORY_PAGE: Self = Self::new(15, Duration::from_secs(1));

    /// One-time key claims issued while preparing a room for decryption.
    pub const KEY_CLAIM: Self = Self::new(5, Duration::from_secs(1));

    pub const fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A single attempt.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Standard Matrix error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

/// HTTP transport bound to one homeserver and one access token.
pub struct Transport {
    client: Client,
    base: Url,
    config: TransportConfig,
}

impl Transport {
    /// Create a transport for the configured homeserver.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let base = Url::parse(&config.homeserver_url).map_err(|e| {
            Error::Config(format!(
                "invalid homeserver URL '{}': {e}",
                config.homeserver_url
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "homeserver URL '{}' cannot carry a path",
                config.homeserver_url
            )));
        }

        let client = Client::builder()
            .user_agent(concat!("archivist/", env!("CARGO_PKG_VERSION")))
            .build()?;

        tracing::info!("Transport initialized for {}", base);

        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Timeout applied to calls of the given kind.
    pub fn timeout(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Control => self.config.control_timeout,
            CallKind::Long => self.config.long_timeout,
        }
    }

    /// Build an endpoint URL from path segments, percent-encoding each one.
    pub fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config("homeserver URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Issue one request and decode the JSON response.
    ///
    /// Non-2xx responses become [`Error::Http`] carrying the Matrix
    /// `errcode` when the body provides one.
    pub async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
        kind: CallKind,
    ) -> Result<Value> {
        let mut url = self.url(segments)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }

        tracing::trace!("{} {}", method, url.path());

        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.config.access_token)
            .timeout(self.timeout(kind));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(http_error(status.as_u16(), &bytes));
        }
        if bytes.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Turn an error response into [`Error::Http`].
fn http_error(status: u16, body: &[u8]) -> Error {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errcode.is_empty() => Error::Http {
            status,
            errcode: parsed.errcode,
            message: parsed.error,
        },
        _ => Error::Http {
            status,
            errcode: "M_UNKNOWN".to_string(),
            message: String::from_utf8_lossy(body).chars().take(200).collect(),
        },
    }
}

/// Run `call` until it succeeds, fails permanently, or the policy runs out.
///
/// Only transient failures (see [`Error::is_transient`]) are retried.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= attempts => {
                return Err(Error::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation,
                    attempt,
                    attempts,
                    policy.delay,
                    e
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
