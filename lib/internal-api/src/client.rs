//! Client for the internal API Unix socket.

use crate::error::InternalApiError;
use crate::protocol::{ApiOutcome, ApiRequest, ApiResponse, Method};
use keel_workflow::sandbox::{self, Capability};
use rootcause::prelude::Report;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, instrument, warn};

/// Path polled by [`InternalApiClient::wait_until_ready`].
pub const READY_PATH: &str = "/ready";

const READY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const READY_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalApiConfig {
    pub socket_path: PathBuf,
    /// Deadline for one request, connect included.
    pub request_timeout: Duration,
    /// How long [`InternalApiClient::wait_until_ready`] keeps polling.
    pub ready_timeout: Duration,
}

impl InternalApiConfig {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Talks to the internal API over a local socket.
///
/// Intended for activities. Every call checks the sandbox first, so using
/// the client from workflow code fails with [`InternalApiError::Sandboxed`]
/// and is reported as a determinism violation.
#[derive(Debug, Clone)]
pub struct InternalApiClient {
    config: InternalApiConfig,
}

impl InternalApiClient {
    #[must_use]
    pub fn new(config: InternalApiConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &InternalApiConfig {
        &self.config
    }

    /// Sends `GET path`.
    ///
    /// # Errors
    ///
    /// See [`InternalApiClient::request`].
    pub async fn get(&self, path: &str) -> Result<ApiOutcome, Report<InternalApiError>> {
        self.request(Method::Get, path, None).await
    }

    /// Sends `POST path` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`InternalApiClient::request`].
    pub async fn post(
        &self,
        path: &str,
        body: JsonValue,
    ) -> Result<ApiOutcome, Report<InternalApiError>> {
        self.request(Method::Post, path, Some(body)).await
    }

    /// Sends one request and classifies the response.
    ///
    /// A request that outlives the timeout is an [`ApiOutcome::Timeout`], not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if called from workflow code, the socket cannot be
    /// reached, or the peer breaks the frame protocol.
    #[instrument(skip(self, body), fields(socket = %self.config.socket_path.display()))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<ApiOutcome, Report<InternalApiError>> {
        sandbox::ensure_allowed(Capability::Network).map_err(InternalApiError::from)?;

        let request = ApiRequest {
            method,
            path: path.to_string(),
            body,
        };
        let response =
            match tokio::time::timeout(self.config.request_timeout, self.exchange(&request)).await {
                Ok(response) => response?,
                Err(_) => {
                    warn!(timeout = ?self.config.request_timeout, "internal API request timed out");
                    return Ok(ApiOutcome::Timeout);
                }
            };

        let status = response.status;
        debug!(status, "internal API responded");
        ApiOutcome::from_response(response)
            .ok_or_else(|| InternalApiError::UnexpectedStatus { status }.into())
    }

    /// Polls [`READY_PATH`] with capped backoff until it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`InternalApiError::NotReady`] once the ready timeout passes.
    pub async fn wait_until_ready(&self) -> Result<(), Report<InternalApiError>> {
        sandbox::ensure_allowed(Capability::Network).map_err(InternalApiError::from)?;

        let started = tokio::time::Instant::now();
        let mut delay = READY_INITIAL_BACKOFF;
        loop {
            match self.get(READY_PATH).await {
                Ok(outcome) if outcome.is_success() => {
                    info!(waited = ?started.elapsed(), "internal API ready");
                    return Ok(());
                }
                Ok(outcome) => debug!(?outcome, "internal API not ready"),
                Err(report) => debug!(error = %report, "internal API unreachable"),
            }

            let waited = started.elapsed();
            if waited >= self.config.ready_timeout {
                return Err(InternalApiError::NotReady { waited }.into());
            }
            tokio::time::sleep(delay.min(self.config.ready_timeout - waited)).await;
            delay = (delay * 2).min(READY_MAX_BACKOFF);
        }
    }

    async fn exchange(&self, request: &ApiRequest) -> Result<ApiResponse, InternalApiError> {
        let stream = UnixStream::connect(&self.config.socket_path)
            .await
            .map_err(|e| InternalApiError::Connect {
                path: self.config.socket_path.clone(),
                message: e.to_string(),
            })?;
        let (reader, mut writer) = stream.into_split();

        let mut frame = serde_json::to_vec(request).map_err(|e| InternalApiError::Protocol {
            message: e.to_string(),
        })?;
        frame.push(b'\n');
        writer
            .write_all(&frame)
            .await
            .map_err(|e| InternalApiError::Io {
                message: e.to_string(),
            })?;
        writer.flush().await.map_err(|e| InternalApiError::Io {
            message: e.to_string(),
        })?;

        let mut line = String::new();
        let read = BufReader::new(reader)
            .read_line(&mut line)
            .await
            .map_err(|e| InternalApiError::Io {
                message: e.to_string(),
            })?;
        if read == 0 {
            return Err(InternalApiError::Protocol {
                message: "connection closed before a response".to_string(),
            });
        }
        serde_json::from_str(line.trim()).map_err(|e| InternalApiError::Protocol {
            message: format!("invalid response frame: {e}"),
        })
    }
}
