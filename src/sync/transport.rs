//! Delivery of queued actions to the backend.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::TransportError;
use crate::queue::{ActionType, PendingAction};

/// Opaque delivery capability injected into the coordinator.
///
/// The engine knows nothing about the wire: implementations decide routing
/// and encoding. Deliveries may be repeated for an action the backend already
/// applied, so implementations should forward [`PendingAction::idempotency_key`].
#[async_trait]
pub trait Transport: Send + Sync {
  async fn deliver(&self, action: &PendingAction) -> Result<(), TransportError>;
}

/// Longest backend error body kept in a rejection reason.
const MAX_REASON_LEN: usize = 200;

/// JSON-over-HTTP transport: `POST {base}/sync/{action_type}` with the payload
/// as the request body.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, TransportError> {
    let mut base = Url::parse(base_url)
      .map_err(|e| TransportError::Network(format!("invalid base url {}: {}", base_url, e)))?;
    // Without a trailing slash `join` would replace the last path segment
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Network(format!("failed to build http client: {}", e)))?;

    Ok(Self {
      client,
      base,
      token,
      timeout,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }

  fn endpoint(&self, action_type: ActionType) -> Result<Url, TransportError> {
    self
      .base
      .join(&format!("sync/{}", action_type))
      .map_err(|e| TransportError::Network(format!("invalid endpoint: {}", e)))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn deliver(&self, action: &PendingAction) -> Result<(), TransportError> {
    let url = self.endpoint(action.action_type)?;
    debug!(id = action.id, %url, "delivering action");

    let mut request = self
      .client
      .post(url)
      .header(CONTENT_TYPE, "application/json")
      .header("Idempotency-Key", action.idempotency_key())
      .body(action.payload.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
      if e.is_timeout() {
        TransportError::Timeout(self.timeout)
      } else {
        TransportError::Network(e.to_string())
      }
    })?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let mut reason = response.text().await.unwrap_or_default();
    if reason.len() > MAX_REASON_LEN {
      let mut cut = MAX_REASON_LEN;
      while !reason.is_char_boundary(cut) {
        cut -= 1;
      }
      reason.truncate(cut);
    }
    Err(TransportError::Rejected {
      status: status.as_u16(),
      reason,
    })
  }
}
