//! Sources of online/offline signals for the coordinator.
//!
//! Connectivity detection itself belongs to the host application; these are
//! two simple producers of the `Stream<Item = bool>` the coordinator consumes.

use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Manually driven connectivity switch.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  /// Report a connectivity change. Repeating the current value still
  /// produces a signal.
  pub fn set_online(&self, online: bool) {
    self.tx.send_replace(online);
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Signals sent after this call.
  pub fn signals(&self) -> impl Stream<Item = bool> + Send + 'static {
    let rx = self.tx.subscribe();
    stream::unfold(rx, |mut rx| async move {
      rx.changed().await.ok()?;
      let online = *rx.borrow_and_update();
      Some((online, rx))
    })
  }
}

struct ProbeState {
  client: reqwest::Client,
  url: Url,
  interval: Duration,
  last: Option<bool>,
}

/// Poll `url` every `interval` and emit only on reachability transitions.
/// Any HTTP response counts as online; only connection failures count as offline.
pub fn probe(client: reqwest::Client, url: Url, interval: Duration) -> impl Stream<Item = bool> + Send {
  let state = ProbeState {
    client,
    url,
    interval,
    last: None,
  };
  stream::unfold(state, |mut state| async move {
    loop {
      if state.last.is_some() {
        tokio::time::sleep(state.interval).await;
      }
      let online = state.client.head(state.url.clone()).send().await.is_ok();
      if state.last != Some(online) {
        debug!(online, url = %state.url, "connectivity changed");
        state.last = Some(online);
        return Some((online, state));
      }
    }
  })
}
