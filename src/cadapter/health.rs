//! Connection health monitoring.
//!
//! Two states, connected and offline, driven by a HEAD-bucket probe. While
//! offline every operation fails fast with [`StorageError::Offline`]
//! instead of blocking on transport timeouts, and the shared cancellation
//! token aborts calls already in flight. Probe attempts back off from
//! [`PROBE_INTERVAL_MIN`] up to [`PROBE_INTERVAL_MAX`] until the endpoint
//! answers again.

use crate::cadapter::client::ObjectBackend;
use crate::error::{Result, StorageError};
use log::{info, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const PROBE_INTERVAL_MIN: Duration = Duration::from_secs(1);
pub const PROBE_INTERVAL_MAX: Duration = Duration::from_secs(60);

pub struct ConnectionMonitor {
    bucket: String,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    connected: bool,
    backoff: Duration,
    next_probe: Instant,
    token: CancellationToken,
}

impl ConnectionMonitor {
    /// Starts in the connected state; the first failing call or probe
    /// flips it.
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Mutex::new(MonitorState {
                connected: true,
                backoff: PROBE_INTERVAL_MIN,
                next_probe: Instant::now(),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Fail-fast guard used before every remote call.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StorageError::Offline)
        }
    }

    /// Token shared by all in-flight requests; cancelled on transition to
    /// offline and replaced when reachability is re-confirmed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.lock().unwrap().token.child_token()
    }

    /// Run a reachability probe unless the backoff window is still open.
    /// Returns the connection state after the attempt. Any answer from the
    /// endpoint counts as reachable, including "bucket not found".
    pub async fn probe<B: ObjectBackend>(&self, backend: &B) -> bool {
        {
            let state = self.state.lock().unwrap();
            if !state.connected && Instant::now() < state.next_probe {
                return false;
            }
        }
        match backend.bucket_accessible(&self.bucket).await {
            Ok(_) => {
                self.mark_online();
                true
            }
            Err(err) => {
                self.mark_offline(&err);
                false
            }
        }
    }

    fn mark_online(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            info!("health: cloud endpoint reachable again");
            state.token = CancellationToken::new();
        }
        state.connected = true;
        state.backoff = PROBE_INTERVAL_MIN;
        state.next_probe = Instant::now();
    }

    fn mark_offline(&self, err: &StorageError) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            warn!("health: cloud endpoint unreachable, cancelling in-flight requests: {err}");
            state.token.cancel();
        }
        state.connected = false;
        state.next_probe = Instant::now() + state.backoff;
        state.backoff = (state.backoff * 2).min(PROBE_INTERVAL_MAX);
    }
}
