//! The relay core: translates upstream SSE lifecycle callbacks into
//! normalized downstream frames with exactly-once termination.
//!
//! Contract:
//! - 0..n data frames, at most one error frame, exactly one `[DONE]` frame.
//! - After the terminal `complete()` call, the emitter is never invoked
//!   again, even if further upstream callbacks arrive or terminal callbacks
//!   race on different threads.
//! - The relay owns no thread; every method runs synchronously on the
//!   thread the upstream source delivers callbacks from.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::config::RelayCfg;
use crate::emitter::DownstreamEmitter;
use crate::error::{CoreResult, RelayError};
use crate::event::{DONE_SENTINEL, OutboundEvent, RelayMessage};

/// Handle to the upstream event source, callable from within `on_failure`
/// to stop further delivery.
pub trait UpstreamSource: Send + Sync {
    fn cancel(&self);
}

/// Best-effort access to a failed upstream response. Reading the body may
/// itself fail; callers must tolerate that.
pub trait FailureResponse {
    fn status(&self) -> u16;
    fn read_body(&mut self) -> CoreResult<String>;
}

/// The four-callback surface an upstream SSE integration drives.
///
/// `on_event` and `on_closed` propagate downstream delivery faults to the
/// caller; `on_failure` never raises, since it may run on a callback thread
/// where an uncaught fault would be swallowed or crash the driver.
pub trait UpstreamListener: Send + Sync {
    fn on_open(&self);
    fn on_event(&self, id: Option<&str>, event: Option<&str>, data: &str) -> CoreResult<()>;
    fn on_closed(&self) -> CoreResult<()>;
    fn on_failure(
        &self,
        source: &dyn UpstreamSource,
        error: &RelayError,
        response: Option<&mut dyn FailureResponse>,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Open,
    Terminated,
}

/// Single-use bridge from one upstream stream to one downstream emitter.
/// Once terminated it is discarded; a new conversation needs a new relay.
pub struct StreamRelay {
    emitter: std::sync::Arc<dyn DownstreamEmitter>,
    state: Mutex<RelayState>,
    reconnect_ms: u64,
    connect_help: String,
}

impl StreamRelay {
    pub fn new(emitter: std::sync::Arc<dyn DownstreamEmitter>, cfg: &RelayCfg) -> Self {
        Self {
            emitter,
            state: Mutex::new(RelayState::Open),
            reconnect_ms: cfg.reconnect_ms,
            connect_help: cfg.connect_help.clone(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.lock_state() == RelayState::Terminated
    }

    // All four entry points check and mutate state under this lock; a
    // poisoned lock only means another callback panicked mid-emission, and
    // the state value itself is still coherent.
    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminal transition for the sentinel and closed paths: one sentinel
    /// frame, then `complete()`. No-op when already terminated.
    fn finish(&self) -> CoreResult<()> {
        let mut state = self.lock_state();
        if *state == RelayState::Terminated {
            debug!("stream already terminated, skipping sentinel");
            return Ok(());
        }
        *state = RelayState::Terminated;
        self.emitter.send(OutboundEvent::sentinel(self.reconnect_ms))?;
        self.emitter.complete()
    }

    /// Terminal transition for the failure paths: one error frame, then the
    /// sentinel, then `complete()`. No-op when already terminated.
    fn fail(&self, message: String) -> CoreResult<()> {
        let mut state = self.lock_state();
        if *state == RelayState::Terminated {
            debug!("stream already terminated, dropping error report: {message}");
            return Ok(());
        }
        *state = RelayState::Terminated;
        self.emitter.send(OutboundEvent::error(RelayMessage::new(message)))?;
        self.emitter.send(OutboundEvent::sentinel(self.reconnect_ms))?;
        self.emitter.complete()
    }
}

impl UpstreamListener for StreamRelay {
    fn on_open(&self) {
        info!("upstream SSE connection established");
    }

    fn on_event(&self, id: Option<&str>, event: Option<&str>, data: &str) -> CoreResult<()> {
        debug!(id, event, "upstream event: {data}");
        if data == DONE_SENTINEL {
            return self.finish();
        }
        if data.is_empty() {
            // Avoid pushing empty content frames downstream.
            return Ok(());
        }
        let state = self.lock_state();
        if *state == RelayState::Terminated {
            warn!("dropping upstream event after termination");
            return Ok(());
        }
        self.emitter.send(OutboundEvent::data(
            id.unwrap_or_default(),
            RelayMessage::new(data),
            self.reconnect_ms,
        ))
    }

    fn on_closed(&self) -> CoreResult<()> {
        info!("upstream SSE connection closed");
        // The upstream may close without ever sending [DONE]; downstream
        // must still observe the sentinel exactly once.
        self.finish()
    }

    fn on_failure(
        &self,
        source: &dyn UpstreamSource,
        error: &RelayError,
        response: Option<&mut dyn FailureResponse>,
    ) {
        let outcome = match response {
            None => {
                let message = format!("{error}, {}", self.connect_help);
                self.fail(message)
            }
            Some(resp) => {
                let status = resp.status();
                let body = match resp.read_body() {
                    Ok(body) => {
                        error!(status, body = %body, "upstream stream failed: {error}");
                        Some(body)
                    }
                    Err(read_err) => {
                        error!(
                            status,
                            "upstream stream failed, response body unreadable ({read_err}): {error}"
                        );
                        None
                    }
                };
                source.cancel();
                let detail = body.unwrap_or_else(|| "response body unavailable".to_string());
                self.fail(format!("upstream request failed with status {status}: {detail}"))
            }
        };
        if let Err(send_err) = outcome {
            // Failure handling must complete without raising; the client is
            // already gone if we land here.
            error!("could not deliver failure report downstream: {send_err}");
        }
    }
}
