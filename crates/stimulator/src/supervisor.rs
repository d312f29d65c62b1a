//! Keeps one device session alive across transient faults.
//!
//! The supervisor owns the session slot behind a single mutex, which is also
//! what makes every `transact` caller mutually exclusive — the one-in-flight
//! protocol invariant can never be violated by concurrent callers. Two live
//! sessions never exist: a replacement is constructed only after the old one
//! is discarded.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use signal_types::StatusEvent;

use crate::error::ProtocolError;
use crate::protocol::CommandSet;
use crate::session::{DeviceSession, LinkSettings};

/// Reconnect and health-check tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Interval between liveness probes while Ready.
    pub health_interval: Duration,
    /// First reconnect delay after a fault.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before auto-retry halts.
    pub max_failures: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(2),
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_failures: 8,
        }
    }
}

impl SupervisorSettings {
    /// Delay before reconnect attempt number `failures`, doubling from the
    /// base and never exceeding the ceiling.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let ms = (self.base_backoff.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.max_backoff.as_millis() as u64))
    }
}

/// Externally visible supervisor phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorPhase {
    Connecting,
    Ready,
    BackingOff,
    /// Auto-retry exhausted; waiting for an operator reset.
    Halted,
    ShutDown,
}

/// Builds a fresh session per connect attempt.
pub type SessionFactory = Box<dyn FnMut() -> Result<DeviceSession, ProtocolError> + Send>;

enum Ctrl {
    Reset,
    Shutdown,
}

/// The connection robot: periodic health checks, exponential-backoff
/// reconnects, and a hard stop after too many consecutive failures.
pub struct ConnectionSupervisor {
    ctrl_tx: flume::Sender<Ctrl>,
    status_rx: flume::Receiver<StatusEvent>,
    session: Arc<Mutex<Option<DeviceSession>>>,
    phase: Arc<Mutex<SupervisorPhase>>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Spawns the supervisor thread with a custom session factory.
    pub fn spawn(settings: SupervisorSettings, factory: SessionFactory) -> Self {
        let (ctrl_tx, ctrl_rx) = flume::unbounded();
        let (status_tx, status_rx) = flume::unbounded();
        let session = Arc::new(Mutex::new(None));
        let phase = Arc::new(Mutex::new(SupervisorPhase::Connecting));

        let thread_session = session.clone();
        let thread_phase = phase.clone();
        let thread = thread::Builder::new()
            .name("stim-supervisor".to_string())
            .spawn(move || {
                run(
                    settings,
                    factory,
                    thread_session,
                    thread_phase,
                    ctrl_rx,
                    status_tx,
                );
            })
            .expect("spawn supervisor thread");

        Self {
            ctrl_tx,
            status_rx,
            session,
            phase,
            thread: Some(thread),
        }
    }

    /// Convenience constructor for a real serial link.
    pub fn from_link(
        settings: SupervisorSettings,
        link: LinkSettings,
        set: CommandSet,
    ) -> Self {
        Self::spawn(
            settings,
            Box::new(move || DeviceSession::open(&link, set.clone())),
        )
    }

    /// The shared session slot. Locking it is how the pipeline wrapper (or
    /// any other caller) serializes its exchanges with the health checker.
    pub fn session(&self) -> Arc<Mutex<Option<DeviceSession>>> {
        self.session.clone()
    }

    pub fn phase(&self) -> SupervisorPhase {
        *self.phase.lock().unwrap()
    }

    /// The one-way observation stream of supervisor events.
    pub fn events(&self) -> flume::Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    /// Operator-triggered reset: clears the failure budget and, if halted,
    /// resumes connect attempts.
    pub fn reset(&self) {
        let _ = self.ctrl_tx.send(Ctrl::Reset);
    }

    /// Stops the loop and drops any live session.
    pub fn shutdown(mut self) {
        let _ = self.ctrl_tx.send(Ctrl::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("supervisor thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let _ = self.ctrl_tx.send(Ctrl::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn set_phase(slot: &Arc<Mutex<SupervisorPhase>>, phase: SupervisorPhase) {
    *slot.lock().unwrap() = phase;
}

fn run(
    settings: SupervisorSettings,
    mut factory: SessionFactory,
    session: Arc<Mutex<Option<DeviceSession>>>,
    phase: Arc<Mutex<SupervisorPhase>>,
    ctrl_rx: flume::Receiver<Ctrl>,
    status_tx: flume::Sender<StatusEvent>,
) {
    info!("connection supervisor started");
    let mut failures: u32 = 0;
    loop {
        let connected = session.lock().unwrap().is_some();
        if connected {
            match ctrl_rx.recv_timeout(settings.health_interval) {
                Ok(Ctrl::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => break,
                Ok(Ctrl::Reset) => {
                    // A reset while healthy forces a clean reconnect.
                    session.lock().unwrap().take();
                    failures = 0;
                    let _ = status_tx.send(StatusEvent::SupervisorReset);
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    let mut guard = session.lock().unwrap();
                    if let Some(live) = guard.as_mut() {
                        if let Err(e) = live.ping() {
                            warn!("health check failed: {}", e);
                            failures += 1;
                            guard.take();
                            let _ = status_tx.send(StatusEvent::LinkDown {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            continue;
        }

        if failures >= settings.max_failures {
            set_phase(&phase, SupervisorPhase::Halted);
            let _ = status_tx.send(StatusEvent::HardFault { failures });
            warn!(
                "supervisor halted after {} consecutive failures; waiting for reset",
                failures
            );
            match ctrl_rx.recv() {
                Ok(Ctrl::Reset) => {
                    failures = 0;
                    let _ = status_tx.send(StatusEvent::SupervisorReset);
                    continue;
                }
                Ok(Ctrl::Shutdown) | Err(_) => break,
            }
        }

        if failures > 0 {
            let delay = settings.backoff_delay(failures);
            set_phase(&phase, SupervisorPhase::BackingOff);
            let _ = status_tx.send(StatusEvent::ReconnectScheduled { failures, delay });
            match ctrl_rx.recv_timeout(delay) {
                Ok(Ctrl::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => break,
                Ok(Ctrl::Reset) => {
                    failures = 0;
                    let _ = status_tx.send(StatusEvent::SupervisorReset);
                    continue;
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
            }
        }

        set_phase(&phase, SupervisorPhase::Connecting);
        match factory() {
            Ok(live) => {
                let _ = status_tx.send(StatusEvent::LinkUp {
                    session_id: live.id().to_string(),
                    identity: String::from_utf8_lossy(live.identity()).into_owned(),
                });
                *session.lock().unwrap() = Some(live);
                // Only a Ready transition clears the failure budget.
                failures = 0;
                set_phase(&phase, SupervisorPhase::Ready);
            }
            Err(e) => {
                warn!("connect attempt failed: {}", e);
                failures += 1;
                let _ = status_tx.send(StatusEvent::LinkDown {
                    reason: e.to_string(),
                });
            }
        }
    }

    session.lock().unwrap().take();
    set_phase(&phase, SupervisorPhase::ShutDown);
    info!("connection supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let settings = SupervisorSettings {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(settings.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(settings.backoff_delay(8), Duration::from_millis(10_000));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_ceiling(failures in 0u32..10_000) {
            let settings = SupervisorSettings {
                base_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(30),
                ..Default::default()
            };
            prop_assert!(settings.backoff_delay(failures) <= settings.max_backoff);
        }
    }
}
