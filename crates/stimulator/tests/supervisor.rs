//! Connection supervisor behavior: backoff, hard fault, operator reset,
//! and health-check driven reconnects.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use signal_types::StatusEvent;
use stimulator::mock::{emulator, ScriptedTransport};
use stimulator::{
    CommandSet, ConnectionSupervisor, DeviceSession, LinkSettings, SerialPortController,
    SupervisorPhase, SupervisorSettings,
};

fn fast_link() -> LinkSettings {
    LinkSettings {
        path: "mock".to_string(),
        baud: 115_200,
        response_timeout: Duration::from_millis(5),
        handshake_retries: 1,
    }
}

fn fast_settings(max_failures: u32) -> SupervisorSettings {
    SupervisorSettings {
        health_interval: Duration::from_millis(10),
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        max_failures,
    }
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_three_handshake_failures_halt_until_manual_reset() {
    let _ = tracing_subscriber::fmt::try_init();
    let device_reachable = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicU32::new(0));

    let reachable = device_reachable.clone();
    let attempts_made = attempts.clone();
    let supervisor = ConnectionSupervisor::spawn(
        fast_settings(3),
        Box::new(move || {
            attempts_made.fetch_add(1, Ordering::SeqCst);
            let transport: Box<dyn stimulator::SerialTransport> =
                if reachable.load(Ordering::SeqCst) {
                    Box::new(emulator(&CommandSet::default(), b"STIM-A1"))
                } else {
                    Box::new(ScriptedTransport::silent())
                };
            DeviceSession::establish(
                SerialPortController::from_transport(transport),
                &fast_link(),
                CommandSet::default(),
            )
        }),
    );

    assert!(wait_for(
        || supervisor.phase() == SupervisorPhase::Halted,
        Duration::from_secs(5)
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Halted means halted: no further attempts without a reset.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let events: Vec<StatusEvent> = supervisor.events().drain().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::HardFault { failures: 3 })));

    // Operator reset resumes connecting; the device is reachable now.
    device_reachable.store(true, Ordering::SeqCst);
    supervisor.reset();
    assert!(wait_for(
        || supervisor.phase() == SupervisorPhase::Ready,
        Duration::from_secs(5)
    ));
    assert!(supervisor.session().lock().unwrap().is_some());
    supervisor.shutdown();
}

#[test]
fn test_backoff_delays_never_exceed_ceiling() {
    let settings = fast_settings(6);
    let max_backoff = settings.max_backoff;
    let supervisor = ConnectionSupervisor::spawn(
        settings,
        Box::new(move || {
            DeviceSession::establish(
                SerialPortController::from_transport(Box::new(ScriptedTransport::silent())),
                &fast_link(),
                CommandSet::default(),
            )
        }),
    );

    assert!(wait_for(
        || supervisor.phase() == SupervisorPhase::Halted,
        Duration::from_secs(5)
    ));

    let delays: Vec<Duration> = supervisor
        .events()
        .drain()
        .filter_map(|e| match e {
            StatusEvent::ReconnectScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert!(!delays.is_empty());
    assert!(delays.iter().all(|d| *d <= max_backoff));
    // Delays grow until the ceiling clips them.
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    supervisor.shutdown();
}

#[test]
fn test_health_check_failure_triggers_reconnect_with_fresh_session() {
    // First session answers only the handshake, then goes dead; every later
    // session is a fully working emulator.
    let sessions_built = Arc::new(AtomicU32::new(0));
    let built = sessions_built.clone();
    let supervisor = ConnectionSupervisor::spawn(
        fast_settings(5),
        Box::new(move || {
            let n = built.fetch_add(1, Ordering::SeqCst);
            let transport: Box<dyn stimulator::SerialTransport> = if n == 0 {
                let mut t = ScriptedTransport::scripted();
                t.push_reply(&[CommandSet::default().identify.opcode, 0, 0]);
                Box::new(t)
            } else {
                Box::new(emulator(&CommandSet::default(), b"STIM-A1"))
            };
            DeviceSession::establish(
                SerialPortController::from_transport(transport),
                &fast_link(),
                CommandSet::default(),
            )
        }),
    );

    // The first session dies on its first health check; the supervisor must
    // discard it and come back Ready on a fresh one.
    assert!(wait_for(
        || sessions_built.load(Ordering::SeqCst) >= 2
            && supervisor.phase() == SupervisorPhase::Ready,
        Duration::from_secs(5)
    ));

    let events: Vec<StatusEvent> = supervisor.events().drain().collect();
    let ups = events
        .iter()
        .filter(|e| matches!(e, StatusEvent::LinkUp { .. }))
        .count();
    let downs = events
        .iter()
        .filter(|e| matches!(e, StatusEvent::LinkDown { .. }))
        .count();
    assert!(ups >= 2);
    assert!(downs >= 1);

    // No two live sessions: the slot holds exactly the replacement.
    let ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::LinkUp { session_id, .. } => Some(session_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), ups);
    let guard = supervisor.session();
    let live_id = guard.lock().unwrap().as_ref().map(|s| s.id().to_string());
    assert_eq!(live_id.as_deref(), ids.last().map(|s| s.as_str()));
    supervisor.shutdown();
}
