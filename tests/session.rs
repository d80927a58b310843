//! End-to-end session tests against fake engines written as shell scripts.
#![cfg(unix)]

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use puffvpn_lib::classifier::FaultKind;
use puffvpn_lib::settings::engine_file_name;
use puffvpn_lib::system_proxy::SystemProxyController;
use puffvpn_lib::{
    log_channel, AppPaths, Error, LogEvent, LogKind, Mode, Session, SessionState, Settings,
};
use tempfile::TempDir;

const LINK: &str =
    "vless://11111111-2222-3333-4444-555555555555@example.com:443?security=tls&sni=cdn.example.com";

/// Scripts are written and then executed; a concurrent fork from another test could
/// inherit the write handle and make exec fail with ETXTBSY.
static ENGINE_LOCK: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct RecordingController {
    enabled: AtomicBool,
    server: Mutex<Option<String>>,
}

impl RecordingController {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl SystemProxyController for RecordingController {
    fn enable(&self, server: &str, _bypass: &str) -> io::Result<()> {
        *self.server.lock().unwrap() = Some(server.to_string());
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    session: Arc<Session>,
    events: Receiver<LogEvent>,
    controller: Arc<RecordingController>,
    dir: TempDir,
    _guard: MutexGuard<'static, ()>,
}

impl Harness {
    fn new(grace_ms: u64) -> Self {
        let guard = ENGINE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        Self::with_data_dir(guard, dir, &data_dir, grace_ms)
    }

    fn with_data_dir(
        guard: MutexGuard<'static, ()>,
        dir: TempDir,
        data_dir: &Path,
        grace_ms: u64,
    ) -> Self {
        let engine_dir = dir.path().join("engines");
        fs::create_dir_all(&engine_dir).unwrap();
        let settings = Settings {
            grace_period_ms: grace_ms,
            ..Settings::default()
        };
        let (sink, events) = log_channel(256);
        let controller = Arc::new(RecordingController::default());
        let session = Session::new(
            AppPaths::new(data_dir, &engine_dir),
            settings,
            controller.clone(),
            Arc::new(sink),
        );
        Self {
            session: Arc::new(session),
            events,
            controller,
            dir,
            _guard: guard,
        }
    }

    fn install_engine(&self, mode: Mode, body: &str) {
        let path = self.dir.path().join("engines").join(engine_file_name(mode));
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn wait_for_event(&self, wanted: impl Fn(&LogEvent) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.events.recv_timeout(left) {
                Ok(event) if wanted(&event) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    }
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn stderr_deadline_exceeded_fails_with_timeout_message() {
    let harness = Harness::new(5_000);
    harness.install_engine(
        Mode::Proxy,
        "echo 'failed: context deadline exceeded' >&2\nexit 1",
    );

    let err = harness.session.connect(LINK, Mode::Proxy).unwrap_err();
    match err {
        Error::EngineRuntime { kind, message } => {
            assert_eq!(kind, FaultKind::Timeout);
            assert_eq!(message, "Connection timed out - the server is not responding");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let status = harness.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.connected);
    assert_eq!(status.last_exit, Some(1));
    assert!(status
        .last_error
        .unwrap()
        .starts_with("ENGINE_RUNTIME_ERROR|"));
    assert!(!harness.controller.enabled());
}

#[test]
fn started_marker_confirms_before_grace_period() {
    let harness = Harness::new(10_000);
    harness.install_engine(
        Mode::Tunnel,
        "[ \"$1\" = run ] && [ \"$2\" = -c ] && [ -f \"$3\" ] || exit 9\necho 'sing-box started'\nexec sleep 30",
    );

    let began = Instant::now();
    harness.session.connect(LINK, Mode::Tunnel).unwrap();
    assert!(began.elapsed() < Duration::from_secs(5));

    let status = harness.session.status();
    assert!(status.connected);
    assert_eq!(status.state, SessionState::Confirmed);
    assert_eq!(status.mode, Some(Mode::Tunnel));
    assert!(status.pid.is_some());
    assert!(status
        .config_path
        .unwrap()
        .ends_with("singbox-config.json"));
    assert!(harness.wait_for_event(|event| event.kind == LogKind::Success));
    assert!(!harness.controller.enabled());

    harness.session.disconnect().unwrap();
    let status = harness.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.connected);
    assert!(status.pid.is_none());
    assert!(harness.wait_for_event(|event| event.message == "VPN stopped"));
}

#[test]
fn clean_exit_before_confirmation_still_fails() {
    let harness = Harness::new(5_000);
    harness.install_engine(Mode::Proxy, "exit 0");

    let err = harness.session.connect(LINK, Mode::Proxy).unwrap_err();
    assert!(matches!(
        err,
        Error::EngineRuntime {
            kind: FaultKind::Unknown,
            ..
        }
    ));
    let status = harness.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.last_exit, Some(0));
}

#[test]
fn silent_engine_is_confirmed_by_grace_timer_and_enables_proxy() {
    let harness = Harness::new(300);
    harness.install_engine(Mode::Proxy, "exec sleep 30");

    harness.session.connect(LINK, Mode::Proxy).unwrap();
    assert!(harness.session.status().connected);
    assert!(harness.wait_for_event(|event| event.message == "Waiting for connection..."));
    assert!(harness.controller.enabled());
    assert_eq!(
        harness.controller.server.lock().unwrap().as_deref(),
        Some("127.0.0.1:10809")
    );
    assert!(harness.dir.path().join("data").join("config.json").is_file());

    harness.session.disconnect().unwrap();
    assert!(!harness.controller.enabled());
    assert_eq!(harness.session.status().state, SessionState::Idle);
}

#[test]
fn disconnect_during_starting_cancels_connect() {
    let harness = Harness::new(10_000);
    harness.install_engine(Mode::Proxy, "exec sleep 30");

    let session = harness.session.clone();
    let pending = thread::spawn(move || session.connect(LINK, Mode::Proxy));

    assert!(wait_until(|| harness.session.status().state == SessionState::Starting));
    harness.session.disconnect().unwrap();

    let result = pending.join().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(harness.session.status().state, SessionState::Idle);
    assert!(!harness.controller.enabled());
}

#[test]
fn second_connect_while_active_is_rejected() {
    let harness = Harness::new(10_000);
    harness.install_engine(Mode::Proxy, "echo 'xray started'\nexec sleep 30");

    harness.session.connect(LINK, Mode::Proxy).unwrap();
    let err = harness.session.connect(LINK, Mode::Tunnel).unwrap_err();
    assert!(matches!(err, Error::SessionActive));
    assert_eq!(harness.session.status().mode, Some(Mode::Proxy));

    harness.session.disconnect().unwrap();
}

#[test]
fn engine_death_after_confirmation_warns_and_clears_proxy() {
    let harness = Harness::new(10_000);
    harness.install_engine(Mode::Proxy, "echo 'xray started'\nsleep 1\nexit 3");

    harness.session.connect(LINK, Mode::Proxy).unwrap();
    assert!(harness.wait_for_event(|event| {
        event.kind == LogKind::Warning && event.message == "VPN process terminated unexpectedly"
    }));
    assert!(wait_until(|| !harness.controller.enabled()));

    let status = harness.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.last_exit, Some(3));
    assert!(status
        .last_error
        .unwrap()
        .starts_with("UNEXPECTED_TERMINATION|"));
}

#[test]
fn tunnel_permission_failure_requires_elevation() {
    let harness = Harness::new(5_000);
    harness.install_engine(
        Mode::Tunnel,
        "echo 'open /dev/net/tun: operation not permitted: permission denied' >&2\nexit 1",
    );

    let err = harness.session.connect(LINK, Mode::Tunnel).unwrap_err();
    assert!(matches!(err, Error::PrivilegeRequired(_)));
    assert!(harness
        .session
        .status()
        .last_error
        .unwrap()
        .starts_with("PRIVILEGE_REQUIRED|"));
}

#[test]
fn output_lines_are_routed_by_stream() {
    let harness = Harness::new(10_000);
    harness.install_engine(
        Mode::Proxy,
        "echo 'core: loading config'\necho 'proxy: failed to dial: connection refused'\necho 'warning: deprecated field' >&2\nsleep 0.2\necho 'xray started'\nexec sleep 30",
    );

    harness.session.connect(LINK, Mode::Proxy).unwrap();
    let mut seen = Vec::new();
    while let Ok(event) = harness.events.recv_timeout(Duration::from_millis(500)) {
        seen.push(event);
    }
    assert!(seen.contains(&LogEvent::new(LogKind::Info, "core: loading config")));
    assert!(seen.contains(&LogEvent::new(LogKind::Warning, "warning: deprecated field")));
    assert!(seen.contains(&LogEvent::new(
        LogKind::Error,
        "Server unreachable - check the address and port"
    )));
    assert!(seen.contains(&LogEvent::new(LogKind::Success, "VPN started (PROXY)")));

    harness.session.disconnect().unwrap();
}

#[test]
fn missing_engine_is_reported() {
    let harness = Harness::new(5_000);

    let err = harness.session.connect(LINK, Mode::Tunnel).unwrap_err();
    assert!(matches!(err, Error::EngineMissing(_)));
    assert!(harness
        .dir
        .path()
        .join("data")
        .join("singbox-config.json")
        .is_file());
    assert_eq!(harness.session.status().state, SessionState::Idle);
}

#[test]
fn unwritable_config_directory_fails_before_spawn() {
    let guard = ENGINE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "").unwrap();
    let harness = Harness::with_data_dir(guard, dir, &blocker.join("data"), 5_000);
    harness.install_engine(Mode::Proxy, "echo started >> \"$0.ran\"\nexec sleep 30");

    let err = harness.session.connect(LINK, Mode::Proxy).unwrap_err();
    assert!(matches!(err, Error::ConfigWrite { .. }));
    assert!(!harness
        .dir
        .path()
        .join("engines")
        .join(format!("{}.ran", engine_file_name(Mode::Proxy)))
        .exists());
}

#[test]
fn exit_is_reported_while_a_helper_holds_the_pipes() {
    let harness = Harness::new(3_000);
    harness.install_engine(
        Mode::Tunnel,
        "sleep 6 &\necho 'fatal: permission denied' >&2\nexit 1",
    );

    let began = Instant::now();
    let err = harness.session.connect(LINK, Mode::Tunnel).unwrap_err();
    assert!(matches!(err, Error::PrivilegeRequired(_)));
    assert!(began.elapsed() < Duration::from_secs(3));

    let status = harness.session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert!(!status.connected);
    assert_eq!(status.last_exit, Some(1));
}

#[test]
fn repeated_started_lines_report_success_once() {
    let harness = Harness::new(10_000);
    harness.install_engine(
        Mode::Tunnel,
        "echo 'inbound/tun[tun-in]: started at tun0'\necho 'sing-box started'\nexec sleep 30",
    );

    harness.session.connect(LINK, Mode::Tunnel).unwrap();
    let mut seen = Vec::new();
    while let Ok(event) = harness.events.recv_timeout(Duration::from_millis(500)) {
        seen.push(event);
    }
    let successes = seen
        .iter()
        .filter(|event| event.kind == LogKind::Success)
        .count();
    assert_eq!(successes, 1);
    assert!(seen.contains(&LogEvent::new(LogKind::Info, "sing-box started")));

    harness.session.disconnect().unwrap();
}
