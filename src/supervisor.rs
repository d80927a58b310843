//! Engine process supervision.
//!
//! `start` writes the config, spawns the engine and blocks until the attempt is
//! confirmed or fails. Each output stream is read on its own thread into a bounded
//! channel; a single dispatcher thread consumes both channels, the exit notification
//! and the one-shot grace timer, and is the only place the attempt advances past
//! `Starting`. Every attempt carries a watch token; `stop` bumps it so stale threads
//! go quiet.

use crossbeam_channel::{after, bounded, never, select, Receiver, RecvError, Sender};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[cfg(target_os = "windows")]
use std::os::windows::io::AsRawHandle;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
#[cfg(target_os = "windows")]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

use crate::classifier::{classify, strip_ansi, FaultKind};
use crate::credential::Mode;
use crate::error::{err, Error, ErrorKind, Result};
use crate::logging::{report, LogKind, LogSink};
use crate::settings::AppPaths;
use crate::translator::ConfigDocument;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const STARTED_MARKER: &str = "started";
const LINE_CHANNEL_CAPACITY: usize = 64;
const EXIT_POLL: Duration = Duration::from_millis(100);
/// How long output still in flight is collected after the engine exits.
const EXIT_DRAIN: Duration = Duration::from_millis(500);
const PASSTHROUGH_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Confirmed,
    Stopping,
}

#[derive(Default)]
struct EngineState {
    phase: SessionState,
    child: Option<Child>,
    mode: Option<Mode>,
    last_exit: Option<i32>,
    last_error: Option<String>,
    config_path: Option<PathBuf>,
    watch_token: u64,
    #[cfg(target_os = "windows")]
    job: Option<JobHandle>,
}

type SharedState = Arc<Mutex<EngineState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connected: bool,
    pub state: SessionState,
    pub mode: Option<Mode>,
    pub pid: Option<u32>,
    pub last_exit: Option<i32>,
    pub last_error: Option<String>,
    pub config_path: Option<String>,
}

/// Identifies one confirmed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Runs once if a confirmed engine exits without being asked to.
pub type ExitHook = Box<dyn FnOnce() + Send>;

#[cfg(target_os = "windows")]
#[derive(Debug)]
struct JobHandle(isize);

#[cfg(target_os = "windows")]
impl Drop for JobHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Job object that kills the engine when the application goes away.
#[cfg(target_os = "windows")]
fn create_job_object() -> std::io::Result<JobHandle> {
    let handle = unsafe { CreateJobObjectW(std::ptr::null_mut(), std::ptr::null()) };
    if handle == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
    info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
    let result = unsafe {
        SetInformationJobObject(
            handle,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
    };
    if result == 0 {
        let error = std::io::Error::last_os_error();
        unsafe {
            CloseHandle(handle);
        }
        return Err(error);
    }
    Ok(JobHandle(handle))
}

#[cfg(target_os = "windows")]
fn attach_to_job(state: &mut EngineState, child: &Child) {
    if state.job.is_none() {
        match create_job_object() {
            Ok(job) => state.job = Some(job),
            Err(e) => tracing::warn!(error = %e, "job object unavailable"),
        }
    }
    if let Some(job) = state.job.as_ref() {
        let _ = unsafe { AssignProcessToJobObject(job.0, child.as_raw_handle() as isize) };
    }
}

pub struct Supervisor {
    state: SharedState,
    paths: AppPaths,
    grace: Duration,
    sink: Arc<dyn LogSink>,
}

impl Supervisor {
    pub fn new(paths: AppPaths, grace: Duration, sink: Arc<dyn LogSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            paths,
            grace,
            sink,
        }
    }

    /// Launches the engine for `document` and waits for the attempt to settle.
    pub fn start(&self, document: &ConfigDocument, exit_hook: ExitHook) -> Result<Ticket> {
        let mode = document.mode();
        let label = mode.as_str().to_uppercase();

        let mut guard = lock(&self.state);
        if guard.phase != SessionState::Idle {
            return Err(Error::SessionActive);
        }

        let config_path = match self.write_config(document) {
            Ok(path) => path,
            Err(error) => return Err(self.fail(guard, error)),
        };
        let executable = match self.resolve_engine(mode) {
            Ok(path) => path,
            Err(error) => return Err(self.fail(guard, error)),
        };

        report(&*self.sink, LogKind::Info, format!("Starting {label} mode..."));
        tracing::debug!(engine = %executable.display(), config = %config_path.display(), "spawning engine");
        let mut child = match spawn_engine(&executable, &config_path) {
            Ok(child) => child,
            Err(e) => return Err(self.fail(guard, Error::SpawnFailure(e))),
        };

        #[cfg(target_os = "windows")]
        attach_to_job(&mut guard, &child);

        let stdout = spawn_line_reader(child.stdout.take());
        let stderr = spawn_line_reader(child.stderr.take());

        guard.watch_token = guard.watch_token.wrapping_add(1);
        let token = guard.watch_token;
        guard.phase = SessionState::Starting;
        guard.child = Some(child);
        guard.mode = Some(mode);
        guard.config_path = Some(config_path);
        guard.last_exit = None;
        guard.last_error = None;

        let exited = spawn_exit_watcher(self.state.clone(), token);
        let (outcome_tx, outcome_rx) = bounded(1);
        let dispatcher = Dispatcher {
            state: self.state.clone(),
            token,
            mode,
            label,
            sink: self.sink.clone(),
            outcome: Some(outcome_tx),
            exit_hook: Some(exit_hook),
            stderr_text: String::new(),
            marker_seen: false,
            settled: false,
        };
        let grace = self.grace;
        thread::spawn(move || dispatcher.run(stdout, stderr, exited, grace));
        drop(guard);

        match outcome_rx.recv() {
            Ok(Ok(())) => Ok(Ticket(token)),
            Ok(Err(error)) => Err(error),
            Err(RecvError) => Err(Error::Cancelled),
        }
    }

    /// Kills the engine if there is one. Returns whether anything was running.
    pub fn stop(&self) -> bool {
        let child = {
            let mut guard = lock(&self.state);
            let Some(child) = guard.child.take() else {
                return false;
            };
            guard.phase = SessionState::Stopping;
            guard.watch_token = guard.watch_token.wrapping_add(1);
            child
        };

        terminate(child);
        lock(&self.state).phase = SessionState::Idle;
        report(&*self.sink, LogKind::Info, "VPN stopped");
        true
    }

    pub fn status(&self) -> SessionStatus {
        let guard = lock(&self.state);
        SessionStatus {
            connected: guard.phase == SessionState::Confirmed,
            state: guard.phase,
            mode: guard.mode,
            pid: guard.child.as_ref().map(Child::id),
            last_exit: guard.last_exit,
            last_error: guard.last_error.clone(),
            config_path: guard
                .config_path
                .as_ref()
                .map(|path| path.display().to_string()),
        }
    }

    /// True while the attempt identified by `ticket` is still confirmed.
    pub fn is_confirmed(&self, ticket: Ticket) -> bool {
        let guard = lock(&self.state);
        guard.watch_token == ticket.0 && guard.phase == SessionState::Confirmed
    }

    fn write_config(&self, document: &ConfigDocument) -> Result<PathBuf> {
        fs::create_dir_all(&self.paths.data_dir).map_err(|source| Error::ConfigWrite {
            path: self.paths.data_dir.clone(),
            source,
        })?;
        let path = self.paths.config_path(document.mode());
        document.write_to(&path)?;
        Ok(path)
    }

    fn resolve_engine(&self, mode: Mode) -> Result<PathBuf> {
        let candidates = self.paths.engine_candidates(mode);
        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| Error::EngineMissing(candidates[0].clone()))
    }

    /// Records a failure that happened before the engine was running.
    fn fail(&self, mut guard: MutexGuard<'_, EngineState>, error: Error) -> Error {
        guard.last_error = Some(err(error.kind(), error.to_string()));
        drop(guard);
        report(&*self.sink, LogKind::Error, error.to_string());
        error
    }
}

fn spawn_engine(executable: &Path, config_path: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(executable);
    cmd.arg("run").arg("-c").arg(config_path);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(target_os = "windows")]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd.spawn()
}

fn terminate(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_line_reader<R>(stream: Option<R>) -> Receiver<String>
where
    R: Read + Send + 'static,
{
    let Some(stream) = stream else {
        return never();
    };
    let (tx, rx) = bounded(LINE_CHANNEL_CAPACITY);
    thread::spawn(move || forward_lines(stream, tx));
    rx
}

fn forward_lines<R: Read>(stream: R, tx: Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line.to_string()).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "engine output closed");
                return;
            }
        }
    }
}

/// Polls the child and reports its exit code as soon as it is reaped. The pipes may
/// outlive the child (an orphaned helper can hold them), so readers are not awaited.
fn spawn_exit_watcher(state: SharedState, token: u64) -> Receiver<Option<i32>> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let code = loop {
            thread::sleep(EXIT_POLL);
            let mut guard = lock(&state);
            if guard.watch_token != token {
                return;
            }
            let Some(child) = guard.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll engine");
                    break None;
                }
            }
        };
        let _ = tx.send(code);
    });
    rx
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Event {
    Line(Stream, Option<String>),
    GraceElapsed,
    Exited(std::result::Result<Option<i32>, RecvError>),
}

struct Dispatcher {
    state: SharedState,
    token: u64,
    mode: Mode,
    label: String,
    sink: Arc<dyn LogSink>,
    outcome: Option<Sender<Result<()>>>,
    exit_hook: Option<ExitHook>,
    stderr_text: String,
    marker_seen: bool,
    /// Set once the attempt has left `Starting` through confirmation.
    settled: bool,
}

impl Dispatcher {
    fn run(
        mut self,
        mut stdout: Receiver<String>,
        mut stderr: Receiver<String>,
        exited: Receiver<Option<i32>>,
        grace: Duration,
    ) {
        let mut timer = after(grace);
        loop {
            let event = select! {
                recv(stdout) -> line => Event::Line(Stream::Stdout, line.ok()),
                recv(stderr) -> line => Event::Line(Stream::Stderr, line.ok()),
                recv(timer) -> _ => Event::GraceElapsed,
                recv(exited) -> code => Event::Exited(code),
            };

            match event {
                Event::Line(stream, Some(line)) => {
                    if self.is_current() && self.on_line(stream, &line) {
                        timer = never();
                    }
                }
                Event::Line(Stream::Stdout, None) => stdout = never(),
                Event::Line(Stream::Stderr, None) => stderr = never(),
                Event::GraceElapsed => {
                    timer = never();
                    self.on_grace_elapsed();
                }
                Event::Exited(Ok(code)) => {
                    self.drain(stdout, stderr);
                    self.on_exit(code);
                    return;
                }
                // The watcher went away without a code: the attempt was stopped.
                Event::Exited(Err(RecvError)) => return,
            }
        }
    }

    /// Collects lines the engine wrote before exiting. Stops when both streams close
    /// or after `EXIT_DRAIN`, whichever comes first.
    fn drain(&mut self, mut stdout: Receiver<String>, mut stderr: Receiver<String>) {
        let deadline = after(EXIT_DRAIN);
        let mut open = 2;
        while open > 0 {
            let event = select! {
                recv(stdout) -> line => Some((Stream::Stdout, line.ok())),
                recv(stderr) -> line => Some((Stream::Stderr, line.ok())),
                recv(deadline) -> _ => None,
            };
            match event {
                Some((stream, Some(line))) => {
                    self.on_line(stream, &line);
                }
                Some((Stream::Stdout, None)) => {
                    stdout = never();
                    open -= 1;
                }
                Some((Stream::Stderr, None)) => {
                    stderr = never();
                    open -= 1;
                }
                None => {
                    tracing::debug!("engine output still open after exit");
                    return;
                }
            }
        }
    }

    fn is_current(&self) -> bool {
        lock(&self.state).watch_token == self.token
    }

    /// Routes one output line. Returns true when the line confirmed the attempt.
    fn on_line(&mut self, stream: Stream, line: &str) -> bool {
        let lowered = line.to_lowercase();
        if lowered.contains(STARTED_MARKER) {
            if !self.marker_seen {
                return self.on_marker();
            }
            self.report(LogKind::Info, passthrough(line));
            return false;
        }

        match stream {
            Stream::Stdout => {
                if lowered.contains("error") || lowered.contains("failed") {
                    self.report(LogKind::Error, classify(line).message);
                } else if lowered.contains("warn") {
                    self.report(LogKind::Warning, passthrough(line));
                } else {
                    self.report(LogKind::Info, passthrough(line));
                }
            }
            Stream::Stderr => {
                if !self.settled {
                    self.stderr_text.push_str(line);
                    self.stderr_text.push('\n');
                }
                if lowered.contains("warn") {
                    self.report(LogKind::Warning, passthrough(line));
                } else {
                    self.report(LogKind::Error, classify(line).message);
                }
            }
        }
        false
    }

    /// First marker only. After a grace confirmation it still reports success, once.
    fn on_marker(&mut self) -> bool {
        self.marker_seen = true;
        let confirmed = self.advance(SessionState::Starting, SessionState::Confirmed);
        self.report(LogKind::Success, format!("VPN started ({})", self.label));
        if confirmed {
            self.settle();
            self.resolve(Ok(()));
        }
        confirmed
    }

    fn on_grace_elapsed(&mut self) {
        if self.advance(SessionState::Starting, SessionState::Confirmed) {
            self.settle();
            self.report(LogKind::Info, "Waiting for connection...");
            self.resolve(Ok(()));
        }
    }

    /// Stderr is only kept to explain a failed start.
    fn settle(&mut self) {
        self.settled = true;
        self.stderr_text = String::new();
    }

    fn on_exit(&mut self, code: Option<i32>) {
        let failure = self.startup_failure();
        let previous = {
            let mut guard = lock(&self.state);
            if guard.watch_token != self.token {
                return;
            }
            let previous = guard.phase;
            guard.phase = SessionState::Idle;
            guard.child = None;
            guard.last_exit = code;
            guard.last_error = match previous {
                SessionState::Starting => Some(err(failure.kind(), failure.to_string())),
                SessionState::Confirmed if code != Some(0) => Some(err(
                    ErrorKind::UnexpectedTermination,
                    describe_exit(code),
                )),
                _ => None,
            };
            previous
        };

        match previous {
            SessionState::Starting => {
                self.report(
                    LogKind::Error,
                    format!("Engine exited with {}: {failure}", describe_exit(code)),
                );
                self.resolve(Err(failure));
            }
            SessionState::Confirmed => {
                if code == Some(0) {
                    self.report(LogKind::Info, "VPN process stopped");
                } else {
                    self.report(LogKind::Warning, "VPN process terminated unexpectedly");
                }
                if let Some(hook) = self.exit_hook.take() {
                    hook();
                }
            }
            SessionState::Idle | SessionState::Stopping => {}
        }
    }

    fn startup_failure(&self) -> Error {
        if self.stderr_text.trim().is_empty() {
            return Error::EngineRuntime {
                kind: FaultKind::Unknown,
                message: "Engine exited before the connection was established".to_string(),
            };
        }
        let diagnosis = classify(&self.stderr_text);
        let lowered = self.stderr_text.to_lowercase();
        let needs_elevation = diagnosis.kind == FaultKind::PermissionDenied
            || lowered.contains("permission")
            || lowered.contains("access denied");
        if self.mode == Mode::Tunnel && needs_elevation {
            return Error::PrivilegeRequired(
                "Tunnel mode requires administrator rights. Restart the application as administrator."
                    .to_string(),
            );
        }
        Error::EngineRuntime {
            kind: diagnosis.kind,
            message: diagnosis.message,
        }
    }

    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let mut guard = lock(&self.state);
        if guard.watch_token != self.token || guard.phase != from {
            return false;
        }
        guard.phase = to;
        true
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(result);
        }
    }

    fn report(&self, kind: LogKind, message: impl Into<String>) {
        report(&*self.sink, kind, message);
    }
}

fn passthrough(line: &str) -> String {
    strip_ansi(line).trim().chars().take(PASSTHROUGH_CHARS).collect()
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}
