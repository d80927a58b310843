//! The `connect` / `disconnect` / `status` boundary.
//!
//! A `Session` owns the supervisor and the system proxy guard for the lifetime of the
//! application. Connect runs translate, start, then (proxy mode) enable; disconnect
//! disables the system proxy first and then stops the engine.

use std::sync::Arc;

use crate::credential::{Credential, Mode};
use crate::error::Result;
use crate::logging::{report, LogKind, LogSink};
use crate::settings::{AppPaths, Settings};
use crate::supervisor::{ExitHook, SessionStatus, Supervisor};
use crate::system_proxy::{platform_controller, SystemProxy, SystemProxyController};
use crate::translator::translate;

pub struct Session {
    supervisor: Supervisor,
    proxy: Arc<SystemProxy>,
    settings: Settings,
    sink: Arc<dyn LogSink>,
}

impl Session {
    pub fn new(
        paths: AppPaths,
        settings: Settings,
        controller: Arc<dyn SystemProxyController>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(paths, settings.grace_period(), sink.clone()),
            proxy: Arc::new(SystemProxy::new(controller, sink.clone())),
            settings,
            sink,
        }
    }

    /// Session with discovered paths and the platform's system proxy backend.
    pub fn open(settings: Settings, sink: Arc<dyn LogSink>) -> Self {
        let paths = AppPaths::discover(&settings);
        tracing::debug!(data = %paths.data_dir.display(), engines = %paths.engine_dir.display(), "session paths");
        Self::new(paths, settings, platform_controller(), sink)
    }

    /// Blocks until the engine is confirmed or the attempt fails.
    pub fn connect(&self, link: &str, mode: Mode) -> Result<()> {
        let credential = match Credential::parse(link) {
            Ok(credential) => credential,
            Err(error) => {
                report(&*self.sink, LogKind::Error, error.to_string());
                return Err(error);
            }
        };
        tracing::info!(server = %credential.label(), %mode, "connecting");

        let document = translate(&credential, mode, &self.settings);
        let exit_hook: ExitHook = match mode {
            Mode::Proxy => {
                let proxy = self.proxy.clone();
                Box::new(move || proxy.disable())
            }
            Mode::Tunnel => Box::new(|| {}),
        };
        let ticket = self.supervisor.start(&document, exit_hook)?;

        if mode == Mode::Proxy {
            let address = self.settings.http_proxy_address();
            self.proxy
                .enable_if(&address, &self.settings.bypass, || {
                    self.supervisor.is_confirmed(ticket)
                });
        }
        Ok(())
    }

    /// Idempotent; succeeds when nothing is running.
    pub fn disconnect(&self) -> Result<()> {
        let stopped = self.proxy.disable_then(|| self.supervisor.stop());
        if !stopped {
            tracing::debug!("disconnect with no active engine");
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.supervisor.status()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.proxy.disable_then(|| self.supervisor.stop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::logging::log_channel;
    use crate::supervisor::SessionState;
    use crate::system_proxy::NoopController;
    use tempfile::TempDir;

    #[test]
    fn invalid_link_is_rejected_and_logged() {
        let dir = TempDir::new().unwrap();
        let (sink, events) = log_channel(8);
        let session = Session::new(
            AppPaths::new(dir.path(), dir.path()),
            Settings::default(),
            Arc::new(NoopController),
            Arc::new(sink),
        );

        let err = session.connect("vmess://abc@host:443", Mode::Proxy).unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
        assert_eq!(events.try_recv().unwrap().kind, LogKind::Error);
        assert_eq!(session.status().state, SessionState::Idle);
        assert!(!dir.path().join("config.json").exists());
    }

    #[test]
    fn disconnect_without_session_succeeds() {
        let dir = TempDir::new().unwrap();
        let (sink, events) = log_channel(8);
        let session = Session::new(
            AppPaths::new(dir.path(), dir.path()),
            Settings::default(),
            Arc::new(NoopController),
            Arc::new(sink),
        );

        session.disconnect().unwrap();
        session.disconnect().unwrap();
        assert!(!session.status().connected);
        assert!(events.try_recv().is_err());
    }
}
