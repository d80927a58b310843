//! OS-level system proxy toggle.
//!
//! Only Windows has a backend (WinINet settings in the current user's registry hive).
//! Every other platform gets [`NoopController`]. Callers go through [`SystemProxy`],
//! which logs failures instead of returning them.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(target_os = "windows")]
use windows_sys::Win32::Networking::WinInet::{
    InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
};
#[cfg(target_os = "windows")]
use winreg::{enums::HKEY_CURRENT_USER, RegKey};

use crate::logging::{report, LogKind, LogSink};

/// Capability to flip the system-wide proxy setting.
pub trait SystemProxyController: Send + Sync {
    fn enable(&self, server: &str, bypass: &str) -> io::Result<()>;
    fn disable(&self) -> io::Result<()>;
}

pub struct NoopController;

impl SystemProxyController for NoopController {
    fn enable(&self, _server: &str, _bypass: &str) -> io::Result<()> {
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
const INTERNET_SETTINGS: &str = "Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings";

/// `HKCU\...\Internet Settings` plus the WinINet change broadcast.
#[cfg(target_os = "windows")]
pub struct WinInetController;

#[cfg(target_os = "windows")]
impl WinInetController {
    fn settings_key() -> io::Result<RegKey> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (key, _) = hkcu.create_subkey(INTERNET_SETTINGS)?;
        Ok(key)
    }

    /// Tells running applications to re-read the proxy settings.
    fn broadcast() {
        unsafe {
            let changed = InternetSetOptionW(
                std::ptr::null(),
                INTERNET_OPTION_SETTINGS_CHANGED,
                std::ptr::null(),
                0,
            );
            let refreshed =
                InternetSetOptionW(std::ptr::null(), INTERNET_OPTION_REFRESH, std::ptr::null(), 0);
            if changed == 0 || refreshed == 0 {
                tracing::debug!(error = %io::Error::last_os_error(), "proxy change broadcast failed");
            }
        }
    }
}

#[cfg(target_os = "windows")]
impl SystemProxyController for WinInetController {
    fn enable(&self, server: &str, bypass: &str) -> io::Result<()> {
        let key = Self::settings_key()?;
        key.set_value("ProxyServer", &server)?;
        key.set_value("ProxyOverride", &bypass)?;
        key.set_value("ProxyEnable", &1u32)?;
        Self::broadcast();
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        let key = Self::settings_key()?;
        key.set_value("ProxyEnable", &0u32)?;
        Self::broadcast();
        Ok(())
    }
}

pub fn platform_controller() -> Arc<dyn SystemProxyController> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(WinInetController)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(NoopController)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ProxySystemState {
    active: bool,
    address: Option<String>,
}

/// Best-effort wrapper around a controller. Nothing here fails the caller.
pub struct SystemProxy {
    controller: Arc<dyn SystemProxyController>,
    state: Mutex<ProxySystemState>,
    sink: Arc<dyn LogSink>,
}

impl SystemProxy {
    pub fn new(controller: Arc<dyn SystemProxyController>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            controller,
            state: Mutex::new(ProxySystemState::default()),
            sink,
        }
    }

    /// Enables the proxy while `still_confirmed` holds. The check runs under the same
    /// lock `disable` takes, so a concurrent disconnect cannot be overtaken.
    pub fn enable_if(&self, address: &str, bypass: &str, still_confirmed: impl FnOnce() -> bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !still_confirmed() {
            tracing::debug!("session no longer confirmed, system proxy left alone");
            return;
        }
        match self.controller.enable(address, bypass) {
            Ok(()) => {
                state.active = true;
                state.address = Some(address.to_string());
                report(
                    &*self.sink,
                    LogKind::Info,
                    format!("System proxy set to {address}"),
                );
            }
            Err(e) => {
                report(
                    &*self.sink,
                    LogKind::Warning,
                    format!("Failed to set system proxy: {e}"),
                );
                // A failed write may have left some values behind.
                if let Err(e) = self.controller.disable() {
                    tracing::warn!(error = %e, "system proxy rollback failed");
                }
                *state = ProxySystemState::default();
            }
        }
    }

    /// Disables the proxy, then runs `then` before releasing the lock.
    pub fn disable_then<T>(&self, then: impl FnOnce() -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.disable_locked(&mut state);
        then()
    }

    pub fn disable(&self) {
        self.disable_then(|| ())
    }

    #[cfg(test)]
    fn state(&self) -> ProxySystemState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn disable_locked(&self, state: &mut ProxySystemState) {
        match self.controller.disable() {
            Ok(()) => {
                if let Some(address) = state.address.as_deref().filter(|_| state.active) {
                    report(
                        &*self.sink,
                        LogKind::Info,
                        format!("System proxy {address} disabled"),
                    );
                }
            }
            Err(e) => {
                report(
                    &*self.sink,
                    LogKind::Warning,
                    format!("Failed to disable system proxy: {e}"),
                );
            }
        }
        *state = ProxySystemState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{log_channel, NullSink};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Writes the flag, then optionally fails, like a registry write that dies halfway.
    #[derive(Default)]
    struct FlakyController {
        enabled: AtomicBool,
        fail_enable: bool,
        fail_disable: AtomicBool,
        disables: AtomicUsize,
    }

    impl SystemProxyController for FlakyController {
        fn enable(&self, _server: &str, _bypass: &str) -> io::Result<()> {
            self.enabled.store(true, Ordering::SeqCst);
            if self.fail_enable {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(())
        }

        fn disable(&self) -> io::Result<()> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            if self.fail_disable.swap(false, Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "busy"));
            }
            self.enabled.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn enable_then_disable_leaves_flag_off() {
        let controller = Arc::new(FlakyController::default());
        let proxy = SystemProxy::new(controller.clone(), Arc::new(NullSink));

        proxy.enable_if("127.0.0.1:10809", "<local>", || true);
        assert!(controller.enabled.load(Ordering::SeqCst));
        assert_eq!(proxy.state().address.as_deref(), Some("127.0.0.1:10809"));

        proxy.disable();
        assert!(!controller.enabled.load(Ordering::SeqCst));
        assert_eq!(proxy.state(), ProxySystemState::default());
    }

    #[test]
    fn disable_names_the_address_it_released() {
        let (sink, events) = log_channel(8);
        let proxy = SystemProxy::new(Arc::new(NoopController), Arc::new(sink));

        proxy.disable();
        assert!(events.try_recv().is_err());

        proxy.enable_if("127.0.0.1:10809", "<local>", || true);
        proxy.disable();
        proxy.disable();
        let messages: Vec<String> = events.try_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            [
                "System proxy set to 127.0.0.1:10809",
                "System proxy 127.0.0.1:10809 disabled",
            ]
        );
    }

    #[test]
    fn failed_enable_is_rolled_back_and_logged() {
        let controller = Arc::new(FlakyController {
            fail_enable: true,
            ..Default::default()
        });
        let (sink, events) = log_channel(8);
        let proxy = SystemProxy::new(controller.clone(), Arc::new(sink));

        proxy.enable_if("127.0.0.1:10809", "<local>", || true);
        proxy.disable();

        assert!(!controller.enabled.load(Ordering::SeqCst));
        assert!(!proxy.state().active);
        assert_eq!(events.try_recv().unwrap().kind, LogKind::Warning);
    }

    #[test]
    fn failed_disable_is_swallowed() {
        let controller = Arc::new(FlakyController::default());
        let proxy = SystemProxy::new(controller.clone(), Arc::new(NullSink));
        proxy.enable_if("127.0.0.1:10809", "<local>", || true);

        controller.fail_disable.store(true, Ordering::SeqCst);
        proxy.disable();
        assert!(!proxy.state().active);

        proxy.disable();
        assert!(!controller.enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn stale_session_does_not_enable() {
        let controller = Arc::new(FlakyController::default());
        let proxy = SystemProxy::new(controller.clone(), Arc::new(NullSink));

        proxy.enable_if("127.0.0.1:10809", "<local>", || false);
        assert!(!controller.enabled.load(Ordering::SeqCst));
        assert!(!proxy.state().active);
    }

    #[test]
    fn disable_runs_follow_up_under_lock() {
        let controller = Arc::new(FlakyController::default());
        let proxy = SystemProxy::new(controller.clone(), Arc::new(NullSink));
        let value = proxy.disable_then(|| 7);
        assert_eq!(value, 7);
        assert_eq!(controller.disables.load(Ordering::SeqCst), 1);
    }
}
