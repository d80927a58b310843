//! Tauri shell. The webview calls `connect`, `disconnect` and `get_status`; log events
//! arrive on the `vpn-log` channel.

use std::sync::Arc;

use tauri::{AppHandle, Emitter, Manager, State};

use crate::credential::Mode;
use crate::error::Error;
use crate::logging::{init_tracing, LogEvent, LogSink};
use crate::session::Session;
use crate::settings::{AppPaths, Settings};
use crate::supervisor::SessionStatus;

const LOG_EVENT: &str = "vpn-log";

type SharedSession = Arc<Session>;

struct TauriSink {
    app: AppHandle,
}

impl LogSink for TauriSink {
    fn emit(&self, event: LogEvent) {
        if let Err(e) = self.app.emit(LOG_EVENT, &event) {
            tracing::debug!(error = %e, "log event not delivered");
        }
    }
}

fn join_error(e: tauri::Error) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

#[tauri::command]
async fn connect(
    state: State<'_, SharedSession>,
    vless_key: String,
    mode: Mode,
) -> Result<(), Error> {
    let session = state.inner().clone();
    tauri::async_runtime::spawn_blocking(move || session.connect(&vless_key, mode))
        .await
        .map_err(join_error)?
}

#[tauri::command]
async fn disconnect(state: State<'_, SharedSession>) -> Result<(), Error> {
    let session = state.inner().clone();
    tauri::async_runtime::spawn_blocking(move || session.disconnect())
        .await
        .map_err(join_error)?
}

#[tauri::command]
fn get_status(state: State<SharedSession>) -> SessionStatus {
    state.status()
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() -> tauri::Result<()> {
    let settings = Settings::load(&AppPaths::default_data_dir());
    init_tracing(&settings.log_level);

    let app = tauri::Builder::default()
        .setup(move |app| {
            let sink = TauriSink {
                app: app.handle().clone(),
            };
            let session: SharedSession = Arc::new(Session::open(settings, Arc::new(sink)));
            app.manage(session);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![connect, disconnect, get_status])
        .build(tauri::generate_context!())?;

    app.run(|app_handle, event| {
        if let tauri::RunEvent::Exit = event {
            if let Some(session) = app_handle.try_state::<SharedSession>() {
                let _ = session.disconnect();
            }
        }
    });
    Ok(())
}
