pub mod classifier;
pub mod credential;
pub mod error;
pub mod logging;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod system_proxy;
pub mod translator;

#[cfg(feature = "desktop")]
pub mod desktop;

pub use credential::{Credential, Mode};
pub use error::{Error, ErrorKind, Result};
pub use logging::{log_channel, LogEvent, LogKind, LogSink};
pub use session::Session;
pub use settings::{AppPaths, Settings};
pub use supervisor::{SessionState, SessionStatus};
pub use translator::{translate, translate_link, ConfigDocument};
