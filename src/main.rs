use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use puffvpn_lib::logging::init_tracing;
use puffvpn_lib::system_proxy::platform_controller;
use puffvpn_lib::{log_channel, translate_link, AppPaths, Mode, Session, Settings};

/// VLESS session core for the xray and sing-box engines.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding settings.json and the generated engine configs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the engine config generated for a vless:// link
    Translate {
        link: String,
        #[arg(short, long, value_enum, default_value_t = Mode::Proxy)]
        mode: Mode,
    },
    /// Run a session in the foreground; press Enter or close stdin to disconnect
    Connect {
        link: String,
        #[arg(short, long, value_enum, default_value_t = Mode::Proxy)]
        mode: Mode,
    },
    /// Write the effective settings to settings.json, creating it with defaults
    Settings,
    /// Launch the desktop shell
    #[cfg(feature = "desktop")]
    Desktop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(AppPaths::default_data_dir);
    let settings = Settings::load(&data_dir);
    init_tracing(&settings.log_level);

    let outcome = match cli.command {
        Command::Translate { link, mode } => translate(&link, mode, &settings),
        Command::Connect { link, mode } => connect(&link, mode, data_dir, settings),
        Command::Settings => write_settings(&data_dir, &settings),
        #[cfg(feature = "desktop")]
        Command::Desktop => puffvpn_lib::desktop::run().map_err(|e| e.to_string()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn translate(link: &str, mode: Mode, settings: &Settings) -> Result<(), String> {
    let document = translate_link(link, mode, settings).map_err(|e| e.to_string())?;
    let rendered = document.to_pretty_json().map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}

fn write_settings(data_dir: &Path, settings: &Settings) -> Result<(), String> {
    settings.save(data_dir).map_err(|e| e.to_string())?;
    println!("{}", data_dir.join("settings.json").display());
    Ok(())
}

fn connect(link: &str, mode: Mode, data_dir: PathBuf, settings: Settings) -> Result<(), String> {
    let mut paths = AppPaths::discover(&settings);
    paths.data_dir = data_dir;

    let (sink, events) = log_channel(256);
    let printer = thread::spawn(move || {
        for event in events.iter() {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "unprintable log event"),
            }
        }
    });

    let session = Session::new(paths, settings, platform_controller(), Arc::new(sink));
    let result = session.connect(link, mode).map_err(|e| e.to_string());
    if result.is_ok() {
        let mut line = String::new();
        if let Err(e) = io::stdin().lock().read_line(&mut line) {
            tracing::warn!(error = %e, "stdin closed");
        }
        let _ = session.disconnect();
    }

    drop(session);
    let _ = printer.join();
    result
}
