pub mod adapters;
pub mod blob_rename;
pub mod config;
pub mod errors;
pub mod fixture_file;
pub mod fixture_identity;
pub mod fixture_writer;
pub mod hook;
pub mod inflect;
pub mod iso_duration;
pub mod logging;
pub mod model;
pub mod naming;
pub mod relative_time;
pub mod runtime;
pub mod session;
pub mod session_store;
pub mod tracer;
pub mod value_serializer;

use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use config::{load_config, CliOverrides};
use errors::FixtureFarmError;
use logging::{append_run_log, init_run_logger};
use runtime::ProductionRuntime;
use serde_json::json;
use session::NamePrefix;
use session_store::{SessionStatus, SessionStore};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "fixture_farm")]
#[command(about = "Record test fixtures from records created while exercising an app")]
pub struct Cli {
    /// Project root; relative paths in the config resolve against it.
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start recording; every fixture name of the session begins with PREFIX.
    Record { prefix: Option<String> },
    /// Report whether a session is in progress.
    Status,
    /// Stop recording and discard the session.
    Stop,
}

pub fn run() -> Result<i32, FixtureFarmError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| FixtureFarmError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, FixtureFarmError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(FixtureFarmError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        root: cli.root.clone(),
    };
    let (cfg, scope) = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    init_run_logger(&cfg.paths.log_file);
    append_run_log(
        "info",
        "cli.command",
        json!({"command": format!("{:?}", cli.command), "root": scope.root.display().to_string()}),
    );

    let sessions = SessionStore::new(runtime.file_system.as_ref(), cfg.paths.session_file.clone());
    let terminal = runtime.terminal.as_ref();
    match cli.command {
        Command::Record { prefix } => {
            let prefix = prefix.filter(|prefix| !prefix.is_empty());
            sessions.start(prefix.as_deref().map(NamePrefix::from))?;
            match prefix {
                Some(prefix) => terminal.write_line(&format!("Recording fixtures with prefix {prefix}"))?,
                None => terminal.write_line("Recording fixtures")?,
            }
        }
        Command::Status => match sessions.status()? {
            SessionStatus::Active => terminal.write_line("Recording is on")?,
            SessionStatus::Error(error) => terminal.write_line(&format!("Recording is off ({error})"))?,
            SessionStatus::Absent => terminal.write_line("Recording is off")?,
        },
        Command::Stop => {
            sessions.stop()?;
            terminal.write_line("Stopped recording")?;
        }
    }
    Ok(0)
}

pub fn render_help() -> Result<String, FixtureFarmError> {
    let mut cmd = Cli::command();
    let mut buffer = Vec::new();
    cmd.write_long_help(&mut buffer)
        .map_err(|e| FixtureFarmError::Io(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| FixtureFarmError::Io(e.to_string()))
}
