//! readerctl: command-line control for the autoread scheduler.
//!
//! Every subcommand is one request to the scheduler socket; the answer is
//! printed as JSON on stdout.
//!
//! ## Subcommands
//!
//! - `status`: scheduler health plus the daily-auto picture
//! - `daily`: show or change the daily-auto settings
//! - `run-daily`: attempt today's daily run now
//! - `stop`: stop every executor
//! - `send` / `broadcast`: deliver a command to one or all surfaces
//! - `forget`: drop a closed surface
//! - `diagnostics`: recent delivery and launch failures

mod logging;
mod scheduler_client;

use autoread_protocol::{Command, DailyAutoPatch, Method, ReaderConfigPatch};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "readerctl")]
#[command(about = "Control the autoread scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scheduler health and daily-auto status
    Status,

    /// Show daily-auto settings, or change them when any flag is given
    Daily {
        #[arg(long)]
        enabled: Option<bool>,

        /// Topics to read per day
        #[arg(long)]
        target: Option<u32>,

        /// Window start, HH:MM local time
        #[arg(long, value_name = "HH:MM")]
        start: Option<String>,

        /// Only launch while the site is unattended
        #[arg(long)]
        require_hidden: Option<bool>,
    },

    /// Attempt today's daily run now
    RunDaily,

    /// Stop every executor
    Stop,

    /// Send a command to one surface
    Send {
        #[arg(value_name = "SURFACE")]
        surface: String,

        #[command(flatten)]
        command: CommandArgs,
    },

    /// Send a command to every registered surface
    Broadcast {
        #[command(flatten)]
        command: CommandArgs,
    },

    /// Forget a closed surface
    Forget {
        #[arg(value_name = "SURFACE")]
        surface: String,
    },

    /// Recent delivery and launch failures
    Diagnostics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Action {
    Start,
    StartDaily,
    Stop,
    ResetAndStart,
    ResetHistory,
    UpdateConfig,
    GetConfig,
    GetStats,
}

#[derive(Args, Debug)]
struct CommandArgs {
    #[arg(value_enum, value_name = "ACTION")]
    action: Action,

    /// start-daily: topics to read
    #[arg(long)]
    target: Option<u32>,

    /// start-daily: YYYY-MM-DD, defaults to today
    #[arg(long)]
    date: Option<String>,

    /// start-daily: skip the executor's idle wait
    #[arg(long)]
    skip_idle_wait: bool,

    /// update-config: listing page to read from
    #[arg(long)]
    listing_url: Option<String>,

    /// update-config: read only the first screen of each topic
    #[arg(long)]
    quick_mode: Option<bool>,

    /// update-config: scroll pause bounds, milliseconds
    #[arg(long)]
    min_read_ms: Option<u64>,
    #[arg(long)]
    max_read_ms: Option<u64>,

    /// update-config: dwell bounds after a topic, milliseconds
    #[arg(long)]
    min_stay_ms: Option<u64>,
    #[arg(long)]
    max_stay_ms: Option<u64>,

    /// update-config: chance of a simulated pointer move per step
    #[arg(long)]
    pointer_probability: Option<f64>,
}

impl CommandArgs {
    fn into_command(self, today: &str) -> Result<Command, String> {
        let command = match self.action {
            Action::Start => Command::Start,
            Action::StartDaily => Command::StartDaily {
                target: self
                    .target
                    .ok_or_else(|| "start-daily requires --target".to_string())?,
                date: self.date.unwrap_or_else(|| today.to_string()),
                skip_idle_wait: self.skip_idle_wait,
            },
            Action::Stop => Command::Stop,
            Action::ResetAndStart => Command::ResetAndStart,
            Action::ResetHistory => Command::ResetHistory,
            Action::UpdateConfig => Command::UpdateConfig {
                config: ReaderConfigPatch {
                    min_read_ms: self.min_read_ms,
                    max_read_ms: self.max_read_ms,
                    min_stay_ms: self.min_stay_ms,
                    max_stay_ms: self.max_stay_ms,
                    pointer_probability: self.pointer_probability,
                    quick_mode: self.quick_mode,
                    listing_url: self.listing_url,
                },
            },
            Action::GetConfig => Command::GetConfig,
            Action::GetStats => Command::GetStats,
        };
        command
            .validate()
            .map_err(|err| format!("{}: {}", err.code, err.message))?;
        Ok(command)
    }
}

fn daily_patch(
    enabled: Option<bool>,
    target: Option<u32>,
    start: Option<String>,
    require_hidden: Option<bool>,
) -> Option<DailyAutoPatch> {
    let patch = DailyAutoPatch {
        enabled,
        target,
        window_start: start,
        require_hidden,
    };
    if patch == DailyAutoPatch::default() {
        None
    } else {
        Some(patch)
    }
}

fn to_params<T: serde::Serialize>(value: &T) -> Result<Option<Value>, String> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|err| format!("Failed to encode request: {}", err))
}

fn run(command: Commands) -> Result<Value, String> {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    match command {
        Commands::Status => {
            let health = scheduler_client::call(Method::GetHealth, None)?;
            let daily = scheduler_client::call(Method::GetDailyAuto, None)?;
            Ok(serde_json::json!({ "health": health, "daily": daily }))
        }
        Commands::Daily {
            enabled,
            target,
            start,
            require_hidden,
        } => match daily_patch(enabled, target, start, require_hidden) {
            Some(patch) => scheduler_client::call(Method::UpdateDailyAuto, to_params(&patch)?),
            None => scheduler_client::call(Method::GetDailyAuto, None),
        },
        Commands::RunDaily => scheduler_client::call(Method::RunDailyNow, None),
        Commands::Stop => scheduler_client::call(Method::IssueStop, None),
        Commands::Send { surface, command } => {
            let command = command.into_command(&today)?;
            let params = serde_json::json!({ "surface_id": surface, "command": command });
            scheduler_client::call(Method::Dispatch, Some(params))
        }
        Commands::Broadcast { command } => {
            let command = command.into_command(&today)?;
            scheduler_client::call(Method::Command, to_params(&command)?)
        }
        Commands::Forget { surface } => scheduler_client::call(
            Method::ForgetSurface,
            Some(serde_json::json!({ "surface_id": surface })),
        ),
        Commands::Diagnostics => scheduler_client::call(Method::GetDiagnostics, None),
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("readerctl: {}", err);
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "readerctl request failed");
            eprintln!("readerctl: {}", err);
            std::process::exit(1);
        }
    }
}
