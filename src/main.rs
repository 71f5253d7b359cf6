//! speedlog CLI
//!
//! Runs one measure-and-record cycle, or provisions the sample table with
//! `--setup` / `setup`. The exit status tells the scheduler what happened:
//! 0 success, 1 measurement failed (recorded), 2 storage failed,
//! 3 configuration or startup failed.

use clap::{Parser, Subcommand};
use speedlog::config::generate_default_config;
use speedlog::{
    init_logging, open_store, run_cycle, run_setup, Config, ConfigError, RunError, RunOutcome,
    SampleStore, SpeedtestProbe, StoredSample,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "speedlog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Measure internet throughput once and record it in a database")]
#[command(long_about = "speedlog runs a single speedtest and stores the result, or the \
reason it failed, as one database row.\nSchedule it with cron or a systemd timer.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file (TOML, or legacy key=value credentials file)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Create the sample table and exit without measuring
    #[arg(long)]
    pub setup: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the sample table and exit without measuring
    Setup,

    /// Show the most recent records
    Last {
        /// Number of records
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,

        /// Print one JSON object per record
        #[arg(long)]
        json: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

enum Mode {
    Cycle,
    Setup,
    Last { count: usize, json: bool },
}

impl Cli {
    fn mode(&self) -> Mode {
        if self.setup {
            return Mode::Setup;
        }
        match &self.command {
            Some(Commands::Setup) => Mode::Setup,
            Some(Commands::Last { count, json }) => Mode::Last {
                count: *count,
                json: *json,
            },
            Some(Commands::Config { .. }) | None => Mode::Cycle,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Commands::Config { output }) = &cli.command {
        return write_default_config(output.as_deref());
    }

    match execute(&cli) {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            eprintln!("speedlog: {}", err);
            err.outcome().into()
        }
    }
}

fn execute(cli: &Cli) -> Result<RunOutcome, RunError> {
    let path = Config::locate(cli.config.as_deref())?;
    let config = Config::load_with_env(&path)?;
    config.validate()?;

    let _guards = init_logging(&config.logging)
        .map_err(|e| ConfigError::Invalid(format!("logging: {:#}", e)))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        backend = %config.database.backend,
        table = %config.database.table,
        "speedlog starting"
    );

    let store = open_store(&config.database).map_err(|err| {
        tracing::error!(error = %err, "Cannot build sample store");
        err
    })?;

    let outcome = match cli.mode() {
        Mode::Setup => run_setup(store.as_ref()),
        Mode::Cycle => {
            let probe = SpeedtestProbe::new(config.probe.clone());
            run_cycle(&probe, store.as_ref())
        }
        Mode::Last { count, json } => print_recent(store.as_ref(), count, json),
    };

    tracing::info!(exit_code = outcome.exit_code(), ?outcome, "speedlog finished");
    Ok(outcome)
}

fn print_recent(store: &dyn SampleStore, count: usize, json: bool) -> RunOutcome {
    let rows = match store.recent(count) {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(error = %err, "Cannot read records");
            return RunOutcome::StorageFailed;
        }
    };

    if json {
        return match json_lines(&rows) {
            Ok(lines) => {
                print!("{}", lines);
                RunOutcome::Reported
            }
            Err(err) => {
                tracing::error!(error = %err, "Cannot encode records");
                RunOutcome::StorageFailed
            }
        };
    }

    println!(
        "{:>6}  {:<19}  {:<15}  {:>9}  {:>9}  {}",
        "id", "time", "ip", "down", "up", "isp / error"
    );
    for row in rows {
        let s = &row.sample;
        println!(
            "{:>6}  {:<19}  {:<15}  {:>9.2}  {:>9.2}  {}",
            row.id,
            row.timestamp.format("%Y-%m-%d %H:%M:%S"),
            s.client_ip,
            s.download_mbps,
            s.upload_mbps,
            if s.is_failure() { &s.error_text } else { &s.isp }
        );
    }

    RunOutcome::Reported
}

fn json_lines(rows: &[StoredSample]) -> serde_json::Result<String> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

fn write_default_config(output: Option<&Path>) -> ExitCode {
    let content = generate_default_config();

    match output {
        None => {
            print!("{}", content);
            ExitCode::SUCCESS
        }
        Some(path) => match std::fs::write(path, content) {
            Ok(()) => {
                eprintln!("Wrote default config to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("speedlog: cannot write {}: {}", path.display(), e);
                RunOutcome::ConfigFailed.into()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_modes() {
        let cli = Cli::parse_from(["speedlog"]);
        assert!(matches!(cli.mode(), Mode::Cycle));

        let cli = Cli::parse_from(["speedlog", "--setup"]);
        assert!(matches!(cli.mode(), Mode::Setup));

        let cli = Cli::parse_from(["speedlog", "setup"]);
        assert!(matches!(cli.mode(), Mode::Setup));

        let cli = Cli::parse_from(["speedlog", "--config", "/etc/speedlog.toml", "--setup"]);
        assert!(matches!(cli.mode(), Mode::Setup));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/speedlog.toml")));

        let cli = Cli::parse_from(["speedlog", "last", "-n", "3"]);
        assert!(matches!(
            cli.mode(),
            Mode::Last {
                count: 3,
                json: false
            }
        ));

        let cli = Cli::parse_from(["speedlog", "last", "--json"]);
        assert!(matches!(
            cli.mode(),
            Mode::Last {
                count: 10,
                json: true
            }
        ));
    }

    #[test]
    fn test_json_lines() {
        let rows = vec![
            StoredSample {
                id: 2,
                timestamp: chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_opt(12, 30, 0)
                    .unwrap(),
                sample: speedlog::Sample::failed("no servers"),
            },
            StoredSample {
                id: 1,
                timestamp: chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
                sample: speedlog::Sample::measured("203.0.113.5", "Acme", 12e7, 18e6),
            },
        ];

        let out = json_lines(&rows).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], 2);
        assert_eq!(first["error_text"], "no servers");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["isp"], "Acme");
        assert_eq!(second["download_mbps"], 120.0);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_missing_config_is_config_failure() {
        let cli = Cli::parse_from(["speedlog", "--config", "/nonexistent/speedlog.toml"]);
        let err = execute(&cli).unwrap_err();
        assert_eq!(err.outcome(), RunOutcome::ConfigFailed);
    }
}
