use std::{
    io::{IsTerminal, Write, stdin},
    time::Duration,
};

use clap::Args;
use log::{LevelFilter, warn};

use crate::{
    EXIT_LOCKS_UNAVAILABLE,
    configuration::Configuration,
    connection::{ConnectOptions, prompt_password},
    core::{
        run::{RunOptions, RunReport, run},
        scheduler::RunStatus,
        session::postgres::PgProvider,
    },
    error::VacmanError,
};

/// Connection flags shared by `pgvacman` and `pgvacman-cluster`.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    /// Database server host or socket directory
    #[arg(short = 'h', long, env = "PGHOST", value_name = "HOSTNAME")]
    pub host: Option<String>,

    /// Database server port
    #[arg(short = 'p', long, env = "PGPORT", value_name = "PORT")]
    pub port: Option<u16>,

    /// Database user name
    #[arg(short = 'U', long = "username", env = "PGUSER", value_name = "USERNAME")]
    pub username: Option<String>,

    /// Never prompt for a password
    #[arg(short = 'w', long = "no-password", conflicts_with = "password")]
    pub no_password: bool,

    /// Prompt for a password before connecting
    #[arg(short = 'W', long = "password")]
    pub password: bool,

    /// Database to connect to
    #[arg(short = 'd', long, env = "PGDATABASE", value_name = "DBNAME")]
    pub dbname: Option<String>,
}

impl ConnectArgs {
    /// Resolves the options, prompting up front when `-W` was given.
    pub fn options(&self) -> Result<ConnectOptions, VacmanError> {
        let password = if self.password {
            Some(prompt_password("Password: ")?)
        } else {
            std::env::var("PGPASSWORD").ok()
        };

        Ok(ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.username.clone(),
            dbname: self.dbname.clone(),
            password,
        })
    }

    /// Whether a rejected password may be asked for interactively.
    pub fn may_prompt(&self) -> bool {
        !self.no_password && stdin().is_terminal()
    }
}

/// Run flags shared by both binaries.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Number of concurrent connections
    #[arg(short = 'j', long, default_value_t = 1, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub jobs: u32,

    /// Print every change made
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Show what would change without changing anything (implies --verbose)
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Give up waiting for a table lock after this many seconds
    #[arg(short = 't', long = "lock-timeout", value_name = "SECONDS", value_parser = parse_lock_timeout)]
    pub lock_timeout: Option<Duration>,

    /// Don't wait for locks; skip tables that are in use
    #[arg(long = "skip-locked")]
    pub skip_locked: bool,

    /// Print which relations each matchgroup selects, then exit
    #[arg(long = "display-matches")]
    pub display_matches: bool,

    /// Exit with status 3 when some tables could not be locked
    #[arg(long = "fail-on-locked")]
    pub fail_on_locked: bool,
}

impl RunArgs {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            jobs: self.jobs as usize,
            dry_run: self.dry_run,
            lock_timeout: self.lock_timeout,
            skip_locked: self.skip_locked,
            display_only: self.display_matches,
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.verbose || self.dry_run || self.display_matches {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        }
    }

    pub fn exit_code(&self, report: &RunReport) -> u8 {
        match report.status {
            RunStatus::LocksUnavailable if self.fail_on_locked => EXIT_LOCKS_UNAVAILABLE,
            _ => 0,
        }
    }
}

pub fn parse_lock_timeout(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("{} is not a number of seconds", value))?;

    if !seconds.is_finite() || seconds <= 0.0 {
        return Err("lock timeout must be greater than zero".to_string());
    }

    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}

/// Plain `message` lines on stderr. `RUST_LOG` overrides `level`.
pub fn init_logging(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .parse_default_env()
        .init();
}

/// Runs against one database, asking for a new password for as long as the
/// server rejects it and prompting is allowed.
pub async fn run_with_prompt(
    config: &Configuration,
    connect: &ConnectArgs,
    mut options: ConnectOptions,
    run_options: &RunOptions,
) -> Result<(RunReport, ConnectOptions), VacmanError> {
    loop {
        let provider = PgProvider::new(options.to_config()?);
        match run(&provider, config, run_options).await {
            Ok(report) => return Ok((report, options)),
            Err(VacmanError::PasswordAuthentication(e)) if connect.may_prompt() => {
                warn!("{}", e);
                options.password = Some(prompt_password("Password: ")?);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    #[command(disable_help_flag = true)]
    struct TestArgs {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        connect: ConnectArgs,
    }

    #[test]
    fn test_parse_lock_timeout() {
        assert_eq!(parse_lock_timeout("1.5"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_lock_timeout("30"), Ok(Duration::from_secs(30)));
        assert!(parse_lock_timeout("0").is_err());
        assert!(parse_lock_timeout("-2").is_err());
        assert!(parse_lock_timeout("soon").is_err());
    }

    #[test]
    fn test_flags() {
        let args = TestArgs::try_parse_from([
            "pgvacman", "-j", "4", "-n", "-t", "2.5", "--skip-locked", "-h", "db", "-p", "6432", "-U", "admin", "-w",
        ])
        .unwrap();

        let options = args.run.run_options();
        assert_eq!(options.jobs, 4);
        assert!(options.dry_run);
        assert!(options.skip_locked);
        assert_eq!(options.lock_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(args.run.log_level(), LevelFilter::Info);
        assert_eq!(args.connect.host.as_deref(), Some("db"));
        assert_eq!(args.connect.port, Some(6432));
        assert!(!args.connect.may_prompt());
    }

    #[test]
    fn test_invalid_flags() {
        assert!(TestArgs::try_parse_from(["pgvacman", "-j", "0"]).is_err());
        assert!(TestArgs::try_parse_from(["pgvacman", "-w", "-W"]).is_err());
    }

    #[test]
    fn test_exit_code() {
        let args = TestArgs::try_parse_from(["pgvacman", "--fail-on-locked"]).unwrap();
        let report = RunReport {
            status: RunStatus::LocksUnavailable,
            stats: Default::default(),
        };
        assert_eq!(args.run.exit_code(&report), EXIT_LOCKS_UNAVAILABLE);

        let args = TestArgs::try_parse_from(["pgvacman"]).unwrap();
        assert_eq!(args.run.exit_code(&report), 0);
    }
}
