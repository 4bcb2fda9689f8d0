use std::{collections::HashMap, path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser};
use log::{error, info, warn};
use tokio::runtime::Builder;

use pgvacman_core::{
    Configuration, VacmanError,
    cli::{ConnectArgs, RunArgs, init_logging, run_with_prompt},
    connection::{ConnectOptions, prompt_password},
    core::session::{
        postgres::PgProvider,
        traits::{CatalogSession, SessionProvider},
    },
};

const MAINTENANCE_DATABASE: &str = "postgres";

#[derive(Parser, Debug)]
#[command(
    name = "pgvacman-cluster",
    version,
    about = "Runs pgvacman against every connectable database of a cluster",
    disable_help_flag = true
)]
struct Args {
    /// Rule file for databases without their own
    #[arg(value_name = "RULEFILE")]
    rulefile: PathBuf,

    /// Rule file for one database
    #[arg(long = "db-config", value_name = "NAME=FILE", value_parser = parse_db_config)]
    db_config: Vec<(String, PathBuf)>,

    #[command(flatten)]
    run: RunArgs,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn parse_db_config(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, file)) if !name.is_empty() && !file.is_empty() => {
            Ok((name.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected NAME=FILE, got {}", value)),
    }
}

struct Rulefiles {
    default: Configuration,
    per_database: HashMap<String, Configuration>,
}

impl Rulefiles {
    fn load(default: &PathBuf, per_database: &[(String, PathBuf)]) -> Result<Self, String> {
        let load = |path: &PathBuf| Configuration::load(path).map_err(|e| format!("{}: {}", path.display(), e));

        Ok(Self {
            default: load(default)?,
            per_database: per_database
                .iter()
                .map(|(name, path)| Ok((name.clone(), load(path)?)))
                .collect::<Result<_, String>>()?,
        })
    }

    fn for_database(&self, name: &str) -> &Configuration {
        self.per_database.get(name).unwrap_or(&self.default)
    }
}

async fn list_databases(
    connect: &ConnectArgs,
    mut options: ConnectOptions,
) -> Result<(Vec<String>, ConnectOptions), VacmanError> {
    if options.dbname.is_none() {
        options.dbname = Some(MAINTENANCE_DATABASE.to_string());
    }

    loop {
        let provider = PgProvider::new(options.to_config()?);
        match provider.connect().await {
            Ok(mut session) => {
                let databases = session.list_databases().await.map_err(VacmanError::Catalog)?;
                return Ok((databases, options));
            }
            Err(VacmanError::PasswordAuthentication(e)) if connect.may_prompt() => {
                warn!("{}", e);
                options.password = Some(prompt_password("Password: ")?);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_cluster(args: &Args, rulefiles: &Rulefiles) -> Result<u8, VacmanError> {
    let (databases, mut options) = list_databases(&args.connect, args.connect.options()?).await?;
    let run_options = args.run.run_options();
    let mut exit = 0;

    for database in databases {
        info!("Database {}:", database);
        options.dbname = Some(database.clone());

        match run_with_prompt(rulefiles.for_database(&database), &args.connect, options.clone(), &run_options).await {
            Ok((report, accepted)) => {
                options = accepted;
                exit = exit.max(args.run.exit_code(&report));
            }
            Err(e) => {
                error!("Database {} failed: {}", database, e);
                exit = exit.max(1);
            }
        }
    }

    Ok(exit)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.run.log_level());

    let rulefiles = match Rulefiles::load(&args.rulefile, &args.db_config) {
        Ok(rulefiles) => rulefiles,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let rt = match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Unable to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run_cluster(&args, &rulefiles)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_db_config() {
        assert_eq!(
            parse_db_config("sales=/etc/pgvacman/sales.yaml"),
            Ok(("sales".to_string(), PathBuf::from("/etc/pgvacman/sales.yaml")))
        );
        assert!(parse_db_config("sales").is_err());
        assert!(parse_db_config("=rules.yaml").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "pgvacman-cluster",
            "default.yaml",
            "--db-config",
            "a=a.yaml",
            "--db-config",
            "b=b.yaml",
            "-j",
            "2",
        ])
        .unwrap();

        assert_eq!(args.db_config.len(), 2);
        assert_eq!(args.db_config[1].0, "b");
        assert_eq!(args.run.jobs, 2);
    }
}
