use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser};
use log::error;
use tokio::runtime::Builder;

use pgvacman_core::{
    Configuration,
    cli::{ConnectArgs, RunArgs, init_logging, run_with_prompt},
};

#[derive(Parser, Debug)]
#[command(
    name = "pgvacman",
    version,
    about = "Sets PostgreSQL storage parameters by table size",
    disable_help_flag = true
)]
struct Args {
    /// YAML file of matchgroups and rulesets
    #[arg(value_name = "RULEFILE")]
    rulefile: PathBuf,

    #[command(flatten)]
    run: RunArgs,

    #[command(flatten)]
    connect: ConnectArgs,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.run.log_level());

    let config = match Configuration::load(&args.rulefile) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {}", args.rulefile.display(), e);
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

    let result = rt.block_on(async {
        let options = args.connect.options()?;
        run_with_prompt(&config, &args.connect, options, &args.run.run_options()).await
    });

    match result {
        Ok((report, _)) => ExitCode::from(args.run.exit_code(&report)),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
