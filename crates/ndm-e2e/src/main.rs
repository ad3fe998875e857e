//! node-disk-manager end-to-end test CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ndm_e2e::config::{Budgets, HarnessConfig, HarnessOptions, RunArgs};
use ndm_e2e::orchestrator::{Harness, KubeConnector};
use ndm_e2e::{ui, HarnessError, SystemRunner};

/// End-to-end tests for node-disk-manager on single-node minikube.
#[derive(Parser)]
#[command(
    name = "ndm-e2e",
    version,
    about = "node-disk-manager end-to-end test harness",
    long_about = "Run node-disk-manager end-to-end on a single-node minikube cluster.\n\n\
                  Starts minikube with the none driver, deploys the locally built\n\
                  daemon image and compares the devices it reports from inside its\n\
                  pod with the host's view."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    options: HarnessOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full end-to-end test.
    Run(RunArgs),

    /// Delete the cluster, host containers and the test manifest.
    Clean,

    /// Print the parsed minikube status.
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,ndm_e2e=debug")
        } else {
            EnvFilter::new("warn,ndm_e2e=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runner = Arc::new(SystemRunner::new(cli.options.use_sudo));
    let (budgets, dir_wait, clean_after) = match &cli.command {
        Commands::Run(args) => (
            Budgets::from(args),
            Duration::from_secs(args.dir_wait_secs),
            args.clean,
        ),
        Commands::Clean | Commands::Status => (Budgets::default(), Duration::from_secs(60), false),
    };
    let config = match HarnessConfig::resolve(&cli.options, budgets, dir_wait, runner.as_ref()) {
        Ok(config) => config,
        Err(e) => fail(&HarnessError::Config(format!("{e:#}"))),
    };
    let harness = Harness::new(config, runner, Arc::new(KubeConnector));

    let result = match cli.command {
        Commands::Run(_) => harness.run().await,
        Commands::Clean => {
            harness.clean();
            Ok(())
        }
        Commands::Status => harness.status().map(|_| ()),
    };

    if let Err(err) = result {
        fail(&err);
    }

    if clean_after {
        harness.clean();
    }
    Ok(())
}

fn fail(err: &HarnessError) -> ! {
    ui::print_error(&format!("{} failed: {err}", err.stage()));
    std::process::exit(err.exit_code());
}
