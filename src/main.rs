use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use observe_deploy::outcome::RunReport;
use observe_deploy::{facts, vars, workflow};

#[derive(Parser)]
#[command(name = "observe-deploy")]
#[command(
    about = "Installs and configures the Observe telemetry agent on Debian-family hosts with idempotent stages, timestamped backups, and rollback on failure"
)]
#[command(version)]
struct Cli {
    /// Variables file supplying token and url (default: /etc/observe-deploy/vars.yaml if it exists, otherwise OBSERVE_TOKEN/OBSERVE_URL from the environment)
    #[arg(short, long)]
    vars_file: Option<PathBuf>,
    /// Directory holding configuration file variants (default: /etc/observe-deploy/files)
    #[arg(long)]
    files_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full install sequence: repository, package, configuration, init, service, pin
    Install {
        /// Report what would change without mutating the host
        #[arg(long)]
        dry_run: bool,
        /// Emit the run report as JSON instead of the summary table
        #[arg(long)]
        report_json: bool,
    },
    /// Stop the service, redeploy configuration by OS version, restart and verify
    Update {
        /// Report what would change without mutating the host
        #[arg(long)]
        dry_run: bool,
        /// Emit the run report as JSON instead of the summary table
        #[arg(long)]
        report_json: bool,
    },
    /// Print probed host facts as YAML
    Facts,
}

fn load_variables(cli_path: Option<&PathBuf>) -> anyhow::Result<vars::DeploymentVariables> {
    // Precedence: CLI argument, then the system-wide file, then environment
    if let Some(path) = cli_path {
        return vars::load(path);
    }
    let system_vars = PathBuf::from("/etc/observe-deploy/vars.yaml");
    if system_vars.exists() {
        return vars::load(&system_vars);
    }
    vars::from_env()
}

fn emit_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render());
    }

    if report.succeeded() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("run failed, see report above"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Install {
            dry_run,
            report_json,
        } => {
            let variables = load_variables(cli.vars_file.as_ref())?;
            let mut settings = workflow::Settings::new(dry_run);
            if let Some(files_dir) = cli.files_dir.or_else(|| variables.files_dir.clone()) {
                settings.files_dir = files_dir;
            }

            let report = workflow::install(&variables, &settings).await;
            emit_report(&report, report_json)
        }
        Commands::Update {
            dry_run,
            report_json,
        } => {
            let mut settings = workflow::Settings::new(dry_run);
            if let Some(files_dir) = cli.files_dir {
                settings.files_dir = files_dir;
            }

            let report = workflow::update(&settings).await;
            emit_report(&report, report_json)
        }
        Commands::Facts => {
            let facts = facts::probe()?;
            print!("{}", serde_yaml::to_string(&facts)?);
            Ok(())
        }
    }
}
