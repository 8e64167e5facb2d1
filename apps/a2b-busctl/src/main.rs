use std::path::PathBuf;
use std::thread;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

mod config;

use a2b_core::A2bError;
use a2b_sim::{RunReport, SimBus};
use a2b_stack::PeriphOp;

use crate::config::BusctlConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover the simulated bus and run peripheral operations (default)
    Run {
        #[arg(long, value_enum, default_value_t = OpSelection::Both)]
        op: OpSelection,
        /// Print each report as TOML instead of a summary line
        #[arg(long)]
        toml: bool,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OpSelection {
    Init,
    Deinit,
    Both,
}

impl OpSelection {
    fn ops(self) -> &'static [PeriphOp] {
        match self {
            Self::Init => &[PeriphOp::Init],
            Self::Deinit => &[PeriphOp::Deinit],
            Self::Both => &[PeriphOp::Init, PeriphOp::Deinit],
        }
    }
}

fn run(config: &BusctlConfig, selection: OpSelection) -> Result<Vec<RunReport>, A2bError> {
    let mut bus = SimBus::new(config.scenario())?;
    let nodes = bus.discover()?;
    info!(nodes = nodes.len(), "bus discovered");

    let interval = config.tick_interval;
    let mut reports = Vec::new();
    for &op in selection.ops() {
        let report = bus.run_op_paced(op, config.max_ticks, |_| {
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        })?;
        info!(%report, "operation finished");
        reports.push(report);
    }
    Ok(reports)
}

fn main() {
    let filter = std::env::var("A2B_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match BusctlConfig::new(cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Commands::Run {
        op: OpSelection::Both,
        toml: false,
    });
    match command {
        Commands::ShowConfig => match toml::to_string_pretty(&config) {
            Ok(text) => print!("{text}"),
            Err(err) => {
                error!("failed to render config: {err}");
                std::process::exit(1);
            }
        },
        Commands::Run { op, toml } => {
            let reports = match run(&config, op) {
                Ok(reports) => reports,
                Err(err) => {
                    error!("bus run failed: {err}");
                    std::process::exit(1);
                }
            };
            for report in &reports {
                if toml {
                    match toml::to_string_pretty(report) {
                        Ok(text) => println!("{text}"),
                        Err(err) => error!("failed to render report: {err}"),
                    }
                } else {
                    println!("{report}");
                }
            }
            if !reports.iter().all(RunReport::succeeded) {
                std::process::exit(2);
            }
        }
    }
}
