use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use console::style;
use uds_timeouts::{
   Experiment, ExperimentReport, Phase,
   config::{self, Config},
};

#[derive(Parser)]
#[command(name = "uds-timeouts")]
#[command(about = "Watch connect, read and write deadlines play out over a Unix domain socket")]
#[command(version)]
struct Cli {
   #[arg(short, long, env = "UDS_TIMEOUTS_CONFIG", help = "TOML file overriding the defaults")]
   config: Option<PathBuf>,

   #[arg(long, value_enum, default_value = "all", help = "Which phase to run")]
   phase: PhaseArg,

   #[arg(long, help = "Print the effective configuration and exit")]
   print_config: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
   Dead,
   Idle,
   Full,
   All,
}

impl PhaseArg {
   fn phases(self) -> Vec<Phase> {
      match self {
         Self::Dead => vec![Phase::DeadServer],
         Self::Idle => vec![Phase::IdleListener],
         Self::Full => vec![Phase::FullExchange],
         Self::All => Phase::ALL.to_vec(),
      }
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   tracing_subscriber::fmt()
      .with_env_filter(
         tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()),
      )
      .with_target(false)
      .init();

   let cli = Cli::parse();
   let path = cli
      .config
      .or_else(|| Some(config::default_config_path()).filter(|p| p.exists()));
   let config = Config::load(path.as_deref())?;

   if cli.print_config {
      print!("{}", config.to_toml()?);
      return Ok(());
   }

   let (experiment, report) = match run(&config, &cli.phase.phases()).await {
      Ok(done) => done,
      Err(e) => {
         println!("{e}");
         return Ok(());
      },
   };

   println!("\n{}", style("Summary").bold());
   for phase in &report.phases {
      let verdict = if experiment.as_expected(phase) {
         style("as expected").green()
      } else {
         style("unexpected").red()
      };
      println!(
         "  {} {} {}",
         verdict,
         phase.phase,
         style(format!("({:.2?})", phase.elapsed)).dim()
      );
   }

   Ok(())
}

async fn run(
   config: &Config,
   phases: &[Phase],
) -> uds_timeouts::Result<(Experiment, ExperimentReport)> {
   let experiment = Experiment::new(config)?;
   let report = experiment.run(phases).await?;
   Ok((experiment, report))
}
