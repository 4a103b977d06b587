mod sandbox;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use synq::SyncConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use sandbox::Scenario;

#[derive(Parser, Debug)]
#[command(name = "synq")]
#[command(about = "Run fetch orchestration scenarios against an in-memory table")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./synq.yaml, then $XDG_CONFIG_HOME/synq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(short, long)]
  verbose: bool,

  /// Write logs to a daily rolled file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[arg(value_enum)]
  scenario: Scenario,
}

/// Install the tracing subscriber. The returned guard flushes file logs on drop.
fn init_logging(args: &Args) -> Option<WorkerGuard> {
  let default_level = if args.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  match &args.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "synq.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(&args);

  // Load configuration
  let config = SyncConfig::load(args.config.as_deref())?;

  let report = sandbox::run(args.scenario, &config).await?;
  println!("{}", serde_json::to_string_pretty(&report)?);

  Ok(())
}
