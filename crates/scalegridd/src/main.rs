//! scalegridd — the scalegrid daemon.
//!
//! # Usage
//!
//! ```text
//! scalegridd store --data-dir /var/lib/scalegrid
//! scalegridd run --config.file /etc/scalegrid/config.toml \
//!     --cluster.peers 10.0.0.2:8601,10.0.0.3:8601
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use scalegridd::config::{NodeConfig, RunArgs};
use scalegridd::store::StoreArgs;

#[derive(Parser)]
#[command(name = "scalegridd", about = "scalegrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long = "log.format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a control-plane node.
    Run(RunArgs),
    /// Serve the shared coordination store.
    Store(StoreArgs),
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scalegridd=debug,scalegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(args) => {
            let config = NodeConfig::load(&args)?;
            scalegridd::node::run(config).await
        }
        Command::Store(args) => scalegridd::store::run_store(args).await,
    }
}
