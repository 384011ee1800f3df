use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fq2scribe::config::{BridgeConfig, BrokerAddr, DEFAULT_PROGRAM};
use fq2scribe::core::Orchestrator;
use fq2scribe::logger;

#[derive(Debug, Parser)]
#[command(name = "fq2scribe", about = "Relay fq broker traffic into Scribe")]
struct Cli {
    /// Broker to connect to, as HOST or HOST:PORT. Repeatable.
    #[arg(long = "fq", value_name = "HOST[:PORT]", required = true)]
    brokers: Vec<BrokerAddr>,

    /// Exchange to bind on each broker.
    #[arg(short, long, default_value = "logging")]
    exchange: String,

    /// Source (user) to authenticate as.
    #[arg(short, long, default_value = "fq2scribe")]
    source: String,

    /// Password to authenticate with.
    #[arg(short, long, default_value = "password")]
    password: String,

    /// Routing program for the binding.
    #[arg(long, default_value = DEFAULT_PROGRAM)]
    program: String,

    /// Scribe category to file relayed messages under.
    #[arg(long, default_value = "zipkin")]
    category: String,

    #[arg(long, default_value = "127.0.0.1")]
    scribe_host: String,

    #[arg(long, default_value_t = 1490)]
    scribe_port: u16,

    /// Log level, unless RUST_LOG overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            brokers: self.brokers,
            exchange: self.exchange,
            source: self.source,
            password: self.password,
            program: self.program,
            category: self.category,
            scribe_host: self.scribe_host,
            scribe_port: self.scribe_port,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = logger::init(&cli.log_level) {
        eprintln!("fq2scribe: {error}");
        std::process::exit(2);
    }

    let config = cli.into_config();
    let cancel = CancellationToken::new();

    let orchestrator = match Orchestrator::start(&config, cancel.clone()).await {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            error!(%error, "startup failed");
            std::process::exit(2);
        }
    };

    tokio::select! {
        _ = orchestrator.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                error!(%error, "signal handler failed");
            }
            info!("shutting down");
            cancel.cancel();
        }
    }
}
