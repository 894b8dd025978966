//! Offload agent entry point.
//!
//! Brings up the NIC, installs the flow programs, runs the forwarding loop
//! until SIGINT or SIGTERM and tears everything down again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use offload_agent::config::ConfigError;
use offload_agent::flow::FlowStage;
use offload_agent::{AgentConfig, AgentError, OffloadAgent};
use offload_hal::sim::SimNic;
use offload_hal::{EthDevApi, NicDriver};
use tokio_util::sync::CancellationToken;

/// NIC hairpin and flow-rule offload agent
#[derive(Parser, Debug)]
#[command(name = "offloadagent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Number of simulated NIC ports
    #[arg(short = 'p', long, default_value = "2")]
    ports: u16,

    /// Frames generated per empty receive poll on every simulated port
    #[arg(long, default_value = "0")]
    synthetic_rx: usize,

    /// Standard queues per port
    #[arg(long)]
    standard_queues: Option<u16>,

    /// Hairpin queues per port
    #[arg(long)]
    hairpin_queues: Option<u16>,

    /// Packet buffers in the shared pool
    #[arg(long)]
    pool_size: Option<usize>,

    /// Packets per receive burst
    #[arg(short = 'b', long)]
    burst_size: Option<usize>,

    /// Consecutive retryable counter-query failures tolerated
    #[arg(long)]
    counter_failure_budget: Option<u32>,

    /// Optional flow stage to install (repeatable)
    #[arg(long = "enable-stage")]
    enable_stages: Vec<FlowStage>,
}

impl Args {
    /// Loads the config file, if any, and applies command-line overrides.
    fn load_config(&self) -> Result<AgentConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(n) = self.standard_queues {
            config.ports.standard_queues = n;
        }
        if let Some(n) = self.hairpin_queues {
            config.ports.hairpin_queues = n;
        }
        if let Some(n) = self.pool_size {
            config.pool.size = n;
        }
        if let Some(n) = self.burst_size {
            config.forwarding.burst_size = n;
        }
        if let Some(n) = self.counter_failure_budget {
            config.forwarding.counter_failure_budget = n;
        }
        for stage in &self.enable_stages {
            if !config.flows.optional_stages.contains(stage) {
                config.flows.optional_stages.push(*stage);
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Resolves when SIGINT or SIGTERM arrives, naming the signal.
async fn wait_for_signal() -> &'static str {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("====================================================================");
    info!("Starting offloadagent");
    info!("====================================================================");

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Queues: {} standard + {} hairpin, ring depth {}",
        config.ports.standard_queues, config.ports.hairpin_queues, config.ports.ring_depth
    );
    info!("Pool: {} buffers", config.pool.size);
    if !config.flows.optional_stages.is_empty() {
        info!("Optional stages: {:?}", config.flows.optional_stages);
    }

    let nic = Arc::new(SimNic::with_ports(args.ports));
    if args.synthetic_rx > 0 {
        for port in nic.available_ports() {
            nic.set_synthetic_rx(port, args.synthetic_rx);
        }
    }
    let driver: Arc<dyn NicDriver> = nic;
    let mut agent = OffloadAgent::new(config, driver);

    if let Err(e) = agent.init().await {
        error!("Setup failed [{}]: {}", e.class(), e);
        agent.shutdown();
        return ExitCode::FAILURE;
    }

    let forwarding = match agent.forwarding_loop() {
        Ok(forwarding) => forwarding,
        Err(e) => {
            error!("{}", e);
            agent.shutdown();
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let name = wait_for_signal().await;
            warn!("Received {}, shutting down gracefully...", name);
            cancel.cancel();
        })
    };

    info!("Starting forwarding loop...");
    let worker = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || forwarding.run(cancel))
    };

    let mut code = ExitCode::SUCCESS;
    match worker.await {
        Ok(Ok(stats)) => info!(
            "Forwarded {} packets ({} dropped) in {} passes",
            stats.tx, stats.dropped, stats.passes
        ),
        Ok(Err(e)) => {
            let e = AgentError::from(e);
            error!("Forwarding stopped [{}]: {}", e.class(), e);
            code = ExitCode::FAILURE;
        }
        Err(e) => {
            error!("Forwarding worker failed: {}", e);
            code = ExitCode::FAILURE;
        }
    }
    signal_handle.abort();

    let report = agent.shutdown();
    if !report.is_clean() {
        code = ExitCode::FAILURE;
    }

    info!("====================================================================");
    info!("offloadagent shutdown complete");
    info!("====================================================================");

    code
}
