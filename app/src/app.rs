use crate::metrics;
use crate::rng::SimRng;
use crate::spec::{fleet_value_parser, FleetSpec};
use crate::system::Orchestrator;
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::time::Duration;
use std::{future::Future, sync::Arc};
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "chaosd", long_about = None)]
pub struct App {
    /// Fleet specification: a JSON file path, or `dev` for the built-in fleet
    #[arg(
        long = "fleet",
        value_name = "FLEET_OR_PATH",
        value_parser = fleet_value_parser,
        default_value = "dev"
    )]
    pub fleet: FleetSpec,

    /// Seed for the simulation RNG; drawn from entropy when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Synthetic traffic rate; 0 disables the generator
    #[arg(long = "traffic-rps", default_value_t = 10.0)]
    pub traffic_rps: f64,

    /// Stop the traffic generator after this many seconds (forever if unset)
    #[arg(long = "traffic-duration")]
    pub traffic_duration: Option<u64>,

    /// Flag to disable the chaos monkey regardless of the fleet spec
    #[arg(long = "no-chaos", default_value_t = false)]
    pub no_chaos: bool,

    #[arg(long = "rust-log-level", env = "RUST_LOG", default_value = "info")]
    pub rust_log_level: Level,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(async {
            let orchestrator = self.execute().await?;
            run_until_ctrl_c(watch_fleet(orchestrator.clone())).await?;
            orchestrator.stop().await;
            Ok::<_, eyre::Error>(())
        })?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = self.rust_log_level;

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("app={rust_log_level},resilience={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    async fn execute(self) -> Result<Arc<Orchestrator>> {
        let rng = match self.seed {
            Some(seed) => {
                info!("simulation rng seeded with {seed}");
                SimRng::seeded(seed)
            }
            None => SimRng::from_entropy(),
        };

        let mut fleet = self.fleet;
        if self.no_chaos {
            info!("chaos monkey disabled from the command line");
            fleet.enabled = false;
        }

        let orchestrator = Orchestrator::build("chaosd", fleet, rng).await?;

        wire_exposition(&orchestrator);
        metrics::start_server(self.metrics_port).await;

        orchestrator.start().await;

        if self.traffic_rps > 0.0 {
            let duration = self.traffic_duration.map(Duration::from_secs);
            orchestrator
                .balancer()
                .simulate_traffic(self.traffic_rps, duration)
                .await;
        }

        Ok(orchestrator)
    }
}

/// Prometheus counters ride the component callbacks, so the exposition
/// server needs no hooks inside the simulation itself.
fn wire_exposition(orchestrator: &Arc<Orchestrator>) {
    let runner = orchestrator.runner();
    runner.on_start(|_| metrics::EXPERIMENTS_STARTED.inc());
    runner.on_complete(|_| metrics::EXPERIMENTS_COMPLETED.inc());
    runner.on_cancel(|_| metrics::EXPERIMENTS_CANCELLED.inc());
    runner.on_fail(|report| {
        metrics::EXPERIMENTS_FAILED.inc();
        if let Some(reason) = &report.error_message {
            warn!("experiment {} failed: {reason}", report.id);
        }
    });

    orchestrator
        .monkey()
        .add_termination_callback(|service, instance| {
            metrics::INSTANCES_TERMINATED.inc();
            info!("chaos monkey terminated {service}/{instance}");
        });

    orchestrator.monitoring().alerts().on_alert(|alert| {
        warn!(
            "alert [{}] {} on {}: {}",
            alert.severity, alert.metric, alert.service, alert.message
        );
    });
}

/// Once-a-minute heartbeat so an idle daemon still shows a pulse in the
/// logs. Runs until the process is signalled.
async fn watch_fleet(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let status = orchestrator.system_status().await;
        let services = status["services"].as_object().map(|s| s.len()).unwrap_or(0);
        info!(
            "fleet: {services} services, {} open alerts, {} active experiments",
            orchestrator.monitoring().alerts().open_count(),
            orchestrator.runner().active_count().await,
        );
    }
}

// async code taken from reth, when we add more complexity we should adopt
// the task manager logic to handle thread spawning and graceful shutdown
pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
