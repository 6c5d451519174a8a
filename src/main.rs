use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use pghero_operator::controller::{self, KubeControlPlane, SqlxConnector};
use pghero_operator::{crd::Database, Error, OperatorConfig};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the Database CRD as YAML
    Crd,
    /// Show version information
    Version,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch (empty watches all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Databases reconciled in parallel
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,

    #[arg(long, env = "READY_REQUEUE_SECS", default_value_t = 300)]
    ready_requeue_secs: u64,

    #[arg(long, env = "CONFIGURING_REQUEUE_SECS", default_value_t = 30)]
    configuring_requeue_secs: u64,

    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 60)]
    error_requeue_secs: u64,

    /// Attempts at writing the ConfigMap before giving up on conflicts
    #[arg(long, env = "CONFLICT_RETRIES", default_value_t = 5)]
    conflict_retries: u32,

    #[arg(long, env = "DB_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    db_connect_timeout_secs: u64,

    #[arg(long, env = "DB_CONNECTION_LIFETIME_SECS", default_value_t = 10)]
    db_connection_lifetime_secs: u64,

    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,

    /// Port of the health/metrics/REST endpoint
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl RunArgs {
    fn operator_config(&self) -> Result<OperatorConfig, Error> {
        if self.concurrency == 0 {
            return Err(Error::ConfigError("--concurrency must be at least 1".to_string()));
        }
        if self.conflict_retries == 0 {
            return Err(Error::ConfigError("--conflict-retries must be at least 1".to_string()));
        }

        Ok(OperatorConfig {
            watch_namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            concurrency: self.concurrency,
            ready_requeue: Duration::from_secs(self.ready_requeue_secs),
            configuring_requeue: Duration::from_secs(self.configuring_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            conflict_retries: self.conflict_retries,
            db_connect_timeout: Duration::from_secs(self.db_connect_timeout_secs),
            db_connection_lifetime: Duration::from_secs(self.db_connection_lifetime_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            ..OperatorConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("PgHero Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Crd => {
            let yaml = serde_yaml::to_string(&Database::crd())
                .map_err(|e| Error::ConfigError(format!("Failed to render CRD: {}", e)))?;
            print!("{}", yaml);
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(format: LogFormat) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = pghero_operator::telemetry::init_telemetry(&registry)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format)?;

    let config = args.operator_config()?;

    info!("Starting PgHero Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let state = Arc::new(controller::ControllerState::new(
        Arc::new(KubeControlPlane::new(client.clone())),
        Arc::new(SqlxConnector::from_config(&config)),
        config,
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let port = args.http_port;
        tokio::spawn(async move {
            if let Err(e) = pghero_operator::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    let result = controller::run_controller(client, state).await;

    // Flush any remaining traces
    pghero_operator::telemetry::shutdown_telemetry();

    result
}
