use ibiop_install::controller::CONTROLLER_IDS;
use ibiop_install::image::InstallerImageBuilder;
use ibiop_k8s_util::parse::parse_duration;
use ibiop_operator::config::ServiceConfig;
use ibiop_operator::controller::State as IbiopState;
use ibiop_operator::telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, crate_authors, crate_description, crate_version};
use kube::Client;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Duration;

async fn metrics(State(state): State<IbiopState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name = "ibiop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port for the metrics and health endpoints
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,ibiop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Service name used to synthesize the image download URL
    #[arg(long, env = "SERVICE_NAME")]
    service_name: String,

    /// Namespace of the image serving service
    #[arg(long, env = "SERVICE_NAMESPACE")]
    service_namespace: String,

    /// URL scheme of the image serving service
    #[arg(long, default_value = "http", env = "SERVICE_SCHEME")]
    service_scheme: String,

    /// Optional port of the image serving service
    #[arg(long, env = "SERVICE_PORT")]
    service_port: Option<u16>,

    /// Root directory for per-intent workspaces
    #[arg(long, default_value = "/data", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Per-controller reconcile parallelism
    #[arg(long, default_value_t = 1, env = "MAX_CONCURRENT_RECONCILES")]
    max_concurrent_reconciles: u16,

    /// Wait after creating a DataImage before the host is rebooted
    #[arg(long, default_value = "1s", env = "DATA_IMAGE_COOLDOWN_PERIOD")]
    data_image_cooldown_period: String,

    /// Binary invoked to assemble the configuration ISO
    #[arg(long, default_value = "image-based-installer", env = "IMAGE_BUILDER_PATH")]
    image_builder_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let data_image_cooldown = parse_duration(&args.data_image_cooldown_period)
        .filter(|d| !d.is_negative())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "invalid DATA_IMAGE_COOLDOWN_PERIOD: {:?}",
                args.data_image_cooldown_period
            )
        })?;
    let service_config = ServiceConfig {
        service_name: args.service_name,
        service_namespace: args.service_namespace,
        service_scheme: args.service_scheme,
        service_port: args.service_port,
        data_dir: args.data_dir,
        max_concurrent_reconciles: args.max_concurrent_reconciles,
        data_image_cooldown: Duration::from_millis(data_image_cooldown.as_millis() as u64),
    };

    let client = Client::try_default().await?;
    let state = IbiopState::new(Registry::default(), &CONTROLLER_IDS, service_config);
    let image_builder = Arc::new(InstallerImageBuilder::new(args.image_builder_path));

    let controllers = ibiop_install::controller::run(state.clone(), client, image_builder);

    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::join!(controllers, server).1?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
