use clap::Parser;
use edge_autogw::{
    Result,
    config::{AutoGwConfig, Cli},
    controller, http,
};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let config = AutoGwConfig::load(&cli.config_file).await?;
    info!("loaded config from {}", cli.config_file.display());

    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();

    let mut metrics_handle = tokio::spawn(http::serve_metrics(
        cli.metrics_address,
        ready.child_token(),
        cancel.child_token(),
    ));
    let mut controller_handle =
        tokio::spawn(controller::start(config, ready, cancel.child_token()));
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut controller_handle => exit("controller", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, controller) = tokio::join!(metrics_handle, controller_handle);
            exit("metrics", metrics);
            exit("controller", controller);
        },
    };
    info!("Exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_autogw=info,edge_autogw_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
