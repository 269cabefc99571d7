//! lineq operator binary

use std::sync::Arc;

use clap::Parser;
use kube::CustomResourceExt;
use lineq_common::crd::WaitingRoom;
use lineq_common::kube_utils::create_client;
use lineq_common::leader_election::KubeLeaseLock;
use lineq_common::telemetry::{init_telemetry, TelemetryConfig};
use lineq_common::OPERATOR_NAME;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lineq_operator::backend::{HttpBackend, DEFAULT_REQUEST_TIMEOUT};
use lineq_operator::config::OperatorConfig;
use lineq_operator::controller::KubeIngressApi;
use lineq_operator::haproxy::{KubeConfigStore, SharedConfig, SharedConfigLayout};
use lineq_operator::runner::{run_ha, KubeWatchFactory, Operator};

/// lineq operator - waiting rooms for HAProxy-fronted services
#[derive(Parser, Debug)]
#[command(name = "lineq-operator", version, about, long_about = None)]
struct Cli {
    /// Print the WaitingRoom CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&WaitingRoom::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.config;
    init_telemetry(TelemetryConfig {
        service_name: OPERATOR_NAME.to_string(),
        otlp_endpoint: config.otlp_endpoint.clone(),
        log_level: config.log_level.clone(),
        json_logs: !config.is_local(),
    })?;
    config.validate()?;

    info!(
        workers = config.num_workers,
        ha = config.ha.enabled,
        haproxy_namespace = %config.haproxy_namespace,
        "Starting lineq operator"
    );

    let client = create_client(config.kubeconfig.as_deref()).await?;
    let backend = HttpBackend::new(
        &config.lineq.http_addr,
        config.lineq.http_port,
        DEFAULT_REQUEST_TIMEOUT,
    )?;
    let store = KubeConfigStore::new(client.clone(), &config.haproxy_namespace);
    let shared = SharedConfig::new(Arc::new(store), SharedConfigLayout::default())?;

    let operator = Operator::new(
        KubeWatchFactory::new(client.clone()),
        Arc::new(KubeIngressApi::new(client.clone())),
        Arc::new(shared),
        Arc::new(backend),
        config.lineq.clone(),
        config.num_workers,
    );

    let shutdown = shutdown_on_signal();

    if config.ha.enabled {
        let identity = config.ha.identity()?;
        let timing = config.ha.lease_timing();
        let lock = KubeLeaseLock::new(
            client,
            &config.ha.lease_lock_name,
            &config.namespace,
            &identity,
            timing.lease_duration,
        );
        run_ha(Arc::new(operator), lock, timing, shutdown).await?;
    } else {
        operator.run_standalone(shutdown).await?;
    }

    info!("Operator stopped");
    Ok(())
}

/// Token cancelled on SIGINT or SIGTERM
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
