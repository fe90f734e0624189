//! Stratus operator - provisions cloud infrastructure for workload clusters

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use stratus_cloud::{HttpConnector, LimiterRegistry};
use stratus_common::crd::all_crds;
use stratus_common::kube_utils::create_client;
use stratus_common::telemetry::{init_telemetry, TelemetryConfig};
use stratus_common::{CloudAccess, KubeSecretStore, FIELD_MANAGER};
use stratus_operator::{build_all, ControllerArgs, Shared};

/// Stratus - Kubernetes operator for Stratus cloud infrastructure
#[derive(Parser, Debug)]
#[command(name = "stratus-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Install or update every Stratus CRD with server-side apply, so the
/// served schema always matches this build
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("CRD without a name"))?;
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {}: {}", name, e))?;
    }

    tracing::info!("All Stratus CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = create_client(args.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;

    let config = args.controller_config();
    let limiters = Arc::new(LimiterRegistry::new(config.limiter.clone()));
    let connector = HttpConnector::new(args.api_url.clone(), args.http_timeout(), limiters.clone())?;
    let default_credentials = args.default_credentials();
    if default_credentials.is_none() {
        tracing::warn!("No default API token; resources must set credentialsRef");
    }
    let cloud = CloudAccess::new(
        Arc::new(connector),
        Arc::new(KubeSecretStore::new(client.clone())),
        default_credentials,
    );

    tracing::info!(api_url = %args.api_url, concurrency = args.concurrency, "Starting controllers");
    let shared = Shared {
        client,
        cloud,
        limiters,
        config,
        concurrency: args.concurrency,
    };
    futures::future::join_all(build_all(&shared)).await;

    tracing::info!("Controllers stopped");
    Ok(())
}
