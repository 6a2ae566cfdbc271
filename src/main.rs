//! PV Upgrade Operator
//!
//! Command line entry point. `upgrade` converts a single legacy PV to a CSI
//! PV and prints the volume record; `serve` exposes the same workflow over
//! REST until interrupted.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pv_upgrade_operator::api::UpgradeVolumeResponse;
use pv_upgrade_operator::{
    ApiServer, ApiServerConfig, BackoffConfig, Error, HttpRegistryConfig, HttpVolumeRegistry,
    KubeGateway, KubeGatewayConfig, MemoryVolumeRegistry, MigrationType, PvUpgrader, Result,
    UpgradeConfig, UpgradeVolumeRequest, VolumeRegistryRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PV Upgrade Operator - convert legacy NFS/iSCSI PVs to CSI PVs in place
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Volume registry REST endpoint
    #[arg(long, env = "REGISTRY_ENDPOINT", conflicts_with = "volumes_file")]
    registry_endpoint: Option<String>,

    /// YAML file of volume records, used instead of a registry endpoint
    #[arg(long, env = "VOLUMES_FILE")]
    volumes_file: Option<PathBuf>,

    /// Registry request timeout in seconds
    #[arg(long, env = "REGISTRY_TIMEOUT", default_value = "30")]
    registry_timeout_secs: u64,

    /// First backoff interval in milliseconds
    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value = "1000")]
    backoff_initial_ms: u64,

    /// Backoff jitter, between 0 and 1
    #[arg(long, env = "BACKOFF_RANDOMIZATION", default_value = "0.1")]
    backoff_randomization: f64,

    /// Backoff growth factor
    #[arg(long, env = "BACKOFF_MULTIPLIER", default_value = "1.414")]
    backoff_multiplier: f64,

    /// Longest backoff interval in milliseconds
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "5000")]
    backoff_max_ms: u64,

    /// Seconds to wait for the legacy PV to be deleted
    #[arg(long, env = "PV_DELETE_WAIT", default_value = "30")]
    pv_delete_wait_secs: u64,

    /// Seconds to wait for each deleted pod to stop
    #[arg(long, env = "POD_DELETE_WAIT", default_value = "60")]
    pod_delete_wait_secs: u64,

    /// Seconds to wait for the PVC to become Lost or Bound
    #[arg(long, env = "PVC_PHASE_WAIT", default_value = "30")]
    pvc_phase_wait_secs: u64,

    /// CSI driver that serves upgraded PVs
    #[arg(long, env = "CSI_DRIVER", default_value = "csi.trident.netapp.io")]
    csi_driver: String,

    /// Provisioner that created the legacy PVs
    #[arg(long, env = "LEGACY_PROVISIONER", default_value = "netapp.io/trident")]
    legacy_provisioner: String,

    /// Seconds to wait for the PV and PVC caches to sync
    #[arg(long, env = "CACHE_SYNC_TIMEOUT", default_value = "60")]
    cache_sync_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upgrade one volume and print its record
    Upgrade {
        /// Volume (and PV) name
        #[arg(long)]
        volume: String,

        /// Migration type
        #[arg(long = "type", default_value = "csi")]
        migration_type: String,
    },
    /// Serve the upgrade REST API
    Serve {
        /// REST API bind address
        #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
        api_addr: String,
    },
}

impl Args {
    fn upgrade_config(&self) -> UpgradeConfig {
        UpgradeConfig {
            backoff: BackoffConfig {
                initial_interval: Duration::from_millis(self.backoff_initial_ms),
                randomization_factor: self.backoff_randomization,
                multiplier: self.backoff_multiplier,
                max_interval: Duration::from_millis(self.backoff_max_ms),
            },
            volume_delete_wait: Duration::from_secs(self.pv_delete_wait_secs),
            pod_delete_wait: Duration::from_secs(self.pod_delete_wait_secs),
            claim_phase_wait: Duration::from_secs(self.pvc_phase_wait_secs),
            csi_driver: self.csi_driver.clone(),
            legacy_provisioner: self.legacy_provisioner.clone(),
        }
    }

    fn volume_registry(&self) -> Result<VolumeRegistryRef> {
        match (&self.registry_endpoint, &self.volumes_file) {
            (Some(endpoint), _) => Ok(Arc::new(HttpVolumeRegistry::new(HttpRegistryConfig {
                endpoint: endpoint.clone(),
                timeout: Duration::from_secs(self.registry_timeout_secs),
            })?)),
            (None, Some(path)) => Ok(Arc::new(MemoryVolumeRegistry::from_yaml_file(path)?)),
            (None, None) => Err(Error::Configuration(
                "one of --registry-endpoint or --volumes-file is required".into(),
            )),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting PV Upgrade Operator");
    info!("  Version: {}", pv_upgrade_operator::VERSION);
    info!("  CSI driver: {}", args.csi_driver);
    info!("  Legacy provisioner: {}", args.legacy_provisioner);

    let config = args.upgrade_config();
    config.validate()?;
    let registry = args.volume_registry()?;

    let client = kube::Client::try_default().await?;
    let gateway = KubeGateway::start(
        client,
        KubeGatewayConfig {
            cache_sync_timeout: Duration::from_secs(args.cache_sync_secs),
            ..Default::default()
        },
    )
    .await?;

    let upgrader = PvUpgrader::new(config, registry, Arc::new(gateway))?;

    match args.command {
        Command::Upgrade {
            volume,
            migration_type,
        } => {
            let migration_type: MigrationType = migration_type.parse()?;
            let request = UpgradeVolumeRequest {
                volume,
                migration_type,
            };

            let volume = upgrader.upgrade_volume(&request).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&UpgradeVolumeResponse { volume })?
            );
        }
        Command::Serve { api_addr } => {
            let api_config = ApiServerConfig {
                rest_addr: api_addr.parse().map_err(|e| {
                    Error::Configuration(format!("Invalid REST API address: {}", e))
                })?,
            };
            let api_server = Arc::new(ApiServer::new(api_config, upgrader));

            let signal_server = api_server.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => signal_server.shutdown(),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
            });

            api_server.run().await?;
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    let result = if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialise logging: {}", e)))
}
