//! Dex Operator - runs Dex identity providers and registers their OAuth2 clients

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use dex_common::kube_utils::create_client;
use dex_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use dex_common::ReconcilerConfig;
use dex_operator::controller_runner::build_controllers;
use dex_operator::startup::{crd_manifests, ensure_crds_installed};

/// Dex operator - manages Dex instances and DexClient registrations
#[derive(Parser, Debug)]
#[command(name = "dex-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run both controllers (default mode)
    Controller,
    /// Print the CRD manifests as YAML and exit
    Crd,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to a kubeconfig; in-cluster or default config when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Requeue delay after a failed reconciliation
    #[arg(long, env = "DEX_ERROR_BACKOFF_SECS", default_value_t = 30)]
    error_backoff_secs: u64,

    /// Requeue delay while a referenced instance is not ready
    #[arg(long, env = "DEX_DEPENDENCY_WAIT_SECS", default_value_t = 10)]
    dependency_wait_secs: u64,

    /// Requeue delay after a successful reconciliation
    #[arg(long, env = "DEX_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Timeout for each call to a Dex instance's gRPC API
    #[arg(long, env = "DEX_REGISTRAR_TIMEOUT_SECS", default_value_t = 10)]
    registrar_timeout_secs: u64,

    /// Timeout for connecting to a Dex instance's gRPC API
    #[arg(long, env = "DEX_REGISTRAR_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    registrar_connect_timeout_secs: u64,

    /// Do not install or update CRDs on startup
    #[arg(long, env = "DEX_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// Log line encoding
    #[arg(long, env = "DEX_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

impl RunArgs {
    fn reconciler_config(&self) -> anyhow::Result<ReconcilerConfig> {
        if self.registrar_connect_timeout_secs > self.registrar_timeout_secs {
            anyhow::bail!(
                "registrar connect timeout ({}s) exceeds the call timeout ({}s)",
                self.registrar_connect_timeout_secs,
                self.registrar_timeout_secs
            );
        }
        Ok(ReconcilerConfig {
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            dependency_wait: Duration::from_secs(self.dependency_wait_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            registrar_timeout: Duration::from_secs(self.registrar_timeout_secs),
            registrar_connect_timeout: Duration::from_secs(self.registrar_connect_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The registrar channels and the kube client both need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            print!("{}", crd_manifests()?);
            Ok(())
        }
        Some(Commands::Controller) | None => run_controller(cli.run).await,
    }
}

async fn run_controller(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        log_format: args.log_format.into(),
        ..Default::default()
    })?;

    let config = args.reconciler_config()?;
    tracing::info!(?config, "Starting Dex operator");

    let client = create_client(args.kubeconfig.as_deref()).await?;

    if args.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting controllers:");
    futures::future::join_all(build_controllers(client, config)).await;

    tracing::info!("Dex operator shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_reconciler_defaults() {
        let cli = Cli::try_parse_from(["dex-operator"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(!cli.run.skip_crd_install);
        assert_eq!(
            cli.run.reconciler_config().expect("config"),
            ReconcilerConfig::default()
        );
    }

    #[test]
    fn flags_override_intervals() {
        let cli = Cli::try_parse_from([
            "dex-operator",
            "--resync-secs",
            "60",
            "--error-backoff-secs",
            "5",
            "controller",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Some(Commands::Controller)));
        let config = cli.run.reconciler_config().expect("config");
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.error_backoff, Duration::from_secs(5));
    }

    #[test]
    fn connect_timeout_cannot_exceed_call_timeout() {
        let cli = Cli::try_parse_from([
            "dex-operator",
            "--registrar-timeout-secs",
            "2",
            "--registrar-connect-timeout-secs",
            "3",
        ])
        .expect("parse");
        assert!(cli.run.reconciler_config().is_err());
    }
}
