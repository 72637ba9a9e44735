mod health;
mod rest;
mod settings;

use anyhow::Context;
use clap::{Parser, Subcommand};
use datagrid_cluster::{Locator, LocatorRegistry, MembershipHandle};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rest::AppState;
use settings::ServerSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "datagrid-server", version, about = "Run a datagrid locator or member")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Locator list, e.g. `host1[10334],host2[10334]`
    #[arg(long, global = true)]
    locators: Option<String>,

    /// Address of the HTTP status surface
    #[arg(long, global = true)]
    http: Option<SocketAddr>,

    /// Disable the HTTP status surface
    #[arg(long, global = true)]
    no_http: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a locator, hosting a member unless told otherwise
    Locator {
        #[arg(short, long)]
        port: Option<u16>,

        /// Where the locator remembers its last view
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Serve discovery only
        #[arg(long)]
        no_member: bool,
    },
    /// Join the cluster as a normal member
    Member,
}

enum Node {
    Locator(Locator),
    Member(MembershipHandle),
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // dependency chatter stays muted unless RUST_LOG asks for it
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,tower_http=warn", default_level))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus exporter not installed: {}", e);
            None
        }
    }
}

fn apply_cli(settings: &mut ServerSettings, cli: &Cli) {
    if let Some(locators) = &cli.locators {
        settings.membership.locators = locators.clone();
    }
    if let Some(http) = cli.http {
        settings.http.bind = http;
    }
    if cli.no_http {
        settings.http.enabled = false;
    }

    if let Command::Locator {
        port,
        state_file,
        no_member,
    } = &cli.command
    {
        if let Some(port) = port {
            settings.locator.port = *port;
        }
        if let Some(path) = state_file {
            settings.locator.state_file = Some(path.clone());
        }
        if *no_member {
            settings.locator.host_member = false;
        }
    }
}

async fn start_node(settings: &ServerSettings, command: &Command) -> anyhow::Result<Node> {
    match command {
        Command::Locator { .. } => {
            let locator = Locator::start(
                LocatorRegistry::global(),
                settings.locator.to_config(),
                settings.membership.clone(),
            )
            .await
            .context("failed to start locator")?;
            Ok(Node::Locator(locator))
        }
        Command::Member => {
            let handle = MembershipHandle::connect(settings.membership.clone())
                .await
                .context("failed to join the cluster")?;
            Ok(Node::Member(handle))
        }
    }
}

async fn stop_node(node: Node) {
    let result = match &node {
        Node::Locator(locator) => locator.stop().await,
        Node::Member(handle) => handle.disconnect().await,
    };
    if let Err(e) = result {
        error!("Error while leaving the cluster: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = ServerSettings::load(cli.config.as_deref())?;
    apply_cli(&mut settings, &cli);
    settings.membership.validate_settings()?;

    let metrics = install_metrics();
    let node = start_node(&settings, &cli.command).await?;

    let state = match &node {
        Node::Locator(locator) => AppState::new(
            locator.hosted_member(),
            Some(locator.endpoint()),
            metrics,
        ),
        Node::Member(handle) => AppState::new(Some(handle.clone()), None, metrics),
    };
    if let Some(member) = &state.member {
        info!(
            "Member running: member={}, state={}, view_id={:?}",
            member.local_member(),
            member.state(),
            member.current_view().map(|v| v.id())
        );
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let http = if settings.http.enabled {
        let bind = settings.http.bind;
        Some(tokio::spawn(rest::start_rest_server(bind, state, async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    stop_node(node).await;
    let _ = shutdown_tx.send(true);
    if let Some(http) = http {
        match http.await {
            Ok(Err(e)) => error!("Status server failed: {}", e),
            Err(e) => error!("Status server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}
