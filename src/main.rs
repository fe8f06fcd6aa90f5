//! peerlink - run one side of a cluster peering

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use peerlink::common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use peerlink::common::{StreamConfig, DEFAULT_DATACENTER, DEFAULT_PEERING_PORT, DEFAULT_TRUST_DOMAIN};
use peerlink::peering::{
    ExportedServicesConfig, Exporter, ExporterConfig, PeeringRegistry, PeeringStore, PeeringToken,
    TcpAcceptor, TcpTransport,
};
use peerlink::pki::CertificateAuthority;
use peerlink::proto::{EntryKey, ServiceEndpoint};
use peerlink::state::StateFile;

/// How often the state file is rewritten while running
const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// peerlink - cluster peering replication
#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about, long_about = None)]
struct Cli {
    /// Name of the local cluster
    #[arg(long, env = "PEERLINK_CLUSTER", default_value = "local", global = true)]
    cluster: String,

    /// Log line format
    #[arg(long, env = "PEERLINK_LOG_FORMAT", value_enum, default_value_t = Format::Json, global = true)]
    log_format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect peering tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },

    /// Run the accepting side: export services to peers
    Serve(ServeArgs),

    /// Run the dialing side: import services from an accepting cluster
    Dial(DialArgs),
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Print the contents of a token without its secret
    Decode {
        /// The encoded token
        token: String,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to accept replication streams on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PEERING_PORT)))]
    listen: SocketAddr,

    /// Addresses peers should dial, in preference order (defaults to --listen)
    #[arg(long = "advertise")]
    advertise: Vec<String>,

    /// Peer to generate a token for; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Local service as NAME=ADDRESS:PORT; repeatable
    #[arg(long = "service", value_parser = parse_service)]
    services: Vec<(String, String, u16)>,

    /// Export rule as SERVICE=CONSUMER (`*` for every service); repeatable
    #[arg(long = "export", value_parser = parse_export)]
    exports: Vec<(String, String)>,

    /// Datacenter name used in SNIs
    #[arg(long, env = "PEERLINK_DATACENTER", default_value = DEFAULT_DATACENTER)]
    datacenter: String,

    /// Trust domain used in SNIs and certificates
    #[arg(long, env = "PEERLINK_TRUST_DOMAIN", default_value = DEFAULT_TRUST_DOMAIN)]
    trust_domain: String,

    /// YAML file holding peering state across restarts
    #[arg(long, env = "PEERLINK_STATE")]
    state: Option<std::path::PathBuf>,
}

#[derive(Parser, Debug)]
struct DialArgs {
    /// Local name for the peering
    #[arg(long)]
    name: String,

    /// Token generated by the accepting cluster; omit to resume stored peerings
    #[arg(long, env = "PEERLINK_TOKEN")]
    token: Option<String>,

    /// YAML file holding peering state across restarts
    #[arg(long, env = "PEERLINK_STATE")]
    state: Option<std::path::PathBuf>,
}

fn parse_service(s: &str) -> Result<(String, String, u16), String> {
    let (name, target) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDRESS:PORT, got {s}"))?;
    let (address, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("expected ADDRESS:PORT, got {target}"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port {port}: {e}"))?;
    Ok((name.to_string(), address.to_string(), port))
}

fn parse_export(s: &str) -> Result<(String, String), String> {
    let (service, consumer) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=CONSUMER, got {s}"))?;
    Ok((service.to_string(), consumer.to_string()))
}

/// Token contents safe to print
#[derive(Serialize)]
struct TokenSummary {
    peer_id: String,
    server_name: String,
    server_addresses: Vec<String>,
    ca_roots: usize,
    expires_at: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        cluster_name: Some(cli.cluster.clone()),
        log_format: match cli.log_format {
            Format::Json => LogFormat::Json,
            Format::Pretty => LogFormat::Pretty,
        },
        ..TelemetryConfig::default()
    })?;

    match cli.command {
        Commands::Token {
            command: TokenCommand::Decode { token },
        } => decode_token(&token),
        Commands::Serve(args) => run_serve(&cli.cluster, args).await,
        Commands::Dial(args) => run_dial(args).await,
    }
}

fn decode_token(token: &str) -> anyhow::Result<()> {
    let token = PeeringToken::decode(token)?;
    let summary = TokenSummary {
        peer_id: token.peer_id,
        server_name: token.server_name,
        server_addresses: token.server_addresses,
        ca_roots: token.ca_roots.len(),
        expires_at: token.expires_at.map(|t| t.to_rfc3339()),
    };
    print!("{}", serde_yaml::to_string(&summary)?);
    Ok(())
}

async fn open_state(
    path: Option<std::path::PathBuf>,
) -> anyhow::Result<(Arc<peerlink::peering::MemoryStore>, Option<StateFile>)> {
    match path {
        Some(path) => {
            let file = StateFile::new(path);
            Ok((Arc::new(file.open_store().await?), Some(file)))
        }
        None => Ok((Arc::new(peerlink::peering::MemoryStore::new()), None)),
    }
}

/// Save the store every [`SAVE_INTERVAL`] and once more on shutdown
fn spawn_saver(
    file: Option<StateFile>,
    store: Arc<peerlink::peering::MemoryStore>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(file) = file else {
            return;
        };
        let mut ticker = tokio::time::interval(SAVE_INTERVAL);
        loop {
            let stopping = tokio::select! {
                _ = shutdown.cancelled() => true,
                _ = ticker.tick() => false,
            };
            if let Err(e) = file.save(&store).await {
                tracing::warn!(error = %e, "failed to save state");
            }
            if stopping {
                break;
            }
        }
    })
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
        }
        token.cancel();
    });
    shutdown
}

async fn run_serve(cluster: &str, args: ServeArgs) -> anyhow::Result<()> {
    let config = StreamConfig::from_env();
    let (store, file) = open_state(args.state).await?;

    let ca = CertificateAuthority::new(cluster, &args.trust_domain)?;
    let advertise = if args.advertise.is_empty() {
        vec![args.listen.to_string()]
    } else {
        args.advertise
    };
    let exporter = Exporter::new(
        ExporterConfig {
            datacenter: args.datacenter.clone(),
            trust_domain: args.trust_domain.clone(),
            server_name: format!("server.{}.peering.{}", args.datacenter, args.trust_domain),
            stream: config.clone(),
            token_ttl: None,
        },
        store.clone(),
        vec![ca.cert_pem().to_string()],
        advertise,
    )?;

    for (name, address, port) in args.services {
        exporter
            .register_service(
                EntryKey::new(name),
                vec![ServiceEndpoint::new(cluster, address, port)],
            )
            .await?;
    }
    let exports = args
        .exports
        .iter()
        .fold(ExportedServicesConfig::new(), |config, (service, consumer)| {
            config.export(service, consumer)
        });
    exporter.set_exported_services(exports).await?;

    for peer in &args.peers {
        let token = exporter.generate_token(peer).await?;
        println!("{peer}: {token}");
    }

    let acceptor = TcpAcceptor::bind(&args.listen.to_string(), config.max_frame_bytes).await?;
    tracing::info!(address = %acceptor.local_addr()?, "accepting replication streams");

    let shutdown = shutdown_on_ctrl_c();
    let saver = spawn_saver(file, store, shutdown.clone());
    exporter.serve(acceptor, shutdown).await;
    saver.await?;
    Ok(())
}

async fn run_dial(args: DialArgs) -> anyhow::Result<()> {
    let config = StreamConfig::from_env();
    let (store, file) = open_state(args.state).await?;
    let registry = PeeringRegistry::new(
        store.clone(),
        Arc::new(TcpTransport::new(config.max_frame_bytes)),
        config,
    );

    let resumed = registry.resume_all().await?;
    tracing::info!(resumed, "resumed stored peerings");
    if let Some(token) = args.token {
        let live = store
            .get_by_name(&args.name)
            .await?
            .is_some_and(|r| r.is_live());
        if !live {
            let record = registry.establish(&args.name, &token).await?;
            tracing::info!(peering = %record.name, id = %record.id, "peering established");
        }
    }

    let shutdown = shutdown_on_ctrl_c();
    let saver = spawn_saver(file, store, shutdown.clone());
    shutdown.cancelled().await;
    registry.shutdown().await;
    saver.await?;
    Ok(())
}
