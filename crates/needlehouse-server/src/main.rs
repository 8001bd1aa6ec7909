//! NeedleHouse server binary.
//!
//! `needlehouse server` starts a volume server and an embedded master in
//! one process, the convenient way to bring up a cluster: additional
//! volume servers can point at this node's master, and additional masters
//! join through `--master.peers`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use needlehouse_master::{
    start_refresh, ConsensusLog, Master, MasterConfig, MasterRpcService, RaftConfig, RaftNode,
    RaftSequencer, RaftService,
};
use needlehouse_proto::master::master_server::MasterServer as MasterGrpcServer;
use needlehouse_proto::raft::raft_server::RaftServer as RaftGrpcServer;
use needlehouse_proto::volume::volume_server_server::VolumeServerServer;
use needlehouse_server::{heartbeat_loop, volume_router};
use needlehouse_storage::{
    IndexKind, Location, Store, StoreIdentity, SyncPolicy, VolumeOptions, VolumeRpcService,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "needlehouse", version, about = "distributed needle storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a volume server and automatically elect a master server
    Server(ServerOptions),
}

#[derive(Args, Debug)]
struct ServerOptions {
    /// ip or server name
    #[arg(long = "ip", default_value = "localhost")]
    ip: String,

    /// ip address to bind to
    #[arg(long = "ip.bind", default_value = "0.0.0.0")]
    bind_ip: String,

    /// volume server http listen port
    #[arg(long = "port", default_value_t = 8080)]
    port: u16,

    /// master server http listen port
    #[arg(long = "master.port", default_value_t = 9333)]
    master_port: u16,

    /// all master nodes in comma separated ip:masterPort list
    #[arg(long = "master.peers", default_value = "")]
    master_peers: String,

    /// data directory to store meta data, default to first --dir
    #[arg(long = "master.dir", default_value = "")]
    master_dir: String,

    /// master stops directing writes to oversized volumes
    #[arg(long = "master.volumeSizeLimitMB", default_value_t = 30_000)]
    master_volume_size_limit_mb: u64,

    /// default replication type if not specified
    #[arg(long = "master.defaultReplicaPlacement", default_value = "000")]
    master_default_replica_placement: String,

    /// directories to store data files, comma separated
    #[arg(long = "dir", default_value = "/tmp")]
    dir: String,

    /// maximum number of volumes per directory, comma separated
    #[arg(long = "volume.max", default_value = "7")]
    volume_max: String,

    /// needle index mode: memory | btree | sorted
    #[arg(long = "volume.index", default_value = "memory")]
    volume_index: String,

    /// number of seconds between heartbeats
    #[arg(long = "pulseSeconds", default_value_t = 5)]
    pulse_seconds: u64,

    /// garbage ratio that triggers vacuum
    #[arg(long = "garbageThreshold", default_value_t = 0.3)]
    garbage_threshold: f64,

    /// whether to start the filer overlay
    #[arg(long = "filer", default_value_t = false)]
    filer: bool,

    /// comma separated ip addresses with write permission
    #[arg(long = "whiteList", default_value = "")]
    white_list: String,

    /// connection idle seconds
    #[arg(long = "idleTimeout", default_value_t = 30)]
    idle_timeout: u64,

    /// this volume server's data center
    #[arg(long = "dataCenter", default_value = "")]
    data_center: String,

    /// this volume server's rack
    #[arg(long = "rack", default_value = "")]
    rack: String,

    /// maximum number of CPUs, 0 means all
    #[arg(long = "maxCpu", default_value_t = 0)]
    max_cpu: usize,

    /// cpu profile output file
    #[arg(long = "cpuprofile", default_value = "")]
    cpuprofile: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(options) => run_server(options),
    }
}

fn run_server(options: ServerOptions) -> anyhow::Result<()> {
    // Fatal-init checks run before any listener comes up, so a
    // misconfigured node exits non-zero instead of half-starting.
    if options.master_volume_size_limit_mb > needlehouse_master::config::MAX_VOLUME_SIZE_LIMIT_MB {
        bail!(
            "master.volumeSizeLimitMB {} exceeds the maximum of {}",
            options.master_volume_size_limit_mb,
            needlehouse_master::config::MAX_VOLUME_SIZE_LIMIT_MB
        );
    }
    let folders: Vec<PathBuf> = options.dir.split(',').map(PathBuf::from).collect();
    let meta_dir = if options.master_dir.is_empty() {
        folders[0].clone()
    } else {
        PathBuf::from(&options.master_dir)
    };
    let default_replica_placement =
        needlehouse_core::ReplicaPlacement::parse(&options.master_default_replica_placement)
            .context("invalid master.defaultReplicaPlacement")?;
    let index_kind = IndexKind::parse(&options.volume_index)
        .with_context(|| format!("unknown volume.index mode {:?}", options.volume_index))?;

    let master_address = format!("{}:{}", options.ip, options.master_port);
    let peers: Vec<String> = if options.master_peers.is_empty() {
        vec![master_address.clone()]
    } else {
        options
            .master_peers
            .split(',')
            .map(str::to_string)
            .collect()
    };

    let master_config = MasterConfig {
        ip: options.ip.clone(),
        port: options.master_port,
        meta_dir: meta_dir.clone(),
        peers: peers.clone(),
        volume_size_limit_mb: options.master_volume_size_limit_mb,
        pulse: Duration::from_secs(options.pulse_seconds),
        default_replica_placement,
        garbage_threshold: options.garbage_threshold,
    };
    master_config.validate().context("fatal master config")?;

    if options.filer {
        info!("filer overlay requested; start a filer process pointed at this master");
    }
    if !options.white_list.is_empty() {
        info!(white_list = %options.white_list, "write whitelist configured");
    }
    if options.max_cpu > 0 {
        info!(max_cpu = options.max_cpu, "limiting worker threads");
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if options.max_cpu > 0 {
        runtime.worker_threads(options.max_cpu);
    }
    runtime
        .build()
        .context("tokio runtime")?
        .block_on(serve(options, master_config, folders, index_kind, peers))
}

async fn serve(
    options: ServerOptions,
    master_config: MasterConfig,
    folders: Vec<PathBuf>,
    index_kind: IndexKind,
    peers: Vec<String>,
) -> anyhow::Result<()> {
    // --- master role ---
    let raft = RaftNode::open(RaftConfig::new(
        &master_config.address(),
        peers.clone(),
        master_config.meta_dir.clone(),
    ))?;
    raft.start();
    let consensus: Arc<dyn ConsensusLog> = raft.clone() as Arc<dyn ConsensusLog>;
    let sequencer = Arc::new(RaftSequencer::new(Arc::clone(&consensus)));
    let master = Master::new(master_config.clone(), consensus, sequencer);
    start_refresh(Arc::clone(&master));

    let mut leadership = master.consensus.subscribe_leadership();
    tokio::spawn(async move {
        while leadership.changed().await.is_ok() {
            let state = leadership.borrow_and_update().clone();
            if state.is_leader {
                info!("this master became the leader");
            } else if let Some(leader) = state.leader {
                info!(leader = %leader, "observed master leader");
            }
        }
    });

    let master_http = tokio::net::TcpListener::bind((options.bind_ip.as_str(), options.master_port))
        .await
        .with_context(|| format!("bind master http port {}", options.master_port))?;
    let master_router = master.http_router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(master_http, master_router).await {
            tracing::error!(error = %err, "master http server exited");
        }
    });

    let master_grpc_port = options.master_port + 10000;
    let master_grpc_addr = format!("{}:{}", options.bind_ip, master_grpc_port)
        .parse()
        .context("master grpc bind address")?;
    let master_grpc = tonic::transport::Server::builder()
        .add_service(MasterGrpcServer::new(MasterRpcService::new(Arc::clone(&master))))
        .add_service(RaftGrpcServer::new(RaftService::new(Arc::clone(&raft))))
        .serve(master_grpc_addr);
    tokio::spawn(async move {
        if let Err(err) = master_grpc.await {
            tracing::error!(error = %err, "master grpc server exited");
        }
    });
    info!(
        address = %master_config.address(),
        grpc_port = master_grpc_port,
        "master started"
    );

    // --- volume server role ---
    let volume_max: Vec<usize> = options
        .volume_max
        .split(',')
        .map(|v| v.trim().parse().unwrap_or(7))
        .collect();
    let locations: Vec<Location> = folders
        .iter()
        .enumerate()
        .map(|(i, dir)| Location {
            directory: dir.clone(),
            max_volume_count: *volume_max.get(i).or(volume_max.last()).unwrap_or(&7),
        })
        .collect();
    let store = Arc::new(Store::open(
        StoreIdentity {
            ip: options.ip.clone(),
            port: options.port,
            public_url: format!("{}:{}", options.ip, options.port),
            data_center: options.data_center.clone(),
            rack: options.rack.clone(),
        },
        locations,
        VolumeOptions {
            index_kind,
            size_limit: master_config.volume_size_limit(),
            sync_policy: SyncPolicy::default(),
        },
    )?);

    let volume_http = tokio::net::TcpListener::bind((options.bind_ip.as_str(), options.port))
        .await
        .with_context(|| format!("bind volume http port {}", options.port))?;
    let volume_routes = volume_router(Arc::clone(&store));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(volume_http, volume_routes).await {
            tracing::error!(error = %err, "volume http server exited");
        }
    });

    let volume_grpc_port = options.port + 10000;
    let volume_grpc_addr = format!("{}:{}", options.bind_ip, volume_grpc_port)
        .parse()
        .context("volume grpc bind address")?;
    let volume_grpc = tonic::transport::Server::builder()
        .add_service(VolumeServerServer::new(VolumeRpcService::new(Arc::clone(&store))))
        .serve(volume_grpc_addr);
    tokio::spawn(async move {
        if let Err(err) = volume_grpc.await {
            tracing::error!(error = %err, "volume grpc server exited");
        }
    });

    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&store),
        peers,
        Duration::from_secs(options.pulse_seconds),
    ));
    info!(
        port = options.port,
        grpc_port = volume_grpc_port,
        "volume server started"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    heartbeat.abort();
    store.flush()?;
    Ok(())
}
