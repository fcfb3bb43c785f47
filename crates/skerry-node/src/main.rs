use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use skerry_balancer::{balancer_service, Balancer};
use skerry_client::ClusterClient;
use skerry_consensus::{RaftConfig, RaftReplica};
use skerry_partition::{partition_service, Partition};
use skerry_server::{serve_cluster, serve_http, AppState, ShardReplica, ShardState};
use skerry_storage::fjall::{FjallEngine, FjallLogStore, FjallStore};

#[derive(Parser, Debug)]
#[command(name = "skerry-node", about = "Skerry distributed KV node")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: String,
    #[arg(long, default_value = "node-1")]
    node_id: String,
    /// Enable consensus replication for the node's key space.
    #[arg(long)]
    enable_raft: bool,
    #[arg(long, default_value = "127.0.0.1:12000")]
    raft_addr: String,
    /// HTTP address of an existing node to join (e.g. http://host:8080).
    #[arg(long)]
    join: Option<String>,
    /// Number of per-shard replicas to host (0 = disabled).
    #[arg(long, default_value_t = 0)]
    shard_count: u16,
    /// Base port for per-shard consensus; shard i listens on base + i.
    #[arg(long, default_value_t = 12000)]
    raft_base_port: u16,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the 2PC coordinator.
    Balancer {
        #[arg(long, default_value = "0.0.0.0:50051")]
        listen: String,
        #[arg(long, default_value = "./balancer-db")]
        data_dir: PathBuf,
        /// Target number of replicated ranges the coverage is seeded with.
        #[arg(long, default_value_t = 0)]
        goal_replica_ranges: u64,
    },
    /// Run a 2PC partition replica.
    Partition {
        #[arg(long, default_value = "0.0.0.0:50052")]
        listen: String,
        #[arg(long, default_value = "./partition-db")]
        data_dir: PathBuf,
        /// Balancer address to register with at startup.
        #[arg(long)]
        register: Option<String>,
        /// Address the balancer should dial back; defaults to `listen`.
        #[arg(long)]
        advertise: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[allow(dead_code)]
    read_timeout_ms: u64,
    #[allow(dead_code)]
    write_timeout_ms: u64,
    join_retry_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    raft: RaftConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut figment =
        Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(path) = path {
        figment = figment.merge(Toml::file_exact(path));
    }
    figment
        .merge(Env::prefixed("SKERRY_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn init_tracing(observability: &ObservabilityConfig) {
    match observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&observability.log_level)
                .init();
        }
    }
}

fn parse_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse().with_context(|| format!("invalid listen address: {addr}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.node.config.as_ref())?;
    init_tracing(&config.observability);

    match cli.mode {
        None => run_node(cli.node, config).await,
        Some(Mode::Balancer { listen, data_dir, goal_replica_ranges }) => {
            run_balancer(listen, data_dir, goal_replica_ranges).await
        }
        Some(Mode::Partition { listen, data_dir, register, advertise }) => {
            run_partition(listen, data_dir, register, advertise).await
        }
    }
}

async fn run_node(args: NodeArgs, config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data dir {:?}", args.data_dir))?;

    let store = FjallStore::open(&args.data_dir).context("open store")?;
    let engine = Arc::new(FjallEngine(store.clone()));

    tracing::info!(
        node_id = %args.node_id,
        http_addr = %args.http_addr,
        data_dir = ?args.data_dir,
        enable_raft = args.enable_raft,
        "node starting"
    );

    let replica = if args.enable_raft {
        let replica = RaftReplica::start(
            args.node_id.clone(),
            args.raft_addr.clone(),
            config.raft.clone(),
            engine.clone(),
            Arc::new(FjallLogStore(store.clone())),
            args.join.is_some(),
        )
        .await?;

        let cluster_addr = parse_addr(&args.raft_addr)?;
        tokio::spawn(serve_cluster(cluster_addr, replica.clone()));

        if let Some(join_addr) = args.join.clone() {
            tokio::spawn(join_cluster(
                join_addr,
                args.node_id.clone(),
                args.raft_addr.clone(),
                config.server.join_retry_secs,
            ));
        }
        Some(replica)
    } else {
        None
    };

    let shards = if args.shard_count > 0 {
        Some(start_shards(&args, &config.raft).await?)
    } else {
        None
    };

    let state = Arc::new(AppState {
        node_id: args.node_id.clone(),
        engine,
        replica: replica.clone(),
        shards: shards.clone(),
    });

    let http_addr = parse_addr(&args.http_addr)?;
    tokio::select! {
        result = serve_http(http_addr, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    // Leaves first: per-shard replicas, then the node replica. Engines close
    // when the last handle drops.
    if let Some(shards) = shards {
        shards.shutdown().await;
    }
    if let Some(replica) = replica {
        replica.shutdown();
    }
    Ok(())
}

/// Boot one consensus replica per hosted shard, each with its own engine
/// under `{data}/shards/{id}` and consensus on `raft_base_port + i`.
async fn start_shards(
    args: &NodeArgs,
    raft: &RaftConfig,
) -> anyhow::Result<Arc<ShardState<FjallEngine, FjallLogStore>>> {
    let shards = Arc::new(ShardState::new());
    let mut replicas = HashMap::new();

    for i in 0..args.shard_count {
        let shard_id = i.to_string();
        shards.manager.add_shard(&shard_id);

        let shard_dir = args.data_dir.join("shards").join(&shard_id);
        std::fs::create_dir_all(&shard_dir)
            .with_context(|| format!("failed to create shard dir {shard_dir:?}"))?;

        let raft_port = args.raft_base_port + i;
        let raft_addr = format!("127.0.0.1:{raft_port}");
        let shard_node_id = format!("{}-shard-{}", args.node_id, shard_id);

        let store = match FjallStore::open(&shard_dir) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(%shard_id, %err, "unable to open shard store, skipping");
                continue;
            }
        };
        let engine = Arc::new(FjallEngine(store.clone()));
        let replica = match RaftReplica::start(
            shard_node_id.clone(),
            raft_addr.clone(),
            raft.clone(),
            engine,
            Arc::new(FjallLogStore(store)),
            args.join.is_some(),
        )
        .await
        {
            Ok(replica) => replica,
            Err(err) => {
                tracing::warn!(%shard_id, %raft_addr, %err, "unable to start shard replica, skipping");
                continue;
            }
        };

        tokio::spawn(serve_cluster(parse_addr(&raft_addr)?, replica.clone()));
        tracing::info!(%shard_id, %raft_addr, node_id = %shard_node_id, "shard replica started");

        replicas.insert(
            shard_id,
            ShardReplica { node_id: shard_node_id, raft_addr, replica },
        );
    }

    *shards.replicas.write().await = replicas;
    Ok(shards)
}

/// Keep asking the cluster to add us as a voter until a leader accepts.
async fn join_cluster(join_addr: String, node_id: String, raft_addr: String, retry_secs: u64) {
    let client = ClusterClient::new(&[join_addr.as_str()]);
    let body = serde_json::json!({ "node_id": node_id, "raft_addr": raft_addr });
    let body = serde_json::to_vec(&body).expect("join body serialization");

    loop {
        match client
            .do_request(skerry_client::Method::POST, "/v1/join", Some(body.clone()))
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(%join_addr, "joined cluster");
                return;
            }
            Ok(resp) => {
                tracing::warn!(%join_addr, status = %resp.status(), "join attempt rejected");
            }
            Err(err) => {
                tracing::warn!(%join_addr, %err, "join attempt failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(retry_secs)).await;
    }
}

async fn run_balancer(
    listen: String,
    data_dir: PathBuf,
    goal_replica_ranges: u64,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {data_dir:?}"))?;
    let store = FjallStore::open(&data_dir).context("open balancer store")?;
    let engine = Arc::new(FjallEngine(store));

    let balancer = Arc::new(Balancer::new(engine, goal_replica_ranges).await?);

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(skerry_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");

    let addr = parse_addr(&listen)?;
    tracing::info!(%addr, goal_replica_ranges, "balancer listening");
    tonic::transport::Server::builder()
        .add_service(balancer_service(balancer))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}

async fn run_partition(
    listen: String,
    data_dir: PathBuf,
    register: Option<String>,
    advertise: Option<String>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {data_dir:?}"))?;
    let store = FjallStore::open(&data_dir).context("open partition store")?;
    let engine = Arc::new(FjallEngine(store));

    let partition = Arc::new(Partition::new(engine));

    if let Some(balancer_addr) = register {
        let advertised = advertise.unwrap_or_else(|| listen.clone());
        tokio::spawn(register_with_balancer(balancer_addr, advertised));
    }

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(skerry_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");

    let addr = parse_addr(&listen)?;
    tracing::info!(%addr, "partition listening");
    tonic::transport::Server::builder()
        .add_service(partition_service(partition))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}

async fn register_with_balancer(balancer_addr: String, advertised: String) {
    use skerry_proto::v1::balancer_service_client::BalancerServiceClient;
    use skerry_proto::v1::RegisterPartitionRequest;

    loop {
        match BalancerServiceClient::connect(format!("http://{balancer_addr}")).await {
            Ok(mut client) => {
                match client
                    .register_partition(RegisterPartitionRequest {
                        address: advertised.clone(),
                    })
                    .await
                {
                    Ok(_) => {
                        tracing::info!(%balancer_addr, %advertised, "registered with balancer");
                        return;
                    }
                    Err(status) => {
                        tracing::warn!(%balancer_addr, err = %status, "registration rejected");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%balancer_addr, %err, "balancer unreachable");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
