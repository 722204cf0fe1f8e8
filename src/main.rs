use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tsdb_partition::core::{DiscoveryInfo, PartitionId, Record, ReplicationTarget, Table, TableConfig};
use tsdb_partition::{LocalConnectionPool, Partition, PartitionMap, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tsdb-partition", version, about = "Partition lifecycle tool for a distributed time-series store")]
struct Cli {
    /// TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 覆盖配置里的 data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 覆盖配置里的 node_id
    #[arg(long)]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// 分区定位参数；`partition` 为 40 位 hex，否则按内容哈希计算
#[derive(clap::Args, Debug)]
struct Target {
    namespace: String,
    table: String,
    partition: String,
}

impl Target {
    fn partition_id(&self) -> PartitionId {
        PartitionId::from_hex(&self.partition).unwrap_or_else(|_| PartitionId::compute(self.partition.as_bytes()))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 新建分区（本节点为 leader）
    Create {
        #[command(flatten)]
        target: Target,
        /// 额外的副本节点
        #[arg(long = "replica")]
        replicas: Vec<String>,
    },
    Info {
        #[command(flatten)]
        target: Target,
    },
    /// 从 stdin 追加记录，每行一条
    Append {
        #[command(flatten)]
        target: Target,
    },
    Compact {
        #[command(flatten)]
        target: Target,
    },
    List,
    Status,
    /// 把当前快照复制到对端数据目录
    Replicate {
        #[command(flatten)]
        target: Target,
        /// node=dir
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(node) = cli.node_id {
        config.node_id = node;
    }
    // 与 ensure_table 一致：上次运行以默认配置建的表，这次也要能被 list / status 看到
    config.adopt_unknown_tables = true;
    let config = Arc::new(config);

    let map = PartitionMap::new(config.clone());
    map.open()?;

    match cli.command {
        Command::Create { target, replicas } => {
            ensure_table(&map, &target);
            let mut discovery = DiscoveryInfo::serve(config.node_id.clone());
            discovery
                .replication_targets
                .extend(replicas.into_iter().map(ReplicationTarget::new));
            let p = map.find_or_create(&target.namespace, &target.table, target.partition_id(), &discovery)?;
            print_json(&p.info())?;
        }
        Command::Info { target } => {
            let p = require(&map, &target)?;
            print_json(&p.info())?;
        }
        Command::Append { target } => {
            let p = require(&map, &target)?;
            let mut records = Vec::new();
            for line in std::io::stdin().lock().lines() {
                let line = line.context("read stdin")?;
                if !line.is_empty() {
                    records.push(Record::from_payload(line.into_bytes()));
                }
            }
            let commit = p.writer()?.append(records)?;
            print_json(&commit)?;
        }
        Command::Compact { target } => {
            let p = require(&map, &target)?;
            match p.writer()?.compact()? {
                Some(commit) => print_json(&commit)?,
                None => info!("{}: nothing to compact", p.key()),
            }
        }
        Command::List => {
            let keys: Vec<String> = map.list_partitions().iter().map(|k| k.to_string()).collect();
            print_json(&keys)?;
        }
        Command::Status => {
            for key in map.list_partitions() {
                if let Ok(table) = map.find_table(&key.namespace, &key.table) {
                    // status 需要数据量，统一加载
                    map.find_partition(&key.namespace, &table.name, key.partition_id)?;
                }
            }
            print!("{}", map.report());
        }
        Command::Replicate { target, peers } => {
            let p = require(&map, &target)?;
            let pool = Arc::new(LocalConnectionPool::new());
            for peer in &peers {
                let (node, dir) = peer
                    .split_once('=')
                    .with_context(|| format!("invalid --peer {peer}, expected node=dir"))?;
                pool.register(node, dir);
            }
            let strategy = p.replication_strategy(pool)?;
            info!("{}: replicating with {:?} to {:?}", p.key(), strategy.kind(), strategy.peers());
            let report = tokio::task::spawn_blocking(move || strategy.replicate()).await??;
            print_json(&report)?;
        }
    }

    map.shutdown();
    Ok(())
}

/// 命令行里出现未配置的表时使用默认表配置
fn ensure_table(map: &PartitionMap, target: &Target) {
    if map.find_table(&target.namespace, &target.table).is_err() {
        warn!(
            "Table {}/{} not configured, using defaults",
            target.namespace, target.table
        );
        map.configure_table(Table::new(&target.namespace, &target.table, TableConfig::default()));
    }
}

fn require(map: &PartitionMap, target: &Target) -> anyhow::Result<Arc<Partition>> {
    ensure_table(map, target);
    map.find_partition(&target.namespace, &target.table, target.partition_id())?
        .with_context(|| {
            format!(
                "partition {}/{}/{} not found",
                target.namespace,
                target.table,
                target.partition_id()
            )
        })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
