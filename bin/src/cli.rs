//! Command line. Every flag can also be set through `OPCORE_<SERVICE>_<FLAG>`.

use std::{net::IpAddr, path::PathBuf, time::Duration};

use alloy_primitives::Address;
use clap::{Args, Parser, Subcommand, ValueEnum};
use opcore_dispute::VmKind;

#[derive(Debug, Parser)]
#[command(name = "opcore", version, about = "Optimistic rollup operator services")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Post L2 batches to L1.
    Batcher(BatcherArgs),
    /// Derive the safe L2 chain from L1.
    Node(NodeArgs),
    /// Play dispute games against invalid proposals.
    Challenger(ChallengerArgs),
    /// Keep one healthy sequencer leading a Raft cluster.
    Conductor(ConductorArgs),
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Batcher(_) => "batcher",
            Self::Node(_) => "node",
            Self::Challenger(_) => "challenger",
            Self::Conductor(_) => "conductor",
        }
    }

    pub fn common(&self) -> Common {
        match self {
            Self::Batcher(a) => a.common.common(),
            Self::Node(a) => a.common.common(),
            Self::Challenger(a) => a.common.common(),
            Self::Conductor(a) => a.common.common(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DataAvailability {
    #[default]
    Calldata,
    Blobs,
}

/// Flags shared by every service.
#[derive(Debug, Clone)]
pub struct Common {
    pub l1_eth_rpc: String,
    pub rpc_addr: IpAddr,
    pub rpc_port: u16,
    pub metrics_enabled: bool,
    pub metrics_addr: IpAddr,
    pub metrics_port: u16,
    pub pprof_enabled: bool,
    pub pprof_addr: IpAddr,
    pub pprof_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub signer_endpoint: Option<String>,
    pub signer_address: Option<Address>,
    pub signer_tls_ca: Option<PathBuf>,
    pub signer_tls_cert: Option<PathBuf>,
    pub signer_tls_key: Option<PathBuf>,
}

/// Declares the shared flags for one service, with that service's env prefix.
macro_rules! common_args {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Args)]
        pub struct $name {
            /// L1 execution client JSON-RPC endpoint.
            #[arg(long = "l1-eth-rpc", env = concat!($prefix, "L1_ETH_RPC"))]
            l1_eth_rpc: String,
            #[arg(long = "rpc.addr", env = concat!($prefix, "RPC_ADDR"), default_value = "0.0.0.0")]
            rpc_addr: IpAddr,
            #[arg(long = "rpc.port", env = concat!($prefix, "RPC_PORT"), default_value_t = 8545)]
            rpc_port: u16,
            #[arg(long = "metrics.enabled", env = concat!($prefix, "METRICS_ENABLED"))]
            metrics_enabled: bool,
            #[arg(long = "metrics.addr", env = concat!($prefix, "METRICS_ADDR"), default_value = "0.0.0.0")]
            metrics_addr: IpAddr,
            #[arg(long = "metrics.port", env = concat!($prefix, "METRICS_PORT"), default_value_t = 7300)]
            metrics_port: u16,
            #[arg(long = "pprof.enabled", env = concat!($prefix, "PPROF_ENABLED"))]
            pprof_enabled: bool,
            #[arg(long = "pprof.addr", env = concat!($prefix, "PPROF_ADDR"), default_value = "0.0.0.0")]
            pprof_addr: IpAddr,
            #[arg(long = "pprof.port", env = concat!($prefix, "PPROF_PORT"), default_value_t = 6060)]
            pprof_port: u16,
            /// Used when `RUST_LOG` is unset.
            #[arg(long = "log.level", env = concat!($prefix, "LOG_LEVEL"), default_value = "info")]
            log_level: String,
            #[arg(long = "log.format", env = concat!($prefix, "LOG_FORMAT"), value_enum, default_value_t)]
            log_format: LogFormat,
            #[arg(long = "signer.endpoint", env = concat!($prefix, "SIGNER_ENDPOINT"))]
            signer_endpoint: Option<String>,
            #[arg(long = "signer.address", env = concat!($prefix, "SIGNER_ADDRESS"))]
            signer_address: Option<Address>,
            #[arg(long = "signer.tls-ca", env = concat!($prefix, "SIGNER_TLS_CA"))]
            signer_tls_ca: Option<PathBuf>,
            #[arg(long = "signer.tls-cert", env = concat!($prefix, "SIGNER_TLS_CERT"))]
            signer_tls_cert: Option<PathBuf>,
            #[arg(long = "signer.tls-key", env = concat!($prefix, "SIGNER_TLS_KEY"))]
            signer_tls_key: Option<PathBuf>,
        }

        impl $name {
            pub fn common(&self) -> Common {
                Common {
                    l1_eth_rpc: self.l1_eth_rpc.clone(),
                    rpc_addr: self.rpc_addr,
                    rpc_port: self.rpc_port,
                    metrics_enabled: self.metrics_enabled,
                    metrics_addr: self.metrics_addr,
                    metrics_port: self.metrics_port,
                    pprof_enabled: self.pprof_enabled,
                    pprof_addr: self.pprof_addr,
                    pprof_port: self.pprof_port,
                    log_level: self.log_level.clone(),
                    log_format: self.log_format,
                    signer_endpoint: self.signer_endpoint.clone(),
                    signer_address: self.signer_address,
                    signer_tls_ca: self.signer_tls_ca.clone(),
                    signer_tls_cert: self.signer_tls_cert.clone(),
                    signer_tls_key: self.signer_tls_key.clone(),
                }
            }
        }
    };
}

common_args!(BatcherCommon, "OPCORE_BATCHER_");
common_args!(NodeCommon, "OPCORE_NODE_");
common_args!(ChallengerCommon, "OPCORE_CHALLENGER_");
common_args!(ConductorCommon, "OPCORE_CONDUCTOR_");

#[derive(Debug, Args)]
pub struct BatcherArgs {
    #[command(flatten)]
    pub common: BatcherCommon,
    #[arg(long = "l2-eth-rpc", env = "OPCORE_BATCHER_L2_ETH_RPC")]
    pub l2_eth_rpc: String,
    #[arg(long = "rollup-rpc", env = "OPCORE_BATCHER_ROLLUP_RPC")]
    pub rollup_rpc: String,
    /// Path to `rollup.json`.
    #[arg(long = "rollup-config", env = "OPCORE_BATCHER_ROLLUP_CONFIG")]
    pub rollup_config: PathBuf,
    #[arg(long = "data-availability-type", env = "OPCORE_BATCHER_DATA_AVAILABILITY_TYPE", value_enum, default_value_t)]
    pub data_availability: DataAvailability,
    /// Frames per channel; blobs per transaction when posting blobs.
    #[arg(long = "target-num-frames", env = "OPCORE_BATCHER_TARGET_NUM_FRAMES", default_value_t = 1)]
    pub target_num_frames: usize,
    #[arg(long = "max-channel-duration", env = "OPCORE_BATCHER_MAX_CHANNEL_DURATION", default_value_t = 0)]
    pub max_channel_duration: u64,
    #[arg(long = "sub-safety-margin", env = "OPCORE_BATCHER_SUB_SAFETY_MARGIN", default_value_t = 10)]
    pub sub_safety_margin: u64,
    #[arg(long = "max-pending-tx", env = "OPCORE_BATCHER_MAX_PENDING_TX", default_value_t = 1)]
    pub max_pending_tx: usize,
    #[arg(long = "num-confirmations", env = "OPCORE_BATCHER_NUM_CONFIRMATIONS", default_value_t = 10)]
    pub num_confirmations: u64,
    #[arg(long = "poll-interval", env = "OPCORE_BATCHER_POLL_INTERVAL", value_parser = parse_duration, default_value = "6s")]
    pub poll_interval: Duration,
}

#[derive(Debug, Args)]
pub struct NodeArgs {
    #[command(flatten)]
    pub common: NodeCommon,
    #[arg(long = "l1.beacon", env = "OPCORE_NODE_L1_BEACON")]
    pub l1_beacon: String,
    #[arg(long = "l2", env = "OPCORE_NODE_L2_ENGINE_RPC")]
    pub l2_engine_rpc: String,
    #[arg(long = "l2.jwt-secret", env = "OPCORE_NODE_L2_ENGINE_AUTH")]
    pub l2_jwt_secret: PathBuf,
    #[arg(long = "l2-eth-rpc", env = "OPCORE_NODE_L2_ETH_RPC")]
    pub l2_eth_rpc: String,
    #[arg(long = "rollup.config", env = "OPCORE_NODE_ROLLUP_CONFIG")]
    pub rollup_config: PathBuf,
    /// L1 blocks kept between the head and the newest block derived from.
    #[arg(long = "verifier.l1-confs", env = "OPCORE_NODE_VERIFIER_L1_CONFS", default_value_t = 0)]
    pub l1_confs: u64,
    #[arg(long = "l1.cache-size", env = "OPCORE_NODE_L1_CACHE_SIZE", default_value_t = 1000)]
    pub l1_cache_size: u32,
    #[arg(long = "l1.poll-interval", env = "OPCORE_NODE_L1_POLL_INTERVAL", value_parser = parse_duration, default_value = "12s")]
    pub l1_poll_interval: Duration,
}

#[derive(Debug, Args)]
pub struct ChallengerArgs {
    #[command(flatten)]
    pub common: ChallengerCommon,
    #[arg(long = "rollup-rpc", env = "OPCORE_CHALLENGER_ROLLUP_RPC")]
    pub rollup_rpc: String,
    /// Game directories live under `<datadir>/game-<address>`.
    #[arg(long = "datadir", env = "OPCORE_CHALLENGER_DATADIR")]
    pub datadir: PathBuf,
    #[arg(long = "max-concurrency", env = "OPCORE_CHALLENGER_MAX_CONCURRENCY", default_value_t = opcore_dispute::MAX_CONCURRENCY)]
    pub max_concurrency: usize,
    #[arg(long = "game-window-poll", env = "OPCORE_CHALLENGER_POLL_INTERVAL", value_parser = parse_duration, default_value = "12s")]
    pub poll_interval: Duration,
    #[arg(long = "game-factory-address", env = "OPCORE_CHALLENGER_GAME_FACTORY_ADDRESS")]
    pub game_factory_address: Address,
    #[arg(long = "game-type", env = "OPCORE_CHALLENGER_GAME_TYPE", default_value_t = 0)]
    pub game_type: u32,
    /// Games created longer ago than this are not picked up.
    #[arg(long = "game-window", env = "OPCORE_CHALLENGER_GAME_WINDOW", value_parser = parse_duration, default_value = "672h")]
    pub game_window: Duration,
    /// JSON image of the fault proof program, whose prestate a game must commit to.
    #[arg(long = "prestate", env = "OPCORE_CHALLENGER_PRESTATE")]
    pub prestate: PathBuf,
    /// `mips32` or `mips64`, the VM the prestate image is built for.
    #[arg(long = "vm", env = "OPCORE_CHALLENGER_VM", default_value = "mips32")]
    pub vm: VmKind,
}

#[derive(Debug, Args)]
pub struct ConductorArgs {
    #[command(flatten)]
    pub common: ConductorCommon,
    /// Rollup node of the sequencer this conductor guards.
    #[arg(long = "node.rpc", env = "OPCORE_CONDUCTOR_NODE_RPC")]
    pub node_rpc: String,
    #[arg(long = "raft.server.id", env = "OPCORE_CONDUCTOR_RAFT_SERVER_ID")]
    pub raft_server_id: String,
    #[arg(long = "consensus.addr", env = "OPCORE_CONDUCTOR_CONSENSUS_ADDR", default_value = "127.0.0.1:50050")]
    pub consensus_addr: String,
    /// The raft log, term and snapshots go to `<dir>/raft/`.
    #[arg(long = "raft.storage.dir", env = "OPCORE_CONDUCTOR_RAFT_STORAGE_DIR")]
    pub raft_storage_dir: PathBuf,
    #[arg(long = "raft.bootstrap", env = "OPCORE_CONDUCTOR_RAFT_BOOTSTRAP")]
    pub raft_bootstrap: bool,
    #[arg(long = "raft.snapshot-threshold", env = "OPCORE_CONDUCTOR_RAFT_SNAPSHOT_THRESHOLD", default_value_t = opcore_conductor::SNAPSHOT_INTERVAL)]
    pub raft_snapshot_threshold: u64,
    #[arg(long = "raft.trailing-logs", env = "OPCORE_CONDUCTOR_RAFT_TRAILING_LOGS", default_value_t = opcore_conductor::TRAILING_LOGS)]
    pub raft_trailing_logs: u64,
    #[arg(long = "paused", env = "OPCORE_CONDUCTOR_PAUSED")]
    pub paused: bool,
    #[arg(long = "healthcheck.interval", env = "OPCORE_CONDUCTOR_HEALTHCHECK_INTERVAL", value_parser = parse_duration, default_value = "1s")]
    pub healthcheck_interval: Duration,
    /// Seconds.
    #[arg(long = "healthcheck.unsafe-interval", env = "OPCORE_CONDUCTOR_HEALTHCHECK_UNSAFE_INTERVAL", default_value_t = 60)]
    pub healthcheck_unsafe_interval: u64,
    #[arg(long = "healthcheck.safe-enabled", env = "OPCORE_CONDUCTOR_HEALTHCHECK_SAFE_ENABLED")]
    pub healthcheck_safe_enabled: bool,
    /// Seconds.
    #[arg(long = "healthcheck.safe-interval", env = "OPCORE_CONDUCTOR_HEALTHCHECK_SAFE_INTERVAL", default_value_t = 1200)]
    pub healthcheck_safe_interval: u64,
    #[arg(long = "healthcheck.min-peer-count", env = "OPCORE_CONDUCTOR_HEALTHCHECK_MIN_PEER_COUNT", default_value_t = 1)]
    pub healthcheck_min_peer_count: u64,
    #[arg(long = "health-check-failure-threshold", env = "OPCORE_CONDUCTOR_HEALTH_CHECK_FAILURE_THRESHOLD", default_value_t = 3)]
    pub health_check_failure_threshold: u64,
}

/// `500ms`, `12s`, `5m`, or plain seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| format!("invalid duration `{s}`"))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit `{unit}`")),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("12s"), Ok(Duration::from_secs(12)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_conductor_flags() {
        let cli = Cli::try_parse_from([
            "opcore",
            "conductor",
            "--l1-eth-rpc",
            "http://l1:8545",
            "--node.rpc",
            "http://node:9545",
            "--raft.server.id",
            "seq-0",
            "--raft.storage.dir",
            "/tmp/conductor",
            "--raft.bootstrap",
            "--log.format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.command.name(), "conductor");
        assert_eq!(cli.command.common().log_format, LogFormat::Json);
        let Command::Conductor(args) = cli.command else { panic!("not the conductor") };
        assert!(args.raft_bootstrap);
        assert_eq!(args.healthcheck_interval, Duration::from_secs(1));
        assert_eq!(args.health_check_failure_threshold, 3);
    }

    #[test]
    fn test_challenger_flags() {
        let cli = Cli::try_parse_from([
            "opcore",
            "challenger",
            "--l1-eth-rpc",
            "http://l1:8545",
            "--rollup-rpc",
            "http://node:9545",
            "--datadir",
            "/tmp/games",
            "--game-factory-address",
            "0x00000000000000000000000000000000000000aa",
            "--prestate",
            "/tmp/prestate.json",
            "--signer.endpoint",
            "http://signer:8080",
            "--signer.address",
            "0x0000000000000000000000000000000000000011",
        ])
        .unwrap();
        let Command::Challenger(args) = cli.command else { panic!("not the challenger") };
        assert_eq!(args.game_factory_address, Address::with_last_byte(0xaa));
        assert_eq!(args.game_type, 0);
        assert_eq!(args.vm, VmKind::Mips32);
        assert_eq!(args.game_window, Duration::from_secs(672 * 3600));
        assert_eq!(args.max_concurrency, opcore_dispute::MAX_CONCURRENCY);
        assert_eq!(args.common.common().signer_address, Some(Address::with_last_byte(0x11)));

        let parse_vm = |vm: &str| {
            Cli::try_parse_from([
                "opcore",
                "challenger",
                "--l1-eth-rpc",
                "http://l1:8545",
                "--rollup-rpc",
                "http://node:9545",
                "--datadir",
                "/tmp/games",
                "--game-factory-address",
                "0x00000000000000000000000000000000000000aa",
                "--prestate",
                "/tmp/prestate.json",
                "--vm",
                vm,
            ])
        };
        let Command::Challenger(args) = parse_vm("mips64").unwrap().command else { panic!("not the challenger") };
        assert_eq!(args.vm, VmKind::Mips64);
        assert!(parse_vm("riscv").is_err());
    }
}
