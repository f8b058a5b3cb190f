//! Wiring for each service.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, U64};
use async_trait::async_trait;
use opcore_batcher::{
    BatchSubmitter, BatcherConfig, ChannelConfig, RpcTransactor, SignerConfig, Transactor,
    TxCandidate, TxManager, TxManagerConfig,
};
use opcore_conductor::{
    Conductor, ConductorConfig, HealthConfig, HealthMonitor, HttpNetwork, RaftConfig, RaftNode,
};
use opcore_derive::{Driver, DriverConfig, EngineController, EngineHeads};
use opcore_dispute::{
    contract::{RpcGameFactory, RpcGameSource},
    preimage::PreimageStore,
    trace::VmTraceCreator,
    ContractCall, ContractError, GameDirs, GameScheduler, TxSender, VmProgram,
};
use opcore_pipeline::RollupConfig;
use opcore_stream::{
    l2_block_ref, BeaconClient, ConfDepth, EngineClient, HttpL1Provider, HttpL2Provider, L1Head,
    L1Provider, L1SourceConfig, L2Provider, RetryConfig, RollupNodeClient, RpcClient,
    SyncStatusProvider,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cli::{BatcherArgs, ChallengerArgs, Common, ConductorArgs, DataAvailability, NodeArgs},
    server::{self, Status},
};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a service stopped. Configuration failures exit with 1, runtime failures with 2.
#[derive(Debug)]
pub enum Failure {
    Config(eyre::Report),
    Fatal(eyre::Report),
}

impl Failure {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Fatal(_) => 2,
        }
    }
}

trait FailureExt<T> {
    fn or_config(self, what: &str) -> Result<T, Failure>;
    fn or_fatal(self, what: &str) -> Result<T, Failure>;
}

impl<T, E> FailureExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn or_config(self, what: &str) -> Result<T, Failure> {
        self.map_err(|e| Failure::Config(eyre::Report::new(e).wrap_err(what.to_string())))
    }

    fn or_fatal(self, what: &str) -> Result<T, Failure> {
        self.map_err(|e| Failure::Fatal(eyre::Report::new(e).wrap_err(what.to_string())))
    }
}

fn load_rollup_config(path: &std::path::Path) -> Result<Arc<RollupConfig>, Failure> {
    let data = std::fs::read_to_string(path).or_config("reading rollup config")?;
    let cfg = RollupConfig::from_json(&data).or_config("parsing rollup config")?;
    info!(l1_chain_id = cfg.l1_chain_id, l2_chain_id = cfg.l2_chain_id, "loaded rollup config");
    Ok(Arc::new(cfg))
}

/// The L1 endpoint must answer before anything starts.
async fn connect_l1(common: &Common) -> Result<HttpL1Provider, Failure> {
    let l1 = HttpL1Provider::new(L1SourceConfig::builder().rpc_url(common.l1_eth_rpc.clone()).build())
        .or_config("L1 endpoint")?;
    let head = l1.head_number().await.or_config("L1 endpoint unreachable")?;
    info!(url = %common.l1_eth_rpc, head, "connected to L1");
    Ok(l1)
}

fn spawn_servers(common: &Common, status: Status, cancel: &CancellationToken) {
    tokio::spawn(server::serve_rpc((common.rpc_addr, common.rpc_port).into(), status.clone(), cancel.clone()));
    if common.metrics_enabled {
        tokio::spawn(server::serve_metrics(
            (common.metrics_addr, common.metrics_port).into(),
            status,
            cancel.clone(),
        ));
    }
    if common.pprof_enabled {
        warn!(addr = %common.pprof_addr, port = common.pprof_port, "profiling endpoints are not built into this binary");
    }
}

fn signer_config(common: &Common) -> Result<SignerConfig, Failure> {
    let (Some(endpoint), Some(address)) = (common.signer_endpoint.clone(), common.signer_address) else {
        return Err(Failure::Config(eyre::eyre!("--signer.endpoint and --signer.address are required")));
    };
    Ok(SignerConfig::builder()
        .endpoint(endpoint)
        .address(address)
        .maybe_tls_ca(common.signer_tls_ca.clone())
        .maybe_tls_cert(common.signer_tls_cert.clone())
        .maybe_tls_key(common.signer_tls_key.clone())
        .build())
}

pub async fn batcher(args: BatcherArgs, cancel: CancellationToken) -> Result<(), Failure> {
    let common = args.common.common();
    let cfg = load_rollup_config(&args.rollup_config)?;
    let l1 = connect_l1(&common).await?;

    let signer = signer_config(&common)?;
    let l1_rpc = RpcClient::new(common.l1_eth_rpc.clone(), RPC_TIMEOUT).or_config("L1 endpoint")?;
    let transactor = RpcTransactor::new(l1_rpc, &signer, cfg.l1_chain_id).or_config("signer")?;
    let txmgr = TxManager::new(
        TxManagerConfig::builder().num_confirmations(args.num_confirmations).build(),
        transactor,
    );

    let mut channel = ChannelConfig::builder()
        .target_num_frames(args.target_num_frames)
        .max_channel_duration(args.max_channel_duration)
        .sub_safety_margin(args.sub_safety_margin)
        .channel_timeout(cfg.channel_timeout)
        .build();
    if args.data_availability == DataAvailability::Blobs {
        channel = channel.with_blobs(args.target_num_frames);
    }
    let config = BatcherConfig::builder()
        .channel(channel)
        .poll_interval(args.poll_interval)
        .max_pending_transactions(args.max_pending_tx)
        .build();

    let l2 = HttpL2Provider::new(args.l2_eth_rpc, cfg.clone(), RetryConfig::default()).or_config("L2 endpoint")?;
    let rollup = RollupNodeClient::new(args.rollup_rpc, RPC_TIMEOUT).or_config("rollup node endpoint")?;
    let submitter = BatchSubmitter::new(cfg, config, l1, l2, rollup, txmgr).or_config("batcher config")?;

    let metrics = submitter.metrics().clone();
    spawn_servers(&common, Status::batcher(metrics), &cancel);
    submitter.run(cancel).await.or_fatal("batch submitter")
}

pub async fn node(args: NodeArgs, cancel: CancellationToken) -> Result<(), Failure> {
    let common = args.common.common();
    let cfg = load_rollup_config(&args.rollup_config)?;
    let l1 = HttpL1Provider::new(
        L1SourceConfig::builder()
            .rpc_url(common.l1_eth_rpc.clone())
            .cache_capacity(args.l1_cache_size)
            .build(),
    )
    .or_config("L1 endpoint")?;
    let l1 = Arc::new(l1);
    let l1_head = L1Head::default();
    l1_head.set(l1.head_number().await.or_config("L1 endpoint unreachable")?);

    let blobs = BeaconClient::new(args.l1_beacon, 128).or_config("beacon endpoint")?;
    let l2 = Arc::new(
        HttpL2Provider::new(args.l2_eth_rpc, cfg.clone(), RetryConfig::default()).or_config("L2 endpoint")?,
    );
    let secret = EngineClient::load_secret(&args.l2_jwt_secret).or_config("engine JWT secret")?;
    let engine = EngineClient::new(args.l2_engine_rpc, secret).or_config("engine endpoint")?;

    let head = l2.block_by_number(None).await.or_config("L2 endpoint unreachable")?;
    let head = l2_block_ref(&head, &cfg).or_config("L2 head")?;
    info!(number = head.number, hash = %head.hash, "starting from L2 head");
    let controller = EngineController::new(engine, l2.clone(), cfg.clone(), EngineHeads::at(head));

    let confirmed = ConfDepth::new(l1.clone(), args.l1_confs, l1_head.clone());
    let driver = Driver::new(cfg, DriverConfig::default(), confirmed, blobs, l2, controller);

    tokio::spawn(follow_l1_head(l1, l1_head, args.l1_poll_interval, cancel.clone()));
    spawn_servers(&common, Status::service("node"), &cancel);
    driver.run(cancel).await.or_fatal("derivation driver")
}

/// Keeps the shared L1 head current for the confirmation-depth filter.
async fn follow_l1_head(l1: Arc<HttpL1Provider>, head: L1Head, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match l1.head_number().await {
            Ok(number) => head.set(number),
            Err(err) => warn!(%err, "failed to poll L1 head"),
        }
    }
}

/// Sends the challenger's contract calls through the transaction manager, sized by
/// `eth_estimateGas`.
struct ManagedSender {
    txmgr: TxManager<RpcTransactor>,
    cancel: CancellationToken,
}

#[async_trait]
impl TxSender for ManagedSender {
    fn sender(&self) -> Address {
        self.txmgr.transactor().sender()
    }

    async fn send(&self, call: ContractCall) -> Result<B256, ContractError> {
        let gas = self.txmgr.transactor().estimate_gas(call.to, &call.data, call.value).await?;
        let candidate = TxCandidate {
            to: call.to,
            data: call.data,
            value: call.value,
            // Headroom over the estimate for state that moves before inclusion.
            gas_limit: Some(gas + gas / 5),
            ..Default::default()
        };
        let receipt =
            self.txmgr.send(candidate, &self.cancel).await.map_err(|e| ContractError::Send(e.to_string()))?;
        if !receipt.success {
            return Err(ContractError::Reverted(receipt.tx_hash));
        }
        Ok(receipt.tx_hash)
    }
}

pub async fn challenger(args: ChallengerArgs, cancel: CancellationToken) -> Result<(), Failure> {
    let common = args.common.common();
    connect_l1(&common).await?;
    let rollup = RollupNodeClient::new(args.rollup_rpc, RPC_TIMEOUT).or_config("rollup node endpoint")?;
    let status = rollup.sync_status().await.or_config("rollup node unreachable")?;
    info!(safe_l2 = status.safe_l2.number, finalized_l2 = status.finalized_l2.number, "connected to rollup node");

    let l1_rpc = Arc::new(RpcClient::new(common.l1_eth_rpc.clone(), RPC_TIMEOUT).or_config("L1 endpoint")?);
    let chain_id: U64 = l1_rpc.request("eth_chainId", serde_json::json!([])).await.or_config("L1 chain id")?;
    let transactor = RpcTransactor::new(
        RpcClient::new(common.l1_eth_rpc.clone(), RPC_TIMEOUT).or_config("L1 endpoint")?,
        &signer_config(&common)?,
        chain_id.to(),
    )
    .or_config("signer")?;
    let sender = Arc::new(ManagedSender {
        txmgr: TxManager::new(TxManagerConfig::default(), transactor),
        cancel: cancel.clone(),
    });

    let image = std::fs::read(&args.prestate).or_config("reading prestate")?;
    let program = VmProgram::from_json(args.vm, &image).or_config("parsing prestate")?;
    // The depth is set per game from its own configuration.
    let exec = VmTraceCreator::new(program, PreimageStore::default(), 0);
    info!(prestate = %exec.prestate_hash(), vm = %args.vm, factory = %args.game_factory_address, "loaded fault proof program");
    let source = RpcGameSource::new(
        RpcGameFactory::new(l1_rpc, args.game_factory_address, args.game_type),
        sender,
        Arc::new(rollup),
        exec,
        args.game_window.as_secs(),
    );

    std::fs::create_dir_all(&args.datadir).or_config("creating datadir")?;
    let scheduler =
        GameScheduler::new(GameDirs::new(&args.datadir), args.max_concurrency).with_source(Arc::new(source));
    spawn_servers(&common, Status::service("challenger"), &cancel);
    scheduler.run(args.poll_interval, cancel).await.or_fatal("game scheduler")
}

pub async fn conductor(args: ConductorArgs, cancel: CancellationToken) -> Result<(), Failure> {
    let common = args.common.common();
    connect_l1(&common).await?;
    let node = Arc::new(RollupNodeClient::new(args.node_rpc, RPC_TIMEOUT).or_config("rollup node endpoint")?);

    let listen: SocketAddr = args.consensus_addr.parse().or_config("consensus address")?;
    let network = HttpNetwork::new(RPC_TIMEOUT).or_config("raft transport")?;
    let raft = RaftNode::start(
        RaftConfig::builder()
            .server_id(args.raft_server_id)
            .server_addr(args.consensus_addr)
            .storage_dir(args.raft_storage_dir)
            .bootstrap(args.raft_bootstrap)
            .snapshot_interval(args.raft_snapshot_threshold)
            .trailing_logs(args.raft_trailing_logs)
            .build(),
        network,
    )
    .await
    .or_config("raft storage")?;
    tokio::spawn(server::serve_raft(listen, raft.clone(), cancel.clone()));

    let health = HealthConfig::builder()
        .interval(args.healthcheck_interval)
        .unsafe_interval(args.healthcheck_unsafe_interval)
        .safe_enabled(args.healthcheck_safe_enabled)
        .safe_interval(args.healthcheck_safe_interval)
        .min_peer_count(args.healthcheck_min_peer_count)
        .build();
    let monitor = HealthMonitor::new(health, node.clone(), node);
    let results = monitor.subscribe();

    let config = ConductorConfig::builder()
        .health_check_failure_threshold(args.health_check_failure_threshold)
        .paused(args.paused)
        .build();
    let conductor = Arc::new(Conductor::new(config, raft));

    tokio::spawn(monitor.run(cancel.clone()));
    spawn_servers(&common, Status::conductor(conductor.clone()), &cancel);
    conductor.run(results, cancel).await.or_fatal("conductor")
}
