use std::{fmt, sync::Arc};

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use futures::future::try_join_all;
use opcore_stream::RpcClient;
use tracing::{debug, info, warn};

use super::{ContractCall, ContractError, GameContract, TxSender};
use crate::{
    agent::Agent,
    game::{Anchor, Claim, Clock, FaultDisputeGame, GameConfig, GameRecord, GameStatus},
    position::Position,
    preimage::OracleUpdate,
    scheduler::{GamePlayer, GameSource},
    trace::{OutputSource, OutputTraceProvider, SplitTraceProvider, StepData, TraceCache, VmTraceCreator},
    vm::VmKind,
};

sol! {
    interface IFaultDisputeGame {
        function claimDataLen() external view returns (uint256 len);
        function claimData(uint256 index) external view returns (
            uint32 parentIndex,
            address counteredBy,
            address claimant,
            uint128 bond,
            bytes32 claim,
            uint128 position,
            uint128 clock
        );
        function resolvedSubgames(uint256 index) external view returns (bool resolved);
        function status() external view returns (uint8 status);
        function l1Head() external view returns (bytes32 head);
        function l2BlockNumber() external view returns (uint256 number);
        function startingOutputRoot() external view returns (bytes32 root, uint256 l2BlockNumber);
        function createdAt() external view returns (uint64 timestamp);
        function maxGameDepth() external view returns (uint256 depth);
        function splitDepth() external view returns (uint256 depth);
        function maxClockDuration() external view returns (uint64 duration);
        function absolutePrestate() external view returns (bytes32 prestate);
        function l2ChainId() external view returns (uint256 chainId);
        function getRequiredBond(uint128 position) external view returns (uint256 bond);
        function credit(address account) external view returns (uint256 amount);
        function vm() external view returns (address vm);

        function move(bytes32 disputed, uint256 parentIndex, bytes32 claim, bool isAttack) external payable;
        function step(uint256 claimIndex, bool isAttack, bytes stateData, bytes proof) external;
        function addLocalData(uint256 ident, uint256 execLeafIdx, uint256 partOffset) external;
        function resolveClaim(uint256 claimIndex, uint256 numToResolve) external;
        function resolve() external returns (uint8 status);
        function claimCredit(address recipient) external;
    }

    interface IBigStepper {
        function oracle() external view returns (address oracle);
    }

    interface IPreimageOracle {
        function loadKeccak256PreimagePart(uint256 partOffset, bytes preimage) external;
        function loadSha256PreimagePart(uint256 partOffset, bytes preimage) external;
        function loadBlobPreimagePart(uint256 z, uint256 y, bytes commitment, bytes proof, uint256 partOffset) external;
        function loadPrecompilePreimagePart(uint256 partOffset, address precompile, uint64 requiredGas, bytes input) external;
    }

    interface IDisputeGameFactory {
        function gameCount() external view returns (uint256 count);
        function gameAtIndex(uint256 index) external view returns (uint32 gameType, uint64 timestamp, address proxy);
    }
}

/// `parentIndex` of the root claim.
const NO_PARENT: u32 = u32::MAX;

async fn eth_call<C: SolCall>(rpc: &RpcClient, to: Address, call: &C) -> Result<C::Return, ContractError> {
    let tx = serde_json::json!({ "to": to, "data": Bytes::from(call.abi_encode()) });
    let out: Bytes = rpc.request("eth_call", serde_json::json!([tx, "latest"])).await?;
    Ok(C::abi_decode_returns(&out)?)
}

fn encode<C: SolCall>(to: Address, call: &C, value: U256) -> ContractCall {
    ContractCall { to, data: call.abi_encode().into(), value }
}

fn to_u64(value: U256, what: &str) -> Result<u64, ContractError> {
    u64::try_from(value).map_err(|_| ContractError::Malformed(format!("{what} {value} out of range")))
}

fn to_u8(value: U256, what: &str) -> Result<u8, ContractError> {
    u8::try_from(value).map_err(|_| ContractError::Malformed(format!("{what} {value} out of range")))
}

fn status_from_abi(status: u8) -> Result<GameStatus, ContractError> {
    match status {
        0 => Ok(GameStatus::InProgress),
        1 => Ok(GameStatus::ChallengerWins),
        2 => Ok(GameStatus::DefenderWins),
        other => Err(ContractError::Malformed(format!("game status {other}"))),
    }
}

/// Decode the return data of `claimData(uint256)`. The clock packs the duration above the
/// timestamp.
pub fn claim_from_abi(data: &[u8]) -> Result<Claim, ContractError> {
    let raw = IFaultDisputeGame::claimDataCall::abi_decode_returns(data)?;
    Ok(Claim {
        parent_index: (raw.parentIndex != NO_PARENT).then_some(raw.parentIndex as usize),
        countered_by: (raw.counteredBy != Address::ZERO).then_some(raw.counteredBy),
        claimant: raw.claimant,
        bond: U256::from(raw.bond),
        value: raw.claim,
        position: Position::from_gindex(raw.position),
        clock: Clock { duration: (raw.clock >> 64) as u64, timestamp: raw.clock as u64 },
    })
}

/// A deployed fault dispute game. Parameters that never change are read once on connect.
pub struct RpcGame<S> {
    address: Address,
    rpc: Arc<RpcClient>,
    sender: S,
    oracle: Address,
    config: GameConfig,
    l1_head: B256,
    anchor: Anchor,
    l2_block_number: u64,
    created_at: u64,
}

impl<S> fmt::Debug for RpcGame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcGame")
            .field("address", &self.address)
            .field("config", &self.config)
            .field("l2_block_number", &self.l2_block_number)
            .finish_non_exhaustive()
    }
}

impl<S: TxSender> RpcGame<S> {
    pub async fn connect(address: Address, rpc: Arc<RpcClient>, sender: S) -> Result<Self, ContractError> {
        use IFaultDisputeGame as G;
        let root_bond_call = G::getRequiredBondCall { position: Position::ROOT.gindex() };
        let (max_depth, split, clock, prestate, chain_id, base_bond) = futures::try_join!(
            eth_call(&rpc, address, &G::maxGameDepthCall {}),
            eth_call(&rpc, address, &G::splitDepthCall {}),
            eth_call(&rpc, address, &G::maxClockDurationCall {}),
            eth_call(&rpc, address, &G::absolutePrestateCall {}),
            eth_call(&rpc, address, &G::l2ChainIdCall {}),
            eth_call(&rpc, address, &root_bond_call),
        )?;
        let (l1_head, starting, l2_block_number, created_at, vm) = futures::try_join!(
            eth_call(&rpc, address, &G::l1HeadCall {}),
            eth_call(&rpc, address, &G::startingOutputRootCall {}),
            eth_call(&rpc, address, &G::l2BlockNumberCall {}),
            eth_call(&rpc, address, &G::createdAtCall {}),
            eth_call(&rpc, address, &G::vmCall {}),
        )?;
        let oracle = eth_call(&rpc, vm, &IBigStepper::oracleCall {}).await?;

        let config = GameConfig::builder()
            .max_game_depth(to_u8(max_depth, "max game depth")?)
            .split_depth(to_u8(split, "split depth")?)
            .max_clock_duration(clock)
            .base_bond(base_bond)
            .absolute_prestate(prestate)
            .l2_chain_id(to_u64(chain_id, "chain id")?)
            .build();
        let anchor = Anchor {
            root: starting.root,
            block_number: to_u64(starting.l2BlockNumber, "anchor block")?,
        };
        debug!(target: "opcore::dispute", game = %address, ?config, "connected to game");
        Ok(Self {
            address,
            rpc,
            sender,
            oracle,
            config,
            l1_head,
            anchor,
            l2_block_number: to_u64(l2_block_number, "l2 block number")?,
            created_at,
        })
    }

    pub const fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Check steps locally with `vm` rather than the 32-bit default.
    pub fn with_vm(mut self, vm: VmKind) -> Self {
        self.config.vm = vm;
        self
    }

    pub const fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub const fn l2_block_number(&self) -> u64 {
        self.l2_block_number
    }

    async fn send<C: SolCall>(&self, to: Address, call: &C, value: U256) -> Result<B256, ContractError> {
        self.sender.send(encode(to, call, value)).await
    }

    async fn load_oracle_data(&self, claim_index: usize, data: &StepData) -> Result<(), ContractError> {
        let Some(oracle_data) = &data.oracle else {
            return Ok(());
        };
        let offset = U256::from(oracle_data.offset);
        let hash = match &oracle_data.update {
            OracleUpdate::Local { ident } => {
                let call = IFaultDisputeGame::addLocalDataCall {
                    ident: U256::from(*ident),
                    execLeafIdx: U256::from(claim_index),
                    partOffset: offset,
                };
                self.send(self.address, &call, U256::ZERO).await?
            }
            OracleUpdate::Keccak256(preimage) => {
                let call = IPreimageOracle::loadKeccak256PreimagePartCall {
                    partOffset: offset,
                    preimage: preimage.clone().into(),
                };
                self.send(self.oracle, &call, U256::ZERO).await?
            }
            OracleUpdate::Sha256(preimage) => {
                let call = IPreimageOracle::loadSha256PreimagePartCall {
                    partOffset: offset,
                    preimage: preimage.clone().into(),
                };
                self.send(self.oracle, &call, U256::ZERO).await?
            }
            OracleUpdate::Blob { z, y, commitment, proof } => {
                let call = IPreimageOracle::loadBlobPreimagePartCall {
                    z: U256::from_be_bytes(z.0),
                    y: U256::from_be_bytes(y.0),
                    commitment: commitment.clone().into(),
                    proof: proof.clone().into(),
                    partOffset: offset,
                };
                self.send(self.oracle, &call, U256::ZERO).await?
            }
            OracleUpdate::Precompile { address, required_gas, input } => {
                let call = IPreimageOracle::loadPrecompilePreimagePartCall {
                    partOffset: offset,
                    precompile: *address,
                    requiredGas: *required_gas,
                    input: input.clone().into(),
                };
                self.send(self.oracle, &call, U256::ZERO).await?
            }
        };
        debug!(target: "opcore::dispute", game = %self.address, key = %oracle_data.key, %hash, "loaded preimage part");
        Ok(())
    }
}

#[async_trait]
impl<S: TxSender> GameContract for RpcGame<S> {
    fn address(&self) -> Address {
        self.address
    }

    async fn snapshot(&self) -> Result<FaultDisputeGame, ContractError> {
        use IFaultDisputeGame as G;
        let (len, status) = futures::try_join!(
            eth_call(&self.rpc, self.address, &G::claimDataLenCall {}),
            eth_call(&self.rpc, self.address, &G::statusCall {}),
        )?;
        let len = to_u64(len, "claim count")?;
        let claims = try_join_all((0..len).map(|index| async move {
            let call = G::claimDataCall { index: U256::from(index) };
            let tx = serde_json::json!({ "to": self.address, "data": Bytes::from(call.abi_encode()) });
            let out: Bytes = self.rpc.request("eth_call", serde_json::json!([tx, "latest"])).await?;
            claim_from_abi(&out)
        }))
        .await?;
        let resolved = try_join_all((0..len).map(|index| async move {
            let call = G::resolvedSubgamesCall { index: U256::from(index) };
            eth_call(&self.rpc, self.address, &call).await
        }))
        .await?;

        Ok(FaultDisputeGame::from_record(GameRecord {
            config: self.config,
            address: self.address,
            l1_head: self.l1_head,
            anchor: self.anchor,
            l2_block_number: self.l2_block_number,
            created_at: self.created_at,
            claims,
            resolved,
            status: status_from_abi(status)?,
        })?)
    }

    async fn make_move(
        &self,
        parent_index: usize,
        value: B256,
        is_attack: bool,
        bond: U256,
        _now: u64,
    ) -> Result<(), ContractError> {
        let disputed = eth_call(
            &self.rpc,
            self.address,
            &IFaultDisputeGame::claimDataCall { index: U256::from(parent_index) },
        )
        .await?
        .claim;
        let call = IFaultDisputeGame::moveCall {
            disputed,
            parentIndex: U256::from(parent_index),
            claim: value,
            isAttack: is_attack,
        };
        let hash = self.send(self.address, &call, bond).await?;
        info!(target: "opcore::dispute", game = %self.address, parent_index, is_attack, %hash, "sent move");
        Ok(())
    }

    async fn step(
        &self,
        claim_index: usize,
        is_attack: bool,
        data: &StepData,
        _now: u64,
    ) -> Result<(), ContractError> {
        self.load_oracle_data(claim_index, data).await?;
        let call = IFaultDisputeGame::stepCall {
            claimIndex: U256::from(claim_index),
            isAttack: is_attack,
            stateData: data.pre_state.clone().into(),
            proof: data.proof.clone().into(),
        };
        let hash = self.send(self.address, &call, U256::ZERO).await?;
        info!(target: "opcore::dispute", game = %self.address, claim_index, is_attack, %hash, "sent step");
        Ok(())
    }

    async fn resolve_claim(&self, index: usize, _now: u64) -> Result<(), ContractError> {
        // Zero resolves every child in one transaction.
        let call = IFaultDisputeGame::resolveClaimCall {
            claimIndex: U256::from(index),
            numToResolve: U256::ZERO,
        };
        self.send(self.address, &call, U256::ZERO).await?;
        Ok(())
    }

    async fn resolve(&self, _now: u64) -> Result<GameStatus, ContractError> {
        let hash = self.send(self.address, &IFaultDisputeGame::resolveCall {}, U256::ZERO).await?;
        let status = status_from_abi(eth_call(&self.rpc, self.address, &IFaultDisputeGame::statusCall {}).await?)?;
        info!(target: "opcore::dispute", game = %self.address, ?status, %hash, "resolved game");
        Ok(status)
    }

    async fn claim_credit(&self) -> Result<U256, ContractError> {
        let account = self.sender.sender();
        let credit =
            eth_call(&self.rpc, self.address, &IFaultDisputeGame::creditCall { account }).await?;
        if credit.is_zero() {
            return Ok(credit);
        }
        self.send(self.address, &IFaultDisputeGame::claimCreditCall { recipient: account }, U256::ZERO)
            .await?;
        Ok(credit)
    }
}

/// Games of one type listed by the dispute game factory.
#[derive(Debug, Clone)]
pub struct RpcGameFactory {
    rpc: Arc<RpcClient>,
    address: Address,
    game_type: u32,
}

impl RpcGameFactory {
    pub const fn new(rpc: Arc<RpcClient>, address: Address, game_type: u32) -> Self {
        Self { rpc, address, game_type }
    }

    /// Games created at or after `since`, newest first.
    pub async fn games_since(&self, since: u64) -> Result<Vec<Address>, ContractError> {
        let count = eth_call(&self.rpc, self.address, &IDisputeGameFactory::gameCountCall {}).await?;
        let mut games = Vec::new();
        let mut index = to_u64(count, "game count")?;
        while index > 0 {
            index -= 1;
            let call = IDisputeGameFactory::gameAtIndexCall { index: U256::from(index) };
            let game = eth_call(&self.rpc, self.address, &call).await?;
            if game.timestamp < since {
                break;
            }
            if game.gameType == self.game_type {
                games.push(game.proxy);
            }
        }
        Ok(games)
    }

    pub async fn status(&self, game: Address) -> Result<GameStatus, ContractError> {
        status_from_abi(eth_call(&self.rpc, game, &IFaultDisputeGame::statusCall {}).await?)
    }
}

/// Finds live games through the factory and plays each with the honest trace of `outputs` and
/// the fault proof program.
pub struct RpcGameSource<S, O> {
    factory: RpcGameFactory,
    sender: S,
    outputs: O,
    exec: VmTraceCreator,
    window: u64,
}

impl<S, O> fmt::Debug for RpcGameSource<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcGameSource")
            .field("factory", &self.factory)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl<S, O> RpcGameSource<S, O> {
    /// Games older than `window` seconds are left alone.
    pub const fn new(factory: RpcGameFactory, sender: S, outputs: O, exec: VmTraceCreator, window: u64) -> Self {
        Self { factory, sender, outputs, exec, window }
    }
}

#[async_trait]
impl<S, O> GameSource for RpcGameSource<S, O>
where
    S: TxSender + Clone + 'static,
    O: OutputSource + Clone + 'static,
{
    async fn games(&self, now: u64) -> Result<Vec<Address>, ContractError> {
        let mut live = Vec::new();
        for game in self.factory.games_since(now.saturating_sub(self.window)).await? {
            if self.factory.status(game).await? == GameStatus::InProgress {
                live.push(game);
            }
        }
        Ok(live)
    }

    async fn player(&self, game: Address) -> Result<Arc<dyn GamePlayer>, ContractError> {
        let contract = RpcGame::connect(game, self.factory.rpc.clone(), self.sender.clone())
            .await?
            .with_vm(self.exec.vm());
        let config = *contract.config();
        let prestate = self.exec.prestate_hash();
        if config.absolute_prestate != prestate {
            warn!(target: "opcore::dispute", %game, expected = %prestate, got = %config.absolute_prestate, "game runs another program");
            return Err(ContractError::PrestateMismatch { expected: prestate, got: config.absolute_prestate });
        }
        let trace = SplitTraceProvider::new(
            OutputTraceProvider::new(
                self.outputs.clone(),
                contract.anchor().block_number,
                contract.l2_block_number(),
                config.split_depth,
            ),
            TraceCache::new(self.exec.with_depth(config.exec_depth())),
            config.split_depth,
        );
        Ok(Arc::new(Agent::new(trace, contract)))
    }
}
