use std::{fmt, sync::Arc};

use alloy_primitives::B256;
use async_trait::async_trait;
use schnellru::{ByLength, LruMap};
use tokio::sync::Mutex;
use tracing::trace;

use super::{PreimageOracleData, StepData, TraceError, TraceProvider};
use crate::{
    mips::{PreimageAccess, VmError},
    position::Position,
    preimage::{local, LocalInputs, OracleUpdate, PreimageKey, PreimageKeyType, PreimageSource, PreimageStore},
    vm::{ExecVm, VmKind, VmProgram},
};

/// State hashes remembered per provider.
const HASH_CACHE_SIZE: u32 = 4096;

/// Execution trace of one program run. Trace index `i` is the state after `i + 1` steps; once
/// the program exits every later index repeats the final state.
pub struct VmTraceProvider<S> {
    program: Arc<VmProgram>,
    source: S,
    depth: u8,
    prestate: B256,
    hashes: Mutex<LruMap<u64, B256>>,
}

impl<S> fmt::Debug for VmTraceProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmTraceProvider")
            .field("vm", &self.program.kind())
            .field("depth", &self.depth)
            .field("prestate", &self.prestate)
            .finish_non_exhaustive()
    }
}

impl<S> VmTraceProvider<S>
where
    S: PreimageSource + Clone + Sync + 'static,
{
    pub fn new(program: Arc<VmProgram>, source: S, depth: u8) -> Self {
        let prestate = program.prestate_hash();
        Self {
            program,
            source,
            depth,
            prestate,
            hashes: Mutex::new(LruMap::new(ByLength::new(HASH_CACHE_SIZE))),
        }
    }

    pub const fn depth(&self) -> u8 {
        self.depth
    }

    fn steps_before(&self, position: Position) -> Result<u64, TraceError> {
        let index = position.trace_index(self.depth);
        u64::try_from(index).map_err(|_| TraceError::IndexTooLarge(index))
    }

    /// Run `f` against a fresh VM on the blocking pool.
    async fn with_vm<T, F>(&self, f: F) -> Result<T, TraceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ExecVm<S>) -> Result<T, VmError> + Send + 'static,
    {
        let program = VmProgram::clone(&self.program);
        let source = self.source.clone();
        let result = tokio::task::spawn_blocking(move || f(&mut program.start(source)))
            .await
            .map_err(|err| TraceError::Join(err.to_string()))?;
        Ok(result?)
    }
}

/// How to load what a step read, falling back to the read bytes for content-addressed keys.
fn oracle_data<S: PreimageSource>(
    source: &S,
    access: PreimageAccess,
) -> Result<PreimageOracleData, TraceError> {
    let key = PreimageKey::from_raw(access.key);
    let update = source.oracle_update(key).or_else(|| match key.key_type() {
        Ok(PreimageKeyType::Keccak256) => Some(OracleUpdate::Keccak256(access.value.clone())),
        Ok(PreimageKeyType::Sha256) => Some(OracleUpdate::Sha256(access.value.clone())),
        _ => None,
    });
    let update = update.ok_or(TraceError::UnknownPreimage(key))?;
    Ok(PreimageOracleData { key, offset: access.offset, update })
}

#[async_trait]
impl<S> TraceProvider for VmTraceProvider<S>
where
    S: PreimageSource + Clone + Sync + 'static,
{
    async fn get(&self, position: Position) -> Result<B256, TraceError> {
        let steps = self.steps_before(position)? + 1;
        if let Some(hash) = self.hashes.lock().await.get(&steps) {
            return Ok(*hash);
        }
        let hash = self
            .with_vm(move |vm| {
                vm.run_to(steps)?;
                Ok(vm.state_hash())
            })
            .await?;
        trace!(target: "opcore::dispute", steps, %hash, "vm state");
        self.hashes.lock().await.insert(steps, hash);
        Ok(hash)
    }

    async fn get_step_data(&self, position: Position) -> Result<StepData, TraceError> {
        let steps = self.steps_before(position)?;
        let (step, oracle) = self
            .with_vm(move |vm| {
                vm.run_to(steps)?;
                let mut step = vm.prove_step()?;
                let access = step.preimage.take();
                Ok((step, access.map(|access| oracle_data(vm.source(), access))))
            })
            .await?;
        Ok(StepData { pre_state: step.pre_state, proof: step.proof, oracle: oracle.transpose()? })
    }

    async fn absolute_prestate(&self) -> Result<B256, TraceError> {
        Ok(self.prestate)
    }
}

/// Builds the execution trace for one pair of outputs.
#[async_trait]
pub trait ExecTraceCreator: Send + Sync {
    type Provider: TraceProvider + 'static;

    async fn create(&self, inputs: LocalInputs) -> Result<Self::Provider, TraceError>;
}

/// Runs a fixed program against a preimage store extended with the sub-game's local inputs.
#[derive(Debug, Clone)]
pub struct VmTraceCreator {
    program: Arc<VmProgram>,
    store: PreimageStore,
    depth: u8,
}

impl VmTraceCreator {
    pub fn new(program: impl Into<VmProgram>, store: PreimageStore, depth: u8) -> Self {
        Self { program: Arc::new(program.into()), store, depth }
    }

    /// The same program and preimages, for execution sub-games of another depth.
    pub fn with_depth(&self, depth: u8) -> Self {
        Self { depth, ..self.clone() }
    }

    pub fn prestate_hash(&self) -> B256 {
        self.program.prestate_hash()
    }

    pub fn vm(&self) -> VmKind {
        self.program.kind()
    }
}

#[async_trait]
impl ExecTraceCreator for VmTraceCreator {
    type Provider = VmTraceProvider<PreimageStore>;

    async fn create(&self, inputs: LocalInputs) -> Result<Self::Provider, TraceError> {
        let mut store = self.store.clone();
        for ident in [
            local::L1_HEAD,
            local::STARTING_OUTPUT_ROOT,
            local::DISPUTED_OUTPUT_ROOT,
            local::DISPUTED_L2_BLOCK_NUMBER,
            local::CHAIN_ID,
        ] {
            if let Some((word, size)) = inputs.local_data(ident) {
                store.insert_local(ident, &word[..size]);
            }
        }
        Ok(VmTraceProvider::new(self.program.clone(), store, self.depth))
    }
}
