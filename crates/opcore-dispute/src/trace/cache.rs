use std::{fmt, sync::Arc};

use alloy_primitives::B256;
use schnellru::{ByLength, LruMap};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ExecTraceCreator, TraceError};
use crate::preimage::LocalInputs;

/// Execution traces kept per game.
pub const DEFAULT_TRACE_CACHE_SIZE: u32 = 100;

/// Execution trace providers keyed by the local inputs they were built for. Failed builds are
/// not cached.
pub struct TraceCache<C: ExecTraceCreator> {
    creator: C,
    providers: Mutex<LruMap<B256, Arc<C::Provider>>>,
}

impl<C: ExecTraceCreator> fmt::Debug for TraceCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceCache").finish_non_exhaustive()
    }
}

impl<C: ExecTraceCreator> TraceCache<C> {
    pub fn new(creator: C) -> Self {
        Self::with_capacity(creator, DEFAULT_TRACE_CACHE_SIZE)
    }

    pub fn with_capacity(creator: C, capacity: u32) -> Self {
        Self { creator, providers: Mutex::new(LruMap::new(ByLength::new(capacity))) }
    }

    pub fn creator(&self) -> &C {
        &self.creator
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn get_or_create(&self, inputs: LocalInputs) -> Result<Arc<C::Provider>, TraceError> {
        let key = inputs.cache_key();
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&key) {
            return Ok(provider.clone());
        }
        debug!(
            target: "opcore::dispute",
            disputed_block = inputs.disputed_block,
            disputed = %inputs.disputed_output,
            "creating execution trace"
        );
        let provider = Arc::new(self.creator.create(inputs).await?);
        providers.insert(key, provider.clone());
        Ok(provider)
    }
}
