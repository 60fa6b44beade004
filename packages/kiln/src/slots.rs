//! Backpressure slot pools.
//!
//! Concurrency is bounded by five configurable pools. Failing to acquire a
//! slot immediately is not an error: the failure is noted with the
//! execution sampler (concurrency-limit bucket) and the caller either
//! waits or reschedules.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::EngineConfig,
    sampler::{ExecutionSampler, LimiterKind},
};

/// The work classes admission control distinguishes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, strum::Display)]
pub enum SlotKind {
    Process,
    CacheLookup,
    MaterializeInput,
    Ipc,
    Light,
}

/// The five bounded pools.
pub struct SlotPools {
    process: Arc<Semaphore>,
    cache_lookup: Arc<Semaphore>,
    materialize_input: Arc<Semaphore>,
    ipc: Arc<Semaphore>,
    light: Arc<Semaphore>,
    sampler: Arc<ExecutionSampler>,
}

impl SlotPools {
    pub fn new(config: &EngineConfig, sampler: Arc<ExecutionSampler>) -> Self {
        Self {
            process: Arc::new(Semaphore::new(config.effective_process_slots())),
            cache_lookup: Arc::new(Semaphore::new(config.effective_cache_lookup_slots())),
            materialize_input: Arc::new(Semaphore::new(config.effective_materialize_input_slots())),
            ipc: Arc::new(Semaphore::new(config.effective_ipc_slots())),
            light: Arc::new(Semaphore::new(config.effective_light_slots())),
            sampler,
        }
    }

    fn pool(&self, kind: SlotKind) -> &Arc<Semaphore> {
        match kind {
            SlotKind::Process => &self.process,
            SlotKind::CacheLookup => &self.cache_lookup,
            SlotKind::MaterializeInput => &self.materialize_input,
            SlotKind::Ipc => &self.ipc,
            SlotKind::Light => &self.light,
        }
    }

    /// Acquire a slot without waiting. `None` means the pool is exhausted;
    /// the admission failure is charged to the concurrency-limit bucket.
    pub fn try_acquire(&self, kind: SlotKind) -> Option<OwnedSemaphorePermit> {
        match Arc::clone(self.pool(kind)).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                self.sampler.note_limiter(LimiterKind::GenericSlot);
                None
            }
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self, kind: SlotKind) -> Result<OwnedSemaphorePermit> {
        if let Some(permit) = self.try_acquire(kind) {
            return Ok(permit);
        }
        Arc::clone(self.pool(kind))
            .acquire_owned()
            .await
            .with_context(|| format!("acquire {kind} slot"))
    }

    /// Remaining capacity, for diagnostics.
    pub fn available(&self, kind: SlotKind) -> usize {
        self.pool(kind).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sampler::BottleneckClass;

    fn pools(process_slots: usize) -> SlotPools {
        let config = EngineConfig {
            process_slots,
            ..EngineConfig::default()
        };
        let sampler = Arc::new(ExecutionSampler::new(Duration::from_secs(2)));
        SlotPools::new(&config, sampler)
    }

    #[tokio::test]
    async fn exhaustion_is_not_an_error() {
        let pools = pools(1);
        let held = pools.try_acquire(SlotKind::Process).unwrap();
        assert!(pools.try_acquire(SlotKind::Process).is_none());
        drop(held);
        assert!(pools.try_acquire(SlotKind::Process).is_some());
    }

    #[tokio::test]
    async fn admission_failures_reach_the_sampler() {
        let config = EngineConfig {
            process_slots: 1,
            ..EngineConfig::default()
        };
        let sampler = Arc::new(ExecutionSampler::new(Duration::from_secs(2)));
        let pools = SlotPools::new(&config, Arc::clone(&sampler));

        let _held = pools.try_acquire(SlotKind::Process).unwrap();
        assert!(pools.try_acquire(SlotKind::Process).is_none());

        let snapshot = crate::sampler::SampleSnapshot {
            last_limiter: sampler.take_limiter(),
            ..Default::default()
        };
        assert_eq!(
            ExecutionSampler::classify(&snapshot),
            BottleneckClass::ConcurrencyLimit
        );
    }

    #[tokio::test]
    async fn pools_are_independent() {
        let pools = pools(1);
        let _process = pools.acquire(SlotKind::Process).await.unwrap();
        // Exhausting the process pool leaves the light pool untouched.
        assert!(pools.available(SlotKind::Light) > 0);
        let _light = pools.acquire(SlotKind::Light).await.unwrap();
    }
}
