//! Execution sampler: attributes scheduler stalls to resource classes.
//!
//! Every tick (2 s by default) the sampler classifies the current
//! bottleneck and charges the elapsed interval to that class. Collection
//! never blocks pip execution: a tick that loses the lock race is skipped
//! and its elapsed time lands on the previously-observed class at the next
//! successful tick.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use strum::IntoEnumIterator;
use sysinfo::System;
use tracing::trace;

/// The resource class a stalled interval is attributed to.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, strum::Display, strum::EnumIter,
)]
pub enum BottleneckClass {
    GraphShape,
    Cpu,
    Disk,
    Memory,
    ProjectedMemory,
    Semaphore,
    ConcurrencyLimit,
    Other,
}

/// Which admission control limited the scheduler most recently.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LimiterKind {
    Semaphore,
    ProjectedMemory,
    GenericSlot,
}

/// One tick's worth of scheduler and machine state.
#[derive(Copy, Clone, Debug, Default)]
pub struct SampleSnapshot {
    pub last_limiter: Option<LimiterKind>,
    pub cpu_percent: f64,
    pub available_ram_mb: u64,
    /// Busiest disk's active-time percentage over the interval.
    pub max_disk_active_percent: f64,
    pub ready_pips: usize,
}

struct SamplerState {
    counters: BTreeMap<BottleneckClass, u64>,
    last_class: BottleneckClass,
    last_tick: Instant,
}

/// Accumulates per-class stall milliseconds.
pub struct ExecutionSampler {
    interval: Duration,
    state: Mutex<SamplerState>,
    skipped: AtomicBool,
    // 0 = none, else LimiterKind discriminant + 1.
    last_limiter: AtomicU8,
}

impl ExecutionSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(SamplerState {
                counters: BTreeMap::new(),
                last_class: BottleneckClass::Other,
                last_tick: Instant::now(),
            }),
            skipped: AtomicBool::new(false),
            last_limiter: AtomicU8::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record that an admission control limited the scheduler. The next
    /// tick classifies against the most recent limiter.
    pub fn note_limiter(&self, kind: LimiterKind) {
        let encoded = match kind {
            LimiterKind::Semaphore => 1,
            LimiterKind::ProjectedMemory => 2,
            LimiterKind::GenericSlot => 3,
        };
        self.last_limiter.store(encoded, Ordering::Relaxed);
    }

    /// The most recent limiter, consumed on read.
    pub fn take_limiter(&self) -> Option<LimiterKind> {
        match self.last_limiter.swap(0, Ordering::Relaxed) {
            1 => Some(LimiterKind::Semaphore),
            2 => Some(LimiterKind::ProjectedMemory),
            3 => Some(LimiterKind::GenericSlot),
            _ => None,
        }
    }

    /// Classify one snapshot. The priority order is contractual: admission
    /// limiters first, then machine pressure, then graph shape.
    pub fn classify(snapshot: &SampleSnapshot) -> BottleneckClass {
        if let Some(limiter) = snapshot.last_limiter {
            return match limiter {
                LimiterKind::Semaphore => BottleneckClass::Semaphore,
                LimiterKind::ProjectedMemory => BottleneckClass::ProjectedMemory,
                LimiterKind::GenericSlot => BottleneckClass::ConcurrencyLimit,
            };
        }
        if snapshot.cpu_percent > 98.0 {
            return BottleneckClass::Cpu;
        }
        if snapshot.available_ram_mb < 300 {
            return BottleneckClass::Memory;
        }
        if snapshot.max_disk_active_percent > 95.0 {
            return BottleneckClass::Disk;
        }
        if snapshot.ready_pips < 3 {
            return BottleneckClass::GraphShape;
        }
        BottleneckClass::Other
    }

    /// Record one tick. Non-blocking: if the lock is contended the tick is
    /// skipped and its time attributed at the next successful tick.
    pub fn sample(&self, snapshot: &SampleSnapshot) {
        let Ok(mut state) = self.state.try_lock() else {
            self.skipped.store(true, Ordering::Relaxed);
            return;
        };
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_tick).as_millis() as u64;
        state.last_tick = now;

        let class = if self.skipped.swap(false, Ordering::Relaxed) {
            state.last_class
        } else {
            Self::classify(snapshot)
        };
        *state.counters.entry(class).or_default() += elapsed_ms;
        state.last_class = Self::classify(snapshot);
        trace!(%class, elapsed_ms, "sampled");
    }

    /// Accumulated milliseconds per class.
    pub fn accumulated_ms(&self) -> BTreeMap<BottleneckClass, u64> {
        self.state
            .lock()
            .expect("sampler poisoned")
            .counters
            .clone()
    }

    /// Integer percentage breakdown summing to exactly 100. Rounding
    /// remainder lands on [`BottleneckClass::Other`].
    pub fn percentages(&self) -> BTreeMap<BottleneckClass, u32> {
        let counters = self.accumulated_ms();
        let total: u64 = counters.values().sum();
        let mut breakdown: BTreeMap<BottleneckClass, u32> =
            BottleneckClass::iter().map(|class| (class, 0)).collect();
        if total == 0 {
            breakdown.insert(BottleneckClass::Other, 100);
            return breakdown;
        }
        let mut assigned = 0u32;
        for (class, ms) in &counters {
            let pct = (ms * 100 / total) as u32;
            breakdown.insert(*class, pct);
            assigned += pct;
        }
        let other = breakdown.entry(BottleneckClass::Other).or_default();
        *other += 100 - assigned;
        breakdown
    }
}

/// Snapshot source backed by `sysinfo` for CPU and memory; scheduler
/// counters come from the caller.
pub struct SystemSnapshotSource {
    system: Mutex<System>,
}

impl SystemSnapshotSource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Take one snapshot, combining machine pressure with scheduler state.
    pub fn snapshot(
        &self,
        sampler: &ExecutionSampler,
        max_disk_active_percent: f64,
        ready_pips: usize,
    ) -> SampleSnapshot {
        let mut system = self.system.lock().expect("snapshot source poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        SampleSnapshot {
            last_limiter: sampler.take_limiter(),
            cpu_percent: system.global_cpu_usage() as f64,
            available_ram_mb: system.available_memory() / (1024 * 1024),
            max_disk_active_percent,
            ready_pips,
        }
    }
}

impl Default for SystemSnapshotSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;

    fn snapshot() -> SampleSnapshot {
        SampleSnapshot {
            last_limiter: None,
            cpu_percent: 20.0,
            available_ram_mb: 8192,
            max_disk_active_percent: 10.0,
            ready_pips: 64,
        }
    }

    #[test_case(
        SampleSnapshot { last_limiter: Some(LimiterKind::Semaphore), cpu_percent: 99.9, ..snapshot() },
        BottleneckClass::Semaphore;
        "limiter beats cpu"
    )]
    #[test_case(
        SampleSnapshot { last_limiter: Some(LimiterKind::ProjectedMemory), ..snapshot() },
        BottleneckClass::ProjectedMemory;
        "projected memory limiter"
    )]
    #[test_case(
        SampleSnapshot { last_limiter: Some(LimiterKind::GenericSlot), ..snapshot() },
        BottleneckClass::ConcurrencyLimit;
        "generic slot limiter"
    )]
    #[test_case(
        SampleSnapshot { cpu_percent: 99.0, ..snapshot() },
        BottleneckClass::Cpu;
        "cpu saturation"
    )]
    #[test_case(
        SampleSnapshot { available_ram_mb: 128, ..snapshot() },
        BottleneckClass::Memory;
        "low memory"
    )]
    #[test_case(
        SampleSnapshot { max_disk_active_percent: 97.0, ..snapshot() },
        BottleneckClass::Disk;
        "busy disk"
    )]
    #[test_case(
        SampleSnapshot { ready_pips: 1, ..snapshot() },
        BottleneckClass::GraphShape;
        "starved scheduler"
    )]
    #[test_case(snapshot(), BottleneckClass::Other; "nothing stands out")]
    #[test]
    fn classification_priority(snapshot: SampleSnapshot, expected: BottleneckClass) {
        self::assert_eq!(ExecutionSampler::classify(&snapshot), expected);
    }

    #[test]
    fn percentages_sum_to_one_hundred() {
        let sampler = ExecutionSampler::new(Duration::from_millis(1));
        sampler.sample(&SampleSnapshot {
            cpu_percent: 99.0,
            ..snapshot()
        });
        std::thread::sleep(Duration::from_millis(5));
        sampler.sample(&snapshot());
        std::thread::sleep(Duration::from_millis(3));
        sampler.sample(&SampleSnapshot {
            ready_pips: 0,
            ..snapshot()
        });

        let breakdown = sampler.percentages();
        let total: u32 = breakdown.values().sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn empty_sampler_attributes_everything_to_other() {
        let sampler = ExecutionSampler::new(Duration::from_secs(2));
        let breakdown = sampler.percentages();
        assert_eq!(breakdown[&BottleneckClass::Other], 100);
        assert_eq!(breakdown.values().sum::<u32>(), 100);
    }

    #[test]
    fn limiter_notes_are_consumed_once() {
        let sampler = ExecutionSampler::new(Duration::from_secs(2));
        sampler.note_limiter(LimiterKind::Semaphore);
        assert_eq!(sampler.take_limiter(), Some(LimiterKind::Semaphore));
        assert_eq!(sampler.take_limiter(), None);
    }
}
