// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread-safe cost accumulator backed by atomic counters.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use std::time::Instant;
use strand_core::Cost;

/// Accumulates a thread's resource consumption.
///
/// Spend is stored as integer micro-dollars (1 USD = 1_000_000) so the
/// counter stays atomic.
pub struct CostAccumulator {
    turns: AtomicU32,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    spend_micro: AtomicU64,
    spawns: AtomicU32,
    start: Mutex<Option<Instant>>,
}

impl Default for CostAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl CostAccumulator {
    /// All counters start at zero; the timer is not running.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turns: AtomicU32::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            spend_micro: AtomicU64::new(0),
            spawns: AtomicU32::new(0),
            start: Mutex::new(None),
        }
    }

    /// Seed the accumulator from a prior snapshot (resume path).
    #[must_use]
    pub fn from_snapshot(cost: &Cost) -> Self {
        let acc = Self::new();
        acc.turns.store(cost.turns, Relaxed);
        acc.input_tokens.store(cost.input_tokens, Relaxed);
        acc.output_tokens.store(cost.output_tokens, Relaxed);
        acc.spend_micro
            .store((cost.spend_usd * 1_000_000.0) as u64, Relaxed);
        acc.spawns.store(cost.spawns, Relaxed);
        acc
    }

    /// Mark the beginning of execution (wall-clock timer).
    pub fn start_timer(&self) {
        *self.start.lock().expect("start mutex poisoned") = Some(Instant::now());
    }

    /// Record one LLM turn.
    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Relaxed);
    }

    /// Record token usage for one provider call.
    pub fn record_tokens(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Relaxed);
        self.output_tokens.fetch_add(output, Relaxed);
    }

    /// Record a spend increment in USD.
    pub fn record_spend(&self, usd: f64) {
        self.spend_micro
            .fetch_add((usd * 1_000_000.0) as u64, Relaxed);
    }

    /// Record a spawned child.
    pub fn record_spawn(&self) {
        self.spawns.fetch_add(1, Relaxed);
    }

    /// Current snapshot, including elapsed wall-clock time.
    #[must_use]
    pub fn snapshot(&self) -> Cost {
        let elapsed_ms = self
            .start
            .lock()
            .expect("start mutex poisoned")
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        Cost {
            turns: self.turns.load(Relaxed),
            input_tokens: self.input_tokens.load(Relaxed),
            output_tokens: self.output_tokens.load(Relaxed),
            spend_usd: self.spend_micro.load(Relaxed) as f64 / 1_000_000.0,
            spawns: self.spawns.load(Relaxed),
            duration_ms: elapsed_ms,
        }
    }
}

impl std::fmt::Debug for CostAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostAccumulator")
            .field("turns", &self.turns.load(Relaxed))
            .field("input_tokens", &self.input_tokens.load(Relaxed))
            .field("output_tokens", &self.output_tokens.load(Relaxed))
            .field("spend_micro", &self.spend_micro.load(Relaxed))
            .field("spawns", &self.spawns.load(Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let acc = CostAccumulator::new();
        acc.record_turn();
        acc.record_turn();
        acc.record_tokens(100, 40);
        acc.record_tokens(50, 10);
        acc.record_spend(0.25);
        acc.record_spawn();
        let snap = acc.snapshot();
        assert_eq!(snap.turns, 2);
        assert_eq!(snap.input_tokens, 150);
        assert_eq!(snap.output_tokens, 50);
        assert!((snap.spend_usd - 0.25).abs() < 1e-9);
        assert_eq!(snap.spawns, 1);
    }

    #[test]
    fn timer_reports_elapsed() {
        let acc = CostAccumulator::new();
        assert_eq!(acc.snapshot().duration_ms, 0);
        acc.start_timer();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(acc.snapshot().duration_ms >= 5);
    }

    #[test]
    fn snapshot_roundtrip() {
        let acc = CostAccumulator::new();
        acc.record_turn();
        acc.record_tokens(10, 5);
        acc.record_spend(0.5);
        let resumed = CostAccumulator::from_snapshot(&acc.snapshot());
        let snap = resumed.snapshot();
        assert_eq!(snap.turns, 1);
        assert_eq!(snap.input_tokens, 10);
        assert!((snap.spend_usd - 0.5).abs() < 1e-6);
    }
}
