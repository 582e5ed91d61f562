use std::time::{Duration, Instant};

use log::info;

/// Counts completions and logs throughput. Never influences control flow.
pub struct ProgressReporter {
    total: usize,
    completed: usize,
    every: usize,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(total: usize, every: usize) -> Self {
        ProgressReporter {
            total,
            completed: 0,
            every: every.max(1),
            started: Instant::now(),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn average(&self) -> Duration {
        match u32::try_from(self.completed) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.elapsed() / n,
        }
    }

    pub fn remaining(&self) -> Duration {
        let left = self.total.saturating_sub(self.completed);
        self.average().saturating_mul(u32::try_from(left).unwrap_or(u32::MAX))
    }

    /// Records one completion; returns true when a report line was logged.
    pub fn tick(&mut self) -> bool {
        self.completed += 1;
        if self.completed % self.every != 0 && self.completed != self.total {
            return false;
        }
        info!("Processed {}/{} games", self.completed, self.total);
        info!("Average time per game: {:.2} seconds", self.average().as_secs_f64());
        info!("Estimated time remaining: {:.2} minutes", self.remaining().as_secs_f64() / 60.0);
        true
    }
}
