//! Resource limiting: step budgets and the Wasm memory limiter.

use wasmtime::ResourceLimiter;

/// A countdown of interpreter steps. `None` means unmetered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepBudget {
    remaining: Option<u64>,
}

impl StepBudget {
    /// A budget of `steps`, or unmetered.
    pub fn new(steps: Option<u64>) -> Self {
        Self { remaining: steps }
    }

    /// Steps left, if metered.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Replace the budget.
    pub fn set(&mut self, steps: Option<u64>) {
        self.remaining = steps;
    }

    /// Consume one step. Returns `false` once the budget is spent.
    pub fn charge(&mut self) -> bool {
        match &mut self.remaining {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

/// Resource limiter that enforces memory and table size limits.
pub struct SandboxLimiter {
    /// Maximum memory in bytes.
    max_memory: u64,
    /// Current memory allocation.
    current_memory: u64,
    /// Peak memory allocation (highest ever seen).
    peak_memory: u64,
    /// Maximum table elements.
    max_table_elements: u64,
    /// Whether the limit has been exceeded since the last reset.
    limit_exceeded: bool,
}

impl SandboxLimiter {
    /// Create a new resource limiter with the specified memory limit.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            peak_memory: 0,
            max_table_elements: 10_000,
            limit_exceeded: false,
        }
    }

    /// Check if any limit has been exceeded.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Clear the exceeded flag before a new evaluation.
    pub fn reset(&mut self) {
        self.limit_exceeded = false;
    }

    /// Get the current memory usage.
    pub fn current_memory(&self) -> u64 {
        self.current_memory
    }

    /// Get the peak memory usage (highest ever observed).
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// Get the configured maximum memory.
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired_bytes = desired as u64;

        if desired_bytes > self.max_memory {
            self.limit_exceeded = true;
            return Ok(false);
        }

        self.current_memory = desired_bytes;
        self.peak_memory = self.peak_memory.max(desired_bytes);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired as u64 > self.max_table_elements {
            self.limit_exceeded = true;
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_counts_down() {
        let mut budget = StepBudget::new(Some(2));
        assert!(budget.charge());
        assert!(budget.charge());
        assert!(!budget.charge());
        assert_eq!(budget.remaining(), Some(0));
    }

    #[test]
    fn test_unmetered_budget_never_runs_out() {
        let mut budget = StepBudget::default();
        for _ in 0..1000 {
            assert!(budget.charge());
        }
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn test_limiter_allows_within_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);

        assert!(limiter.memory_growing(0, 512 * 1024, None).unwrap());
        assert!(!limiter.limit_exceeded());
        assert_eq!(limiter.peak_memory(), 512 * 1024);
    }

    #[test]
    fn test_limiter_denies_over_limit() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);

        assert!(!limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap());
        assert!(limiter.limit_exceeded());
        limiter.reset();
        assert!(!limiter.limit_exceeded());
    }
}
