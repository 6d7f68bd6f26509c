//! Timing, memory sampling and cancellation for one route execution.
//!
//! The governor opens a [`GovernorScope`] around the whole route, not each
//! stage. The scope carries the cancellation token every suspension point
//! checks, and samples memory at those points so a cleanup pass can run
//! before the route continues.

use crate::error::ConvertError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Source of memory usage samples.
#[cfg_attr(test, mockall::automock)]
pub trait MemorySampler: Send + Sync {
    /// Bytes in use, or `None` when the host cannot tell.
    fn sample(&self) -> Option<u64>;

    /// Asks the host to give freed memory back.
    fn reclaim(&self);
}

/// Samples the resident memory of the current process via `sysinfo`.
pub struct ProcessMemorySampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn sample(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|process| process.memory())
    }

    fn reclaim(&self) {
        // Rust frees eagerly; releasing our own buffers is all there is to do.
    }
}

/// Measurements of one governed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GovernorReport {
    pub duration_ms: u64,
    pub memory_delta_bytes: i64,
    pub peak_memory_bytes: u64,
    pub cleanup_passes: u32,
}

/// Result of [`PerformanceGovernor::run_with_governance`]. The report is
/// produced on success and failure alike.
#[derive(Debug)]
pub struct Governed<T> {
    pub result: Result<T, ConvertError>,
    pub report: GovernorReport,
}

#[derive(Default)]
struct ScopeStats {
    peak: AtomicU64,
    cleanups: AtomicU32,
}

/// Handle given to the governed operation.
#[derive(Clone)]
pub struct GovernorScope {
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    sampler: Arc<dyn MemorySampler>,
    soft_limit: u64,
    memory_cap: u64,
    stats: Arc<ScopeStats>,
}

impl GovernorScope {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails if the scope was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), ConvertError> {
        if Instant::now() >= self.deadline {
            self.token.cancel();
            return Err(ConvertError::Timeout(self.timeout));
        }
        if self.token.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        Ok(())
    }

    /// Suspension point: yields to the runtime, checks cancellation and
    /// samples memory.
    ///
    /// Above the soft limit `cleanup` runs synchronously before returning.
    /// Only a sample at or above the hard cap after cleanup is an error.
    pub async fn checkpoint<F: FnOnce()>(&self, cleanup: F) -> Result<(), ConvertError> {
        tokio::task::yield_now().await;
        self.check()?;

        let Some(used) = self.sample() else {
            return Ok(());
        };
        if used < self.soft_limit {
            return Ok(());
        }

        warn!(
            used_bytes = used,
            soft_limit = self.soft_limit,
            "Memory above soft limit, running cleanup pass"
        );
        cleanup();
        self.sampler.reclaim();
        self.stats.cleanups.fetch_add(1, Ordering::Relaxed);

        match self.sample() {
            Some(after) if after >= self.memory_cap => Err(ConvertError::Memory {
                used: after,
                cap: self.memory_cap,
            }),
            _ => Ok(()),
        }
    }

    fn sample(&self) -> Option<u64> {
        let used = self.sampler.sample()?;
        self.stats.peak.fetch_max(used, Ordering::Relaxed);
        Some(used)
    }
}

/// Wraps a full route execution with a timeout and memory governance.
pub struct PerformanceGovernor {
    sampler: Arc<dyn MemorySampler>,
    soft_memory_ratio: f64,
}

impl PerformanceGovernor {
    pub fn new(sampler: Arc<dyn MemorySampler>, soft_memory_ratio: f64) -> Self {
        Self {
            sampler,
            soft_memory_ratio,
        }
    }

    /// Runs `op` under one end-to-end timeout and memory budget.
    ///
    /// Exceeding `timeout` cancels the scope token, drops the in-flight
    /// operation and returns `Timeout`. Cancelling `token` returns
    /// `Cancelled`.
    pub async fn run_with_governance<T, F, Fut>(
        &self,
        token: &CancellationToken,
        timeout: Duration,
        memory_cap: u64,
        op: F,
    ) -> Governed<T>
    where
        F: FnOnce(GovernorScope) -> Fut,
        Fut: Future<Output = Result<T, ConvertError>>,
    {
        let started = Instant::now();
        let baseline = self.sampler.sample().unwrap_or(0);
        let scope = GovernorScope {
            token: token.child_token(),
            deadline: started + timeout,
            timeout,
            sampler: Arc::clone(&self.sampler),
            soft_limit: (memory_cap as f64 * self.soft_memory_ratio) as u64,
            memory_cap,
            stats: Arc::new(ScopeStats::default()),
        };
        scope.stats.peak.store(baseline, Ordering::Relaxed);
        let scope_token = scope.token.clone();
        let stats = Arc::clone(&scope.stats);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ConvertError::Cancelled),
            result = op(scope) => result,
            _ = tokio::time::sleep(timeout) => {
                scope_token.cancel();
                Err(ConvertError::Timeout(timeout))
            }
        };

        let end = self.sampler.sample().unwrap_or(baseline);
        let report = GovernorReport {
            duration_ms: started.elapsed().as_millis() as u64,
            memory_delta_bytes: end as i64 - baseline as i64,
            peak_memory_bytes: stats.peak.load(Ordering::Relaxed).max(end),
            cleanup_passes: stats.cleanups.load(Ordering::Relaxed),
        };
        debug!(
            duration_ms = report.duration_ms,
            memory_delta = report.memory_delta_bytes,
            cleanups = report.cleanup_passes,
            ok = result.is_ok(),
            "Governed execution finished"
        );

        Governed { result, report }
    }
}
