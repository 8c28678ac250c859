//! Resource budget and scoped acquisition.
//!
//! The [`ResourceManager`] owns the live usage counters. A grant covers every
//! dimension of a requirement at once and is returned as a [`ResourceGuard`];
//! dropping the guard gives the resources back and wakes waiting acquirers.

use crate::error::ExecutionError;
use regress_proto::ResourceRequirement;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Configured ceilings. A memory or CPU ceiling of zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBudget {
    pub max_units: u32,
    pub max_memory_mb: u64,
    pub max_cpu_millis: u32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        let units = std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(4);
        Self::units(units)
    }
}

impl ResourceBudget {
    /// A budget limited only by concurrency units.
    pub fn units(max_units: u32) -> Self {
        Self {
            max_units,
            max_memory_mb: 0,
            max_cpu_millis: 0,
        }
    }

    pub fn with_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    pub fn with_cpu_millis(mut self, max_cpu_millis: u32) -> Self {
        self.max_cpu_millis = max_cpu_millis;
        self
    }

    /// Explains why `req` can never be granted under this budget, if it can't.
    pub fn rejects(&self, req: &ResourceRequirement) -> Option<String> {
        if req.effective_units() > self.max_units {
            return Some(format!(
                "requires {} units but the budget allows {}",
                req.effective_units(),
                self.max_units
            ));
        }
        if self.max_memory_mb > 0 && req.memory_mb > self.max_memory_mb {
            return Some(format!(
                "requires {}MB but the budget allows {}MB",
                req.memory_mb, self.max_memory_mb
            ));
        }
        if self.max_cpu_millis > 0 && req.cpu_millis > self.max_cpu_millis {
            return Some(format!(
                "requires {}m CPU but the budget allows {}m",
                req.cpu_millis, self.max_cpu_millis
            ));
        }
        None
    }
}

/// Live usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub units: u32,
    pub memory_mb: u64,
    pub cpu_millis: u32,
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "units={} memory={}MB cpu={}m",
            self.units, self.memory_mb, self.cpu_millis
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    usage: ResourceUsage,
    peak_units: u32,
}

/// Grants and releases budget on behalf of running scenarios.
#[derive(Debug)]
pub struct ResourceManager {
    budget: ResourceBudget,
    counters: Mutex<Counters>,
    released: Notify,
}

impl ResourceManager {
    pub fn new(budget: ResourceBudget) -> Arc<Self> {
        Arc::new(Self {
            budget,
            counters: Mutex::new(Counters::default()),
            released: Notify::new(),
        })
    }

    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    /// Snapshot of current usage.
    pub fn usage(&self) -> ResourceUsage {
        self.counters().usage
    }

    /// Highest number of units held at once since the manager was created.
    pub fn peak_units(&self) -> u32 {
        self.counters().peak_units
    }

    /// Grants `req` if it fits right now, without waiting.
    ///
    /// Returns `Ok(None)` when the budget is temporarily full and
    /// `ResourceExhausted` when the requirement can never fit.
    pub fn try_acquire(
        self: &Arc<Self>,
        req: ResourceRequirement,
    ) -> Result<Option<ResourceGuard>, ExecutionError> {
        self.check_fits(&req)?;
        Ok(self.grant(req))
    }

    /// Waits until `req` fits and grants it.
    pub async fn acquire(
        self: &Arc<Self>,
        req: ResourceRequirement,
    ) -> Result<ResourceGuard, ExecutionError> {
        self.check_fits(&req)?;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(guard) = self.grant(req) {
                return Ok(guard);
            }
            trace!(requirement = %req, "Waiting for resources");
            notified.await;
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up after `wait`.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        req: ResourceRequirement,
        wait: Duration,
    ) -> Result<ResourceGuard, ExecutionError> {
        tokio::time::timeout(wait, self.acquire(req))
            .await
            .map_err(|_| ExecutionError::ResourceExhausted {
                reason: format!("no capacity for {req} within {wait:?}"),
            })?
    }

    fn check_fits(&self, req: &ResourceRequirement) -> Result<(), ExecutionError> {
        match self.budget.rejects(req) {
            Some(reason) => Err(ExecutionError::ResourceExhausted { reason }),
            None => Ok(()),
        }
    }

    fn grant(self: &Arc<Self>, req: ResourceRequirement) -> Option<ResourceGuard> {
        let units = req.effective_units();
        let mut counters = self.counters();
        let usage = &mut counters.usage;

        let units_fit = usage.units + units <= self.budget.max_units;
        let memory_fits = self.budget.max_memory_mb == 0
            || usage.memory_mb + req.memory_mb <= self.budget.max_memory_mb;
        let cpu_fits = self.budget.max_cpu_millis == 0
            || usage.cpu_millis + req.cpu_millis <= self.budget.max_cpu_millis;
        if !(units_fit && memory_fits && cpu_fits) {
            return None;
        }

        usage.units += units;
        usage.memory_mb += req.memory_mb;
        usage.cpu_millis += req.cpu_millis;
        counters.peak_units = counters.peak_units.max(counters.usage.units);
        debug!(requirement = %req, usage = %counters.usage, "Granted resources");

        Some(ResourceGuard {
            manager: Arc::clone(self),
            granted: ResourceRequirement {
                units,
                ..req
            },
        })
    }

    fn release(&self, granted: ResourceRequirement) {
        {
            let mut counters = self.counters();
            let usage = &mut counters.usage;
            usage.units = usage.units.saturating_sub(granted.units);
            usage.memory_mb = usage.memory_mb.saturating_sub(granted.memory_mb);
            usage.cpu_millis = usage.cpu_millis.saturating_sub(granted.cpu_millis);
            debug!(requirement = %granted, usage = %counters.usage, "Released resources");
        }
        self.released.notify_waiters();
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped grant. Resources return to the manager when this is dropped.
#[derive(Debug)]
#[must_use = "resources are released as soon as the guard is dropped"]
pub struct ResourceGuard {
    manager: Arc<ResourceManager>,
    granted: ResourceRequirement,
}

impl ResourceGuard {
    /// What this guard holds. Units are the effective (charged) count.
    pub fn granted(&self) -> ResourceRequirement {
        self.granted
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.manager.release(self.granted);
    }
}
