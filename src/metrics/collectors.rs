//! High-level metric recording for workers.
//!
//! [`WorkerMetricsRecorder`] binds the worker's identity labels once so
//! call sites record values without repeating label plumbing, and
//! [`ResourceSampler`] collects the process resource snapshot shared by
//! the heartbeat, the health endpoint, and the resource gauges.

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

use super::prometheus::{
    WORKER_CPU_PERCENT, WORKER_JOBS_FAILED_TOTAL, WORKER_JOBS_PROCESSED_TOTAL,
    WORKER_JOB_DURATION_SECONDS, WORKER_MEMORY_BYTES, WORKER_STATE, WORKER_UPTIME_SECONDS,
};
use crate::context::DeploymentContext;
use crate::worker::state::WorkerState;

/// Point-in-time resource usage of this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    /// Thread count (0 where /proc is unavailable).
    pub threads: u64,
    /// Open file descriptors (0 where /proc is unavailable).
    pub open_fds: u64,
}

/// Samples process resources via sysinfo plus /proc counters.
pub struct ResourceSampler {
    system: System,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Takes a snapshot. CPU usage is relative to the previous sample,
    /// so the first reading is zero.
    pub fn sample(&mut self) -> ResourceSnapshot {
        self.system.refresh_process(self.pid);
        let (cpu_percent, memory_bytes) = match self.system.process(self.pid) {
            Some(process) => (process.cpu_usage(), process.memory()),
            None => (0.0, 0),
        };
        ResourceSnapshot {
            cpu_percent,
            memory_bytes,
            threads: count_dir_entries("/proc/self/task"),
            open_fds: count_dir_entries("/proc/self/fd"),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn count_dir_entries(path: &str) -> u64 {
    std::fs::read_dir(path)
        .map(|entries| entries.count() as u64)
        .unwrap_or(0)
}

/// Records worker metrics under a fixed label set.
#[derive(Clone)]
pub struct WorkerMetricsRecorder {
    labels: [String; 6],
}

impl WorkerMetricsRecorder {
    pub fn new(worker_id: &str, class: &str, context: &DeploymentContext) -> Self {
        Self {
            labels: [
                worker_id.to_string(),
                class.to_string(),
                context.hostname.clone(),
                context.container_id.clone(),
                context.deployment_env.clone(),
                context.region.clone(),
            ],
        }
    }

    fn label_refs(&self) -> [&str; 6] {
        [
            &self.labels[0],
            &self.labels[1],
            &self.labels[2],
            &self.labels[3],
            &self.labels[4],
            &self.labels[5],
        ]
    }

    pub fn record_state(&self, state: WorkerState) {
        if let Some(gauge) = WORKER_STATE.get() {
            gauge
                .with_label_values(&self.label_refs())
                .set(state.as_gauge() as f64);
        }
    }

    pub fn record_uptime(&self, seconds: f64) {
        if let Some(gauge) = WORKER_UPTIME_SECONDS.get() {
            gauge.with_label_values(&self.label_refs()).set(seconds);
        }
    }

    pub fn record_resources(&self, snapshot: &ResourceSnapshot) {
        if let Some(gauge) = WORKER_MEMORY_BYTES.get() {
            gauge
                .with_label_values(&self.label_refs())
                .set(snapshot.memory_bytes as f64);
        }
        if let Some(gauge) = WORKER_CPU_PERCENT.get() {
            gauge
                .with_label_values(&self.label_refs())
                .set(snapshot.cpu_percent as f64);
        }
    }

    pub fn inc_processed(&self) {
        if let Some(counter) = WORKER_JOBS_PROCESSED_TOTAL.get() {
            counter.with_label_values(&self.label_refs()).inc();
        }
    }

    pub fn inc_failed(&self) {
        if let Some(counter) = WORKER_JOBS_FAILED_TOTAL.get() {
            counter.with_label_values(&self.label_refs()).inc();
        }
    }

    pub fn observe_job_duration(&self, seconds: f64) {
        if let Some(histogram) = WORKER_JOB_DURATION_SECONDS.get() {
            histogram
                .with_label_values(&[&self.labels[0], &self.labels[1]])
                .observe(seconds);
        }
    }
}
