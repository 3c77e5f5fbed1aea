//! Recording backend for tests.
//!
//! Tracks per-class replica counts in memory and records every scale
//! call so scenario tests can assert on the sequence of actions. Can
//! be scripted to fail, mirroring how the store fake injects errors.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::backend::{check_target, BackendHealth, ScaleError, ScalingBackend};

/// One recorded scale call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleCall {
    pub class: String,
    pub target: u32,
}

/// In-memory [`ScalingBackend`] for tests.
#[derive(Default)]
pub struct MockBackend {
    replicas: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<ScaleCall>>,
    failures: Mutex<VecDeque<ScaleError>>,
    scale_failures: Mutex<VecDeque<ScaleError>>,
    degraded: Mutex<bool>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presets the replica count for a class.
    pub fn set_replicas(&self, class: &str, count: u32) {
        self.replicas
            .lock()
            .unwrap()
            .insert(class.to_string(), count);
    }

    /// Scripts the next backend call (of any kind) to fail.
    pub fn inject_failure(&self, err: ScaleError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Scripts the next `scale` call to fail while `list` keeps
    /// working.
    pub fn inject_scale_failure(&self, err: ScaleError) {
        self.scale_failures.lock().unwrap().push_back(err);
    }

    pub fn set_degraded(&self, degraded: bool) {
        *self.degraded.lock().unwrap() = degraded;
    }

    /// All scale calls made so far.
    pub fn calls(&self) -> Vec<ScaleCall> {
        self.calls.lock().unwrap().clone()
    }

    fn take_fault(&self) -> Result<(), ScaleError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ScalingBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list(&self, class: &str) -> Result<u32, ScaleError> {
        self.take_fault()?;
        Ok(*self.replicas.lock().unwrap().get(class).unwrap_or(&0))
    }

    async fn scale(&self, class: &str, target: u32) -> Result<u32, ScaleError> {
        self.take_fault()?;
        if let Some(err) = self.scale_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        check_target(self.name(), class, target)?;
        self.calls.lock().unwrap().push(ScaleCall {
            class: class.to_string(),
            target,
        });
        self.replicas
            .lock()
            .unwrap()
            .insert(class.to_string(), target);
        Ok(target)
    }

    async fn health(&self) -> BackendHealth {
        if *self.degraded.lock().unwrap() {
            BackendHealth::Degraded
        } else {
            BackendHealth::Ok
        }
    }
}
