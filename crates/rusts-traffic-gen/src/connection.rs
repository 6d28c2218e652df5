//! Connection lifecycle policies.
//!
//! A [`ConnectionManager`] belongs to exactly one worker and decides when its
//! sessions are opened and closed:
//!
//! - **Persistent**: one session for the whole life of the worker
//! - **Storm**: a fresh session every tick, closed at the end of the tick
//! - **Leak**: a fresh session every tick that is never closed, not even when
//!   the worker exits

use crate::backend::{Backend, Session};
use crate::error::{BackendError, FailureClass};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A diagnostic is emitted each time the leaked count reaches a multiple of this.
pub const LEAK_WARNING_INTERVAL: usize = 100;

/// Connection policy, fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    Persistent,
    Storm,
    Leak,
}

impl ConnectionPolicy {
    /// Leak only has an effect on top of storm; without storm the
    /// single persistent session is kept and closed normally.
    pub fn from_flags(connection_storm: bool, leak_mode: bool) -> Self {
        match (connection_storm, leak_mode) {
            (false, _) => ConnectionPolicy::Persistent,
            (true, false) => ConnectionPolicy::Storm,
            (true, true) => ConnectionPolicy::Leak,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPolicy::Persistent => "persistent",
            ConnectionPolicy::Storm => "storm",
            ConnectionPolicy::Leak => "storm+leak",
        }
    }
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-worker session bookkeeping at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub opened: u64,
    pub leaked: usize,
    pub leak_diagnostics: u64,
}

/// Owns the sessions of one worker and applies the connection policy.
pub struct ConnectionManager<B: Backend> {
    backend: Arc<B>,
    policy: ConnectionPolicy,
    sensor_id: String,
    current: Option<B::Session>,
    leaked: Vec<B::Session>,
    opened: u64,
    leak_diagnostics: u64,
}

impl<B: Backend> ConnectionManager<B> {
    pub fn new(backend: Arc<B>, policy: ConnectionPolicy, sensor_id: impl Into<String>) -> Self {
        Self {
            backend,
            policy,
            sensor_id: sensor_id.into(),
            current: None,
            leaked: Vec::new(),
            opened: 0,
            leak_diagnostics: 0,
        }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    /// Sessions opened successfully so far.
    pub fn opened(&self) -> u64 {
        self.opened
    }

    /// Sessions accumulated under the leak policy.
    pub fn leaked_count(&self) -> usize {
        self.leaked.len()
    }

    /// Leak diagnostics emitted so far.
    pub fn leak_diagnostics(&self) -> u64 {
        self.leak_diagnostics
    }

    /// Sessions currently held open by this manager.
    pub fn live_handles(&self) -> usize {
        usize::from(self.current.is_some()) + self.leaked.len()
    }

    /// Returns the session to use for the current tick, opening one if the
    /// policy requires it. Failures are logged with their classification.
    pub async fn acquire(&mut self) -> Result<&B::Session, BackendError> {
        match self.policy {
            ConnectionPolicy::Persistent => {
                if self.current.is_none() {
                    let session = self.open().await?;
                    self.current = Some(session);
                }
                self.current.as_ref().ok_or(BackendError::Closed)
            }
            ConnectionPolicy::Storm => {
                // A handle left over from an interrupted tick is closed first
                self.release().await;
                let session = self.open().await?;
                self.current = Some(session);
                self.current.as_ref().ok_or(BackendError::Closed)
            }
            ConnectionPolicy::Leak => {
                let session = self.open().await?;
                self.leaked.push(session);

                let count = self.leaked.len();
                if count % LEAK_WARNING_INTERVAL == 0 {
                    self.leak_diagnostics += 1;
                    warn!(
                        "LEAK MODE: worker {} has accumulated {} connections!",
                        self.sensor_id, count
                    );
                }
                self.leaked.last().ok_or(BackendError::Closed)
            }
        }
    }

    /// End-of-tick hook: closes the tick's session under the storm policy.
    pub async fn release(&mut self) {
        if self.policy != ConnectionPolicy::Storm {
            return;
        }
        if let Some(session) = self.current.take() {
            if let Err(e) = session.close().await {
                debug!("Worker {} failed to close session: {}", self.sensor_id, e);
            }
        }
    }

    /// Worker-exit hook. Under the leak policy nothing is closed.
    pub async fn shutdown(mut self) -> ConnectionSummary {
        let summary = ConnectionSummary {
            opened: self.opened,
            leaked: self.leaked.len(),
            leak_diagnostics: self.leak_diagnostics,
        };

        match self.policy {
            ConnectionPolicy::Persistent | ConnectionPolicy::Storm => {
                if let Some(session) = self.current.take() {
                    if let Err(e) = session.close().await {
                        debug!("Worker {} failed to close session: {}", self.sensor_id, e);
                    }
                }
            }
            ConnectionPolicy::Leak => {
                info!(
                    "Worker {} exiting with {} leaked connections left open",
                    self.sensor_id,
                    self.leaked.len()
                );
                // The handles outlive the worker; only process exit reclaims them
                std::mem::forget(std::mem::take(&mut self.leaked));
            }
        }

        summary
    }

    async fn open(&mut self) -> Result<B::Session, BackendError> {
        match self.backend.connect().await {
            Ok(session) => {
                self.opened += 1;
                Ok(session)
            }
            Err(e) => {
                log_connect_failure(&self.sensor_id, &e);
                Err(e)
            }
        }
    }
}

fn log_connect_failure(sensor_id: &str, err: &BackendError) {
    match err.classify() {
        FailureClass::ResourceExhaustion => {
            error!("TOO MANY OPEN FILES in worker {}: {}", sensor_id, err)
        }
        FailureClass::Timeout => {
            error!("Timeout in worker {} - target saturated: {}", sensor_id, err)
        }
        FailureClass::Unreachable => error!(
            "Unable to connect in worker {} - target unreachable: {}",
            sensor_id, err
        ),
        FailureClass::Other => error!("Worker {} connection error: {}", sensor_id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn manager(policy: ConnectionPolicy) -> (MemoryBackend, ConnectionManager<MemoryBackend>) {
        let backend = MemoryBackend::new();
        let manager = ConnectionManager::new(Arc::new(backend.clone()), policy, "sensor_000001");
        (backend, manager)
    }

    #[test]
    fn test_policy_from_flags() {
        assert_eq!(ConnectionPolicy::from_flags(false, false), ConnectionPolicy::Persistent);
        assert_eq!(ConnectionPolicy::from_flags(false, true), ConnectionPolicy::Persistent);
        assert_eq!(ConnectionPolicy::from_flags(true, false), ConnectionPolicy::Storm);
        assert_eq!(ConnectionPolicy::from_flags(true, true), ConnectionPolicy::Leak);
    }

    #[tokio::test]
    async fn test_persistent_opens_once() {
        let (backend, mut manager) = manager(ConnectionPolicy::Persistent);

        for _ in 0..50 {
            let id = manager.acquire().await.unwrap().id();
            assert_eq!(id, 0);
            manager.release().await;
            assert!(manager.live_handles() <= 1);
        }

        let summary = manager.shutdown().await;
        assert_eq!(summary.opened, 1);
        assert_eq!(backend.opened(), 1);
        assert_eq!(backend.closed(), 1);
    }

    #[tokio::test]
    async fn test_persistent_retries_after_failure() {
        let (backend, mut manager) = manager(ConnectionPolicy::Persistent);
        backend.fail_next_connects(2, FailureClass::Timeout);

        assert!(manager.acquire().await.is_err());
        assert!(manager.acquire().await.is_err());
        assert!(manager.acquire().await.is_ok());
        assert!(manager.acquire().await.is_ok());

        assert_eq!(manager.opened(), 1);
        assert_eq!(backend.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_storm_opens_and_closes_every_tick() {
        let (backend, mut manager) = manager(ConnectionPolicy::Storm);

        for tick in 0..20u64 {
            let id = manager.acquire().await.unwrap().id();
            assert_eq!(id, tick);
            assert_eq!(backend.live(), 1);
            manager.release().await;
            assert_eq!(backend.live(), 0);
        }

        manager.shutdown().await;
        assert_eq!(backend.opened(), 20);
        assert_eq!(backend.closed(), 20);
    }

    #[tokio::test]
    async fn test_storm_closes_unreleased_handle() {
        let (backend, mut manager) = manager(ConnectionPolicy::Storm);
        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();
        assert_eq!(backend.live(), 1);
        manager.shutdown().await;
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_leak_accumulates_and_warns_on_hundreds() {
        let (backend, mut manager) = manager(ConnectionPolicy::Leak);

        let mut previous = 0;
        let mut diagnostics_at = Vec::new();
        for _ in 0..250 {
            let before = manager.leak_diagnostics();
            manager.acquire().await.unwrap();
            manager.release().await;

            let count = manager.leaked_count();
            assert!(count > previous);
            previous = count;
            if manager.leak_diagnostics() > before {
                diagnostics_at.push(count);
            }
        }

        assert_eq!(diagnostics_at, vec![100, 200]);
        assert_eq!(backend.live(), 250);

        let summary = manager.shutdown().await;
        assert_eq!(summary.leaked, 250);
        assert_eq!(summary.leak_diagnostics, 2);
        assert_eq!(backend.closed(), 0);
    }

    #[tokio::test]
    async fn test_leak_failed_open_does_not_count() {
        let (backend, mut manager) = manager(ConnectionPolicy::Leak);
        backend.fail_next_connects(1, FailureClass::ResourceExhaustion);

        assert!(manager.acquire().await.is_err());
        assert_eq!(manager.leaked_count(), 0);
        manager.acquire().await.unwrap();
        assert_eq!(manager.leaked_count(), 1);
    }
}
