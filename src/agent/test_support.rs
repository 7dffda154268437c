use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult, EngineError};
use crate::identity::{AgentIdentity, WorkerIdentity, WorkerIdentitySequence};
use crate::worker::KILLED_EXIT_CODE;

use super::worker::{Worker, WorkerDestroyer, WorkerFactory};

/// Test-side view of one fake worker.
#[derive(Clone)]
pub(crate) struct FakeWorkerHandle {
    pub(crate) identity: WorkerIdentity,
    pub(crate) exit: CancellationToken,
    pub(crate) destroyer: WorkerDestroyer,
}

impl FakeWorkerHandle {
    pub(crate) fn finish(&self) {
        self.exit.cancel();
    }
}

/// Creates workers that run until told to finish or destroyed.
pub(crate) struct FakeWorkerFactory {
    agent: AgentIdentity,
    sequence: WorkerIdentitySequence,
    created: Mutex<Vec<FakeWorkerHandle>>,
    fail_at: Option<usize>,
    finish_immediately: bool,
    gate: Option<Arc<Semaphore>>,
    entered: AtomicUsize,
}

impl FakeWorkerFactory {
    pub(crate) fn new() -> Self {
        Self {
            agent: AgentIdentity::new("fake-agent"),
            sequence: WorkerIdentitySequence::new(),
            created: Mutex::new(Vec::new()),
            fail_at: None,
            finish_immediately: false,
            gate: None,
            entered: AtomicUsize::new(0),
        }
    }

    /// Each create call waits for one permit from `gate`.
    pub(crate) fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Number of create calls begun so far.
    pub(crate) fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Fails the create call with this zero-based index.
    pub(crate) fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::new()
        }
    }

    pub(crate) fn finishing_immediately() -> Self {
        Self {
            finish_immediately: true,
            ..Self::new()
        }
    }

    pub(crate) fn created(&self) -> Vec<FakeWorkerHandle> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerFactory for FakeWorkerFactory {
    async fn create(&self) -> Result<Box<dyn Worker>, EngineError> {
        let call = self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_err| EngineError::MissingWorkerStream {
                    command: "fake".to_owned(),
                })?
                .forget();
        }
        let mut created = self
            .created
            .lock()
            .map_err(|_err| EngineError::MissingWorkerStream {
                command: "fake".to_owned(),
            })?;
        if self.fail_at == Some(call) {
            return Err(EngineError::Spawn {
                command: "fake".to_owned(),
                source: std::io::Error::other("refusing to start"),
            });
        }
        let handle = FakeWorkerHandle {
            identity: self.sequence.next_identity(&self.agent),
            exit: CancellationToken::new(),
            destroyer: WorkerDestroyer::new(),
        };
        if self.finish_immediately {
            handle.finish();
        }
        created.push(handle.clone());
        Ok(Box::new(FakeWorker(handle)))
    }
}

struct FakeWorker(FakeWorkerHandle);

#[async_trait]
impl Worker for FakeWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.0.identity
    }

    fn destroyer(&self) -> WorkerDestroyer {
        self.0.destroyer.clone()
    }

    async fn wait_for(&mut self) -> Result<i32, EngineError> {
        tokio::select! {
            () = self.0.exit.cancelled() => Ok(0),
            () = self.0.destroyer.destroyed() => Ok(KILLED_EXIT_CODE),
        }
    }
}

/// Polls `condition` until it holds or five seconds pass.
pub(crate) async fn eventually<F>(what: &str, mut condition: F) -> AppResult<()>
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(AppError::validation(format!("Timed out waiting for {}", what)))
}
