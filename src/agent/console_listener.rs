use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::communication::{Message, Sender, StartMessage};
use crate::error::CommunicationError;

/// Set of console signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals(u8);

impl Signals {
    pub const START: Self = Self(0b0001);
    pub const RESET: Self = Self(0b0010);
    pub const STOP: Self = Self(0b0100);
    pub const SHUTDOWN: Self = Self(0b1000);
    pub const ANY: Self = Self(0b1111);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        !self.intersection(other).is_empty()
    }
}

#[derive(Default)]
struct ListenerState {
    pending: Signals,
    last: Signals,
    last_start: Option<StartMessage>,
}

/// Records control signals from the console for the agent's control loop.
///
/// Signals accumulate until claimed with [`ConsoleListener::check_for_message`];
/// the claimed set is then available through [`ConsoleListener::received`].
pub struct ConsoleListener {
    state: Mutex<ListenerState>,
    events: Arc<Notify>,
}

impl ConsoleListener {
    #[must_use]
    pub fn new(events: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(ListenerState::default()),
            events,
        }
    }

    /// Claims the pending signals in `mask`. Returns whether any were
    /// pending.
    #[must_use]
    pub fn check_for_message(&self, mask: Signals) -> bool {
        let mut state = self.lock();
        state.last = state.pending.intersection(mask);
        state.pending = state.pending.without(mask);
        !state.last.is_empty()
    }

    /// Whether the last claim included any signal in `mask`.
    #[must_use]
    pub fn received(&self, mask: Signals) -> bool {
        self.lock().last.intersects(mask)
    }

    /// Forgets signals in `mask`, pending or claimed.
    pub fn discard_messages(&self, mask: Signals) {
        let mut state = self.lock();
        state.pending = state.pending.without(mask);
        state.last = state.last.without(mask);
    }

    /// Waits until some signal is pending and claims every pending signal.
    pub async fn wait_for_message(&self) {
        loop {
            let notified = self.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.check_for_message(Signals::ANY) {
                return;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn last_start(&self) -> Option<StartMessage> {
        self.lock().last_start.clone()
    }

    /// Records that the console link has gone away.
    pub fn signal_shutdown(&self) {
        self.record(Signals::SHUTDOWN);
    }

    fn record(&self, signal: Signals) {
        {
            let mut state = self.lock();
            state.pending = state.pending.union(signal);
        }
        self.events.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Sender for ConsoleListener {
    async fn send(&self, message: &Message) -> Result<(), CommunicationError> {
        match message {
            Message::Start(start) => {
                self.lock().last_start = Some(start.clone());
                self.record(Signals::START);
            }
            Message::Stop => self.record(Signals::STOP),
            Message::Reset => self.record(Signals::RESET),
            Message::ClearCache
            | Message::DistributeFile(_)
            | Message::DistributionCacheCheckpoint(_)
            | Message::AgentProcessReport(_)
            | Message::WorkerProcessReport(_)
            | Message::InitialiseWorker(_) => {
                debug!("Console listener ignoring {} message", message.kind().as_str());
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.signal_shutdown();
    }
}
