use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::communication::{
    AgentProcessReport, CacheHighWaterMark, HandlerOutcome, Message, MessageHandler,
    ProcessState, WorkerProcessReport,
};
use crate::error::CommunicationError;
use crate::identity::{AgentIdentity, WorkerIdentity};

const SUBSCRIBER_CAPACITY: usize = 16;

/// Latest reports for one agent and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReports {
    pub agent: AgentProcessReport,
    pub workers: Vec<WorkerProcessReport>,
}

impl ProcessReports {
    fn lowest_worker_state(&self) -> Option<ProcessState> {
        self.workers.iter().map(|worker| worker.state).min()
    }
}

/// What subscribers receive after an update sweep that saw changes.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub reports: Arc<[ProcessReports]>,
    pub agent_count_changed: bool,
}

struct Tracked<T> {
    report: T,
    fresh: bool,
}

impl<T> Tracked<T> {
    const fn new(report: T) -> Self {
        Self {
            report,
            fresh: true,
        }
    }

    /// Clears the freshness flag, returning whether the entry survives.
    const fn survives_flush(&mut self) -> bool {
        let fresh = self.fresh;
        self.fresh = false;
        fresh
    }
}

struct AgentEntry {
    agent: Tracked<AgentProcessReport>,
    workers: HashMap<WorkerIdentity, Tracked<WorkerProcessReport>>,
}

#[derive(Default)]
struct StatusTable {
    agents: HashMap<AgentIdentity, AgentEntry>,
    changed: bool,
    agent_count_changed: bool,
}

impl StatusTable {
    fn entry(&mut self, identity: &AgentIdentity) -> &mut AgentEntry {
        if !self.agents.contains_key(identity) {
            self.agent_count_changed = true;
        }
        self.agents
            .entry(identity.clone())
            .or_insert_with(|| AgentEntry {
                agent: Tracked::new(AgentProcessReport {
                    identity: identity.clone(),
                    state: ProcessState::Unknown,
                    cache_high_water_mark: None,
                }),
                workers: HashMap::new(),
            })
    }

    fn snapshot(&self) -> Vec<ProcessReports> {
        let mut reports: Vec<ProcessReports> = self
            .agents
            .values()
            .map(|entry| {
                let mut workers: Vec<WorkerProcessReport> = entry
                    .workers
                    .values()
                    .map(|worker| worker.report.clone())
                    .collect();
                workers.sort_by(|left, right| {
                    left.state
                        .cmp(&right.state)
                        .then_with(|| left.identity.number().cmp(&right.identity.number()))
                });
                ProcessReports {
                    agent: entry.agent.report.clone(),
                    workers,
                }
            })
            .collect();
        reports.sort_by(|left, right| {
            left.agent
                .state
                .cmp(&right.agent.state)
                .then_with(|| left.lowest_worker_state().cmp(&right.lowest_worker_state()))
                .then_with(|| left.agent.identity.name().cmp(right.agent.identity.name()))
        });
        reports
    }
}

/// Console-side table of the latest agent and worker reports.
///
/// Reports arrive through [`MessageHandler::handle`]. The update sweep sends
/// a snapshot to subscribers when anything changed since the previous sweep.
/// The flush sweep drops agents and workers that have not reported since the
/// previous flush.
#[derive(Default)]
pub struct ProcessStatus {
    table: Mutex<StatusTable>,
    subscribers: Mutex<Vec<mpsc::Sender<StatusUpdate>>>,
}

impl ProcessStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent_report(&self, report: AgentProcessReport) {
        let mut table = self.lock_table();
        let identity = report.identity.clone();
        table.entry(&identity).agent = Tracked::new(report);
        table.changed = true;
    }

    /// Records a worker report. A worker of an agent not yet heard from
    /// creates that agent with an [`ProcessState::Unknown`] report.
    pub fn add_worker_report(&self, report: WorkerProcessReport) {
        let mut table = self.lock_table();
        let identity = report.identity.clone();
        table
            .entry(identity.agent())
            .workers
            .insert(identity, Tracked::new(report));
        table.changed = true;
    }

    /// Update sweep. Returns whether subscribers were notified.
    pub fn update(&self) -> bool {
        let update = {
            let mut table = self.lock_table();
            if !table.changed {
                return false;
            }
            table.changed = false;
            let agent_count_changed = table.agent_count_changed;
            table.agent_count_changed = false;
            StatusUpdate {
                reports: table.snapshot().into(),
                agent_count_changed,
            }
        };
        self.notify(&update);
        true
    }

    /// Flush sweep. Entries that reported since the previous flush are kept
    /// and marked stale; stale entries are removed.
    pub fn flush(&self) {
        let mut table = self.lock_table();
        let before = table.agents.len();
        let mut removed_workers = false;
        table.agents.retain(|_, entry| {
            let workers_before = entry.workers.len();
            entry.workers.retain(|_, worker| worker.survives_flush());
            if entry.workers.len() != workers_before {
                removed_workers = true;
            }
            entry.agent.survives_flush()
        });
        let agents_removed = table.agents.len() != before;
        if agents_removed {
            table.agent_count_changed = true;
        }
        if agents_removed || removed_workers {
            table.changed = true;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ProcessReports> {
        self.lock_table().snapshot()
    }

    #[must_use]
    pub fn number_of_live_agents(&self) -> usize {
        self.lock_table().agents.len()
    }

    /// Cache marks reported by agents that have reported for themselves.
    #[must_use]
    pub fn agent_cache_marks(&self) -> Vec<Option<CacheHighWaterMark>> {
        self.lock_table()
            .agents
            .values()
            .filter(|entry| entry.agent.report.state != ProcessState::Unknown)
            .map(|entry| entry.agent.report.cache_high_water_mark.clone())
            .collect()
    }

    /// Receives a snapshot after every update sweep that saw changes. A
    /// subscriber that falls behind misses snapshots instead of blocking the
    /// sweep.
    pub fn subscribe(&self) -> mpsc::Receiver<StatusUpdate> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.lock_subscribers().push(sender);
        receiver
    }

    /// Runs both sweeps until `token` is cancelled.
    #[must_use]
    pub fn spawn_sweeps(
        self: &Arc<Self>,
        update_interval: Duration,
        flush_interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let status = Arc::clone(self);
        tokio::spawn(async move {
            let mut update = sweep_interval(update_interval);
            let mut flush = sweep_interval(flush_interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = update.tick() => {
                        status.update();
                    }
                    _ = flush.tick() => status.flush(),
                }
            }
            debug!("Process status sweeps stopped");
        })
    }

    fn notify(&self, update: &StatusUpdate) {
        self.lock_subscribers()
            .retain(|subscriber| match subscriber.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Process status subscriber is behind, skipping a snapshot");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    fn lock_table(&self) -> MutexGuard<'_, StatusTable> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<mpsc::Sender<StatusUpdate>>> {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn sweep_interval(period: Duration) -> tokio::time::Interval {
    let first_tick = Instant::now()
        .checked_add(period)
        .unwrap_or_else(Instant::now);
    let mut interval = tokio::time::interval_at(first_tick, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[async_trait]
impl MessageHandler for ProcessStatus {
    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, CommunicationError> {
        match message {
            Message::AgentProcessReport(report) => self.add_agent_report(report.clone()),
            Message::WorkerProcessReport(report) => self.add_worker_report(report.clone()),
            Message::Start(_)
            | Message::Stop
            | Message::Reset
            | Message::ClearCache
            | Message::DistributeFile(_)
            | Message::DistributionCacheCheckpoint(_)
            | Message::InitialiseWorker(_) => return Ok(HandlerOutcome::NotHandled),
        }
        Ok(HandlerOutcome::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};
    use crate::identity::WorkerIdentitySequence;

    fn agent_report(identity: &AgentIdentity, state: ProcessState) -> AgentProcessReport {
        AgentProcessReport {
            identity: identity.clone(),
            state,
            cache_high_water_mark: None,
        }
    }

    fn worker_report(identity: WorkerIdentity, state: ProcessState) -> WorkerProcessReport {
        WorkerProcessReport {
            identity,
            state,
            exit_code: None,
        }
    }

    #[test]
    fn silent_agent_survives_one_flush_only() -> AppResult<()> {
        let status = ProcessStatus::new();
        let agent = AgentIdentity::new("agent");
        status.add_agent_report(agent_report(&agent, ProcessState::Running));
        if !status.update() {
            return Err(AppError::validation("Expected the first sweep to notify"));
        }

        status.flush();
        if status.number_of_live_agents() != 1 {
            return Err(AppError::validation("Expected the agent present after flush 1"));
        }
        status.flush();
        if status.number_of_live_agents() != 0 {
            return Err(AppError::validation("Expected the agent gone after flush 2"));
        }
        Ok(())
    }

    #[test]
    fn reporting_agents_are_kept_and_their_silent_workers_flushed() -> AppResult<()> {
        let status = ProcessStatus::new();
        let agent = AgentIdentity::new("agent");
        let sequence = WorkerIdentitySequence::new();
        status.add_agent_report(agent_report(&agent, ProcessState::Running));
        status.add_worker_report(worker_report(
            sequence.next_identity(&agent),
            ProcessState::Running,
        ));

        for _ in 0..3 {
            status.flush();
            status.add_agent_report(agent_report(&agent, ProcessState::Running));
        }
        let snapshot = status.snapshot();
        let Some(reports) = snapshot.first() else {
            return Err(AppError::validation("Expected the reporting agent kept"));
        };
        if !reports.workers.is_empty() {
            return Err(AppError::validation("Expected the silent worker flushed"));
        }
        Ok(())
    }

    #[test]
    fn quiet_sweeps_notify_nobody() -> AppResult<()> {
        let status = ProcessStatus::new();
        let mut updates = status.subscribe();
        if status.update() {
            return Err(AppError::validation("Expected no notification without reports"));
        }

        let agent = AgentIdentity::new("agent");
        status.add_agent_report(agent_report(&agent, ProcessState::Started));
        if !status.update() {
            return Err(AppError::validation("Expected a notification after a report"));
        }
        if status.update() {
            return Err(AppError::validation("Expected the repeat sweep to stay quiet"));
        }

        let first = updates
            .try_recv()
            .map_err(|err| AppError::validation(format!("Expected an update: {}", err)))?;
        if !first.agent_count_changed || first.reports.len() != 1 {
            return Err(AppError::validation("Expected the new agent announced"));
        }
        if updates.try_recv().is_ok() {
            return Err(AppError::validation("Expected exactly one update"));
        }
        Ok(())
    }

    #[test]
    fn worker_of_unknown_agent_creates_a_placeholder() -> AppResult<()> {
        let status = ProcessStatus::new();
        let agent = AgentIdentity::new("agent");
        let sequence = WorkerIdentitySequence::new();
        status.add_worker_report(worker_report(
            sequence.next_identity(&agent),
            ProcessState::Started,
        ));

        let snapshot = status.snapshot();
        let Some(reports) = snapshot.first() else {
            return Err(AppError::validation("Expected a placeholder agent"));
        };
        if reports.agent.state != ProcessState::Unknown || reports.workers.len() != 1 {
            return Err(AppError::validation(format!("Unexpected reports {:?}", reports)));
        }
        if !status.agent_cache_marks().is_empty() {
            return Err(AppError::validation("Placeholder agents have no cache"));
        }
        Ok(())
    }

    #[test]
    fn snapshot_orders_by_agent_state_then_name() -> AppResult<()> {
        let status = ProcessStatus::new();
        let finished = AgentIdentity::new("alpha");
        let running_b = AgentIdentity::new("bravo");
        let running_a = AgentIdentity::new("able");
        status.add_agent_report(agent_report(&finished, ProcessState::Finished));
        status.add_agent_report(agent_report(&running_b, ProcessState::Running));
        status.add_agent_report(agent_report(&running_a, ProcessState::Running));

        let names: Vec<String> = status
            .snapshot()
            .iter()
            .map(|reports| reports.agent.identity.name().to_owned())
            .collect();
        if names != ["able", "bravo", "alpha"] {
            return Err(AppError::validation(format!("Unexpected order {:?}", names)));
        }
        Ok(())
    }

    #[test]
    fn closed_subscribers_are_dropped() -> AppResult<()> {
        let status = ProcessStatus::new();
        drop(status.subscribe());
        let mut live = status.subscribe();
        status.add_agent_report(agent_report(&AgentIdentity::new("agent"), ProcessState::Running));
        status.update();
        if status.lock_subscribers().len() != 1 {
            return Err(AppError::validation("Expected the closed subscriber removed"));
        }
        if live.try_recv().is_err() {
            return Err(AppError::validation("Expected the live subscriber notified"));
        }
        Ok(())
    }
}
