use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};

use crate::error::CommunicationError;
use crate::identity::{AgentIdentity, WorkerIdentity};

/// A unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Start(StartMessage),
    Stop,
    Reset,
    ClearCache,
    DistributeFile(FileContents),
    DistributionCacheCheckpoint(CacheHighWaterMark),
    AgentProcessReport(AgentProcessReport),
    WorkerProcessReport(WorkerProcessReport),
    InitialiseWorker(InitialiseWorker),
}

/// Tag for each [`Message`] variant, used to key handler registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Start,
    Stop,
    Reset,
    ClearCache,
    DistributeFile,
    DistributionCacheCheckpoint,
    AgentProcessReport,
    WorkerProcessReport,
    InitialiseWorker,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Start => "start",
            MessageKind::Stop => "stop",
            MessageKind::Reset => "reset",
            MessageKind::ClearCache => "clear_cache",
            MessageKind::DistributeFile => "distribute_file",
            MessageKind::DistributionCacheCheckpoint => "distribution_cache_checkpoint",
            MessageKind::AgentProcessReport => "agent_process_report",
            MessageKind::WorkerProcessReport => "worker_process_report",
            MessageKind::InitialiseWorker => "initialise_worker",
        }
    }
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Message::Start(_) => MessageKind::Start,
            Message::Stop => MessageKind::Stop,
            Message::Reset => MessageKind::Reset,
            Message::ClearCache => MessageKind::ClearCache,
            Message::DistributeFile(_) => MessageKind::DistributeFile,
            Message::DistributionCacheCheckpoint(_) => MessageKind::DistributionCacheCheckpoint,
            Message::AgentProcessReport(_) => MessageKind::AgentProcessReport,
            Message::WorkerProcessReport(_) => MessageKind::WorkerProcessReport,
            Message::InitialiseWorker(_) => MessageKind::InitialiseWorker,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartMessage {
    /// Script relative to the agent's file store. `None` means the agent's
    /// locally configured script.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Started,
    Running,
    Finished,
    Unknown,
}

impl ProcessState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcessState::Started => "started",
            ProcessState::Running => "running",
            ProcessState::Finished => "finished",
            ProcessState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProcessReport {
    pub identity: AgentIdentity,
    pub state: ProcessState,
    #[serde(default)]
    pub cache_high_water_mark: Option<CacheHighWaterMark>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcessReport {
    pub identity: WorkerIdentity,
    pub state: ProcessState,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// First message an agent sends down a worker's communication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialiseWorker {
    pub identity: WorkerIdentity,
    pub report_to_console: bool,
    #[serde(default)]
    pub console_address: Option<String>,
    pub script: PathBuf,
    pub working_directory: PathBuf,
    pub interpreter: String,
    pub report_interval_ms: u64,
}

/// Newest distribution state a cache is known to hold.
///
/// Marks only order against marks of the same cache; `time_ms` is the
/// modification time of the newest file the cache has received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheHighWaterMark {
    pub cache_id: String,
    pub time_ms: i64,
}

impl CacheHighWaterMark {
    #[must_use]
    pub fn new(cache_id: impl Into<String>, time_ms: i64) -> Self {
        Self {
            cache_id: cache_id.into(),
            time_ms,
        }
    }

    #[must_use]
    pub fn is_for_same_cache(&self, other: &Self) -> bool {
        self.cache_id == other.cache_id
    }
}

impl PartialOrd for CacheHighWaterMark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.is_for_same_cache(other) {
            Some(self.time_ms.cmp(&other.time_ms))
        } else {
            None
        }
    }
}

/// A file to place in an agent's file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireFileContents", into = "WireFileContents")]
pub struct FileContents {
    path: PathBuf,
    contents: Vec<u8>,
}

impl FileContents {
    /// Builds file contents for a path relative to the distribution root.
    ///
    /// # Errors
    ///
    /// Returns an error when the path is absolute, empty, or climbs out of
    /// its base directory.
    pub fn new(path: impl Into<PathBuf>, contents: Vec<u8>) -> Result<Self, CommunicationError> {
        let path = path.into();
        if !is_confined_relative(&path) {
            return Err(CommunicationError::InvalidFileContentsPath { path });
        }
        Ok(Self { path, contents })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    #[must_use]
    pub fn resolve(&self, base: &Path) -> PathBuf {
        base.join(&self.path)
    }
}

fn is_confined_relative(path: &Path) -> bool {
    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal = normal.saturating_add(1),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    normal > 0
}

#[derive(Serialize, Deserialize)]
struct WireFileContents {
    path: PathBuf,
    contents_b64: String,
}

impl TryFrom<WireFileContents> for FileContents {
    type Error = CommunicationError;

    fn try_from(value: WireFileContents) -> Result<Self, Self::Error> {
        let contents = B64.decode(value.contents_b64.as_bytes()).map_err(|err| {
            CommunicationError::InvalidFileContentsEncoding {
                path: value.path.clone(),
                source: err,
            }
        })?;
        FileContents::new(value.path, contents)
    }
}

impl From<FileContents> for WireFileContents {
    fn from(value: FileContents) -> Self {
        Self {
            contents_b64: B64.encode(&value.contents),
            path: value.path,
        }
    }
}
