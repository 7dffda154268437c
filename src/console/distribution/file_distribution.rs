use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use rand::Rng;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::communication::{CacheHighWaterMark, Sender};
use crate::error::ConfigError;

use super::agent_cache::AgentCacheState;
use super::filter::{DistributionFilter, PRIVATE_DIRECTORY_NAME};
use super::handler::FileDistributionHandler;

const SCAN_TIME_FILE: &str = ".scantime";
const SCAN_CLOCK_SLACK_MS: i64 = 1000;

/// A distributable file, relative to the distribution directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionFile {
    pub path: PathBuf,
    pub modified_ms: i64,
}

pub(super) struct DistributionState {
    pub(super) cache: AgentCacheState,
    last_scan_ms: i64,
}

pub(super) fn lock_state(state: &Mutex<DistributionState>) -> MutexGuard<'_, DistributionState> {
    match state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Console side of file distribution for one directory.
///
/// Each console run distributes under a fresh cache identity, so agent
/// caches filled by an earlier console are cleared before use.
pub struct FileDistribution {
    directory: PathBuf,
    filter: DistributionFilter,
    cache_id: String,
    state: Arc<Mutex<DistributionState>>,
}

impl FileDistribution {
    /// # Errors
    ///
    /// Returns an error when the directory cannot be resolved.
    pub fn new(directory: &Path, filter: DistributionFilter) -> Result<Self, ConfigError> {
        let directory = directory
            .canonicalize()
            .map_err(|err| ConfigError::DistributionDirectory {
                path: directory.to_path_buf(),
                source: err,
            })?;
        let cache_id = format!(
            "{}-{:08x}",
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().r#gen::<u32>()
        );
        debug!("Distributing {} as cache {}", directory.display(), cache_id);
        Ok(Self {
            directory,
            filter,
            cache_id,
            state: Arc::new(Mutex::new(DistributionState {
                cache: AgentCacheState::new(),
                last_scan_ms: -1,
            })),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    #[must_use]
    pub fn agent_cache_state(&self) -> AgentCacheState {
        lock_state(&self.state).cache
    }

    /// Marks the agent caches out of date for files modified since the last
    /// scan, returning those files.
    #[must_use]
    pub fn scan_distribution_files(&self) -> Vec<DistributionFile> {
        let since = {
            let state = lock_state(&self.state);
            if state.cache.earliest_file_time() < 0 {
                -1
            } else {
                state.last_scan_ms
            }
        };
        let scan_time = self.file_system_time();
        let changed = self.list_files(since);

        let mut state = lock_state(&self.state);
        state.last_scan_ms = scan_time;
        for file in &changed {
            state.cache.set_out_of_date(file.modified_ms);
        }
        changed
    }

    /// Prepares a distribution to the agents reached by `control`.
    ///
    /// `agent_marks` are the marks live agents last reported. An agent
    /// without a mark, or with a mark from another cache, makes the whole
    /// directory go out again after a cache clear.
    #[must_use]
    pub fn handler(
        &self,
        agent_marks: &[Option<CacheHighWaterMark>],
        control: Arc<dyn Sender>,
    ) -> FileDistributionHandler {
        let changed = self.scan_distribution_files();
        debug!("{} files changed since the last scan", changed.len());
        let earliest = {
            let mut state = lock_state(&self.state);
            let earliest = self.effective_earliest(state.cache.earliest_file_time(), agent_marks);
            state.cache.update_started(earliest);
            earliest
        };
        let files = self.list_files(earliest);
        debug!(
            "Distribution from {} covers {} files",
            earliest,
            files.len()
        );
        FileDistributionHandler::new(
            self.directory.clone(),
            files,
            earliest < 0,
            self.cache_id.clone(),
            Arc::clone(&self.state),
            control,
        )
    }

    fn effective_earliest(&self, console: i64, agent_marks: &[Option<CacheHighWaterMark>]) -> i64 {
        let mut earliest = console;
        for mark in agent_marks {
            match mark {
                Some(mark) if mark.cache_id == self.cache_id => {
                    earliest = earliest.min(mark.time_ms);
                }
                Some(_) | None => return -1,
            }
        }
        earliest
    }

    /// Distributable files modified at or after `earliest_ms`, sorted by
    /// path. Unreadable entries are skipped with a warning.
    #[must_use]
    pub fn list_files(&self, earliest_ms: i64) -> Vec<DistributionFile> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.directory)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                self.filter
                    .accepts(entry.path(), entry.file_type().is_dir())
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable distribution entry: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let modified_ms = match entry.metadata() {
                Ok(metadata) => modified_ms(&metadata),
                Err(err) => {
                    warn!("Skipping {}: {}", entry.path().display(), err);
                    continue;
                }
            };
            let Some(modified_ms) = modified_ms else {
                warn!("Skipping {}: no modification time", entry.path().display());
                continue;
            };
            if modified_ms < earliest_ms {
                continue;
            }
            let Ok(path) = entry.path().strip_prefix(&self.directory) else {
                continue;
            };
            files.push(DistributionFile {
                path: path.to_path_buf(),
                modified_ms,
            });
        }
        files
    }

    /// Current time according to the file system holding the directory, so
    /// scan times compare with file times from the same clock.
    fn file_system_time(&self) -> i64 {
        let private = self.directory.join(PRIVATE_DIRECTORY_NAME);
        let marker = private.join(SCAN_TIME_FILE);
        let stamped = std::fs::create_dir_all(&private)
            .and_then(|()| std::fs::write(&marker, b""))
            .and_then(|()| std::fs::metadata(&marker));
        let time = match stamped {
            Ok(metadata) => modified_ms(&metadata),
            Err(err) => {
                debug!("Scan time marker failed: {}", err);
                None
            }
        };
        if let Err(err) = std::fs::remove_file(&marker) {
            debug!("Could not remove {}: {}", marker.display(), err);
        }
        time.unwrap_or_else(|| {
            chrono::Utc::now()
                .timestamp_millis()
                .saturating_sub(SCAN_CLOCK_SLACK_MS)
        })
    }
}

fn modified_ms(metadata: &std::fs::Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
