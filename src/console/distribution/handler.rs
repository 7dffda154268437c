use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::communication::{CacheHighWaterMark, FileContents, Message, Sender};
use crate::error::CommunicationError;

use super::file_distribution::{DistributionFile, DistributionState, lock_state};

/// Result of sending one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionProgress {
    pub percent: u8,
    pub file_name: PathBuf,
}

/// Sends one prepared distribution a file at a time.
///
/// Dropping the handler part way through abandons the distribution; the
/// console's cache state then stays out of date.
pub struct FileDistributionHandler {
    directory: PathBuf,
    files: Vec<DistributionFile>,
    next: usize,
    clear_first: bool,
    complete: bool,
    cache_id: String,
    state: Arc<Mutex<DistributionState>>,
    control: Arc<dyn Sender>,
}

impl FileDistributionHandler {
    pub(super) fn new(
        directory: PathBuf,
        files: Vec<DistributionFile>,
        clear_first: bool,
        cache_id: String,
        state: Arc<Mutex<DistributionState>>,
        control: Arc<dyn Sender>,
    ) -> Self {
        Self {
            directory,
            files,
            next: 0,
            clear_first,
            complete: false,
            cache_id,
            state,
            control,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sends the next file. Returns `None` once every file has been sent,
    /// after broadcasting the checkpoint that records the new high-water
    /// mark.
    ///
    /// # Errors
    ///
    /// Returns an error when a file cannot be read or a message cannot be
    /// sent. The failed file is skipped on the next call.
    pub async fn send_next_file(
        &mut self,
    ) -> Result<Option<DistributionProgress>, CommunicationError> {
        if self.clear_first {
            self.clear_first = false;
            info!("Clearing agent file caches");
            self.control.send(&Message::ClearCache).await?;
        }

        let index = self.next;
        let Some(file) = self.files.get(index).cloned() else {
            self.finish().await?;
            return Ok(None);
        };
        if index == 0 {
            let latest = self
                .files
                .iter()
                .map(|file| file.modified_ms)
                .max()
                .unwrap_or(0);
            lock_state(&self.state).cache.update_started(latest);
        }
        self.next = index.saturating_add(1);

        let absolute = self.directory.join(&file.path);
        let bytes = tokio::fs::read(&absolute)
            .await
            .map_err(|err| CommunicationError::DistributionFile {
                path: absolute.clone(),
                source: err,
            })?;
        let contents = FileContents::new(file.path.clone(), bytes)?;
        self.control.send(&Message::DistributeFile(contents)).await?;
        debug!("Distributed {}", file.path.display());

        Ok(Some(DistributionProgress {
            percent: percent_of(self.next, self.files.len()),
            file_name: file.path,
        }))
    }

    async fn finish(&mut self) -> Result<(), CommunicationError> {
        if self.complete {
            return Ok(());
        }
        self.complete = true;
        let time_ms = lock_state(&self.state).cache.update_complete();
        let mark = CacheHighWaterMark::new(self.cache_id.clone(), time_ms);
        info!(
            "Distribution complete ({} files), cache {} at {}",
            self.files.len(),
            mark.cache_id,
            mark.time_ms
        );
        self.control
            .send(&Message::DistributionCacheCheckpoint(mark))
            .await
    }
}

fn percent_of(done: usize, total: usize) -> u8 {
    let percent = done
        .checked_mul(100)
        .and_then(|scaled| scaled.checked_div(total))
        .unwrap_or(100)
        .min(100);
    u8::try_from(percent).unwrap_or(100)
}
