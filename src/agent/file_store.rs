use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::communication::{
    CacheHighWaterMark, FileContents, HandlerOutcome, Message, MessageHandler,
};
use crate::error::CommunicationError;

const PARTIAL_SUFFIX: &str = "partial";

/// Agent-side copy of the console's distribution directory.
///
/// Handles cache messages and passes everything else along.
pub struct FileStore {
    directory: PathBuf,
    high_water_mark: Mutex<Option<CacheHighWaterMark>>,
}

impl FileStore {
    /// Creates the store directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or resolved.
    pub fn create(directory: &Path) -> Result<Self, CommunicationError> {
        std::fs::create_dir_all(directory).map_err(|err| CommunicationError::FileStore {
            action: "create",
            path: directory.to_path_buf(),
            source: err,
        })?;
        let directory = directory
            .canonicalize()
            .map_err(|err| CommunicationError::FileStore {
                action: "resolve",
                path: directory.to_path_buf(),
                source: err,
            })?;
        info!("File store at {}", directory.display());
        Ok(Self {
            directory,
            high_water_mark: Mutex::new(None),
        })
    }

    /// Canonical path of the store directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn cache_high_water_mark(&self) -> Option<CacheHighWaterMark> {
        match self.high_water_mark.lock() {
            Ok(mark) => mark.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn clear(&self) -> Result<(), CommunicationError> {
        info!("Clearing file store");
        self.set_mark(None);
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|err| store_error("list", &self.directory, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| store_error("list", &self.directory, err))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| store_error("inspect", &path, err))?;
            let removed = if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            removed.map_err(|err| store_error("delete", &path, err))?;
        }
        Ok(())
    }

    async fn write(&self, contents: &FileContents) -> Result<(), CommunicationError> {
        let path = contents.resolve(&self.directory);
        info!("Updating file store: {}", contents.path().display());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| store_error("create", parent, err))?;
        }
        let partial = partial_path(&path);
        if let Err(err) = tokio::fs::write(&partial, contents.contents()).await {
            discard_partial(&partial).await;
            return Err(store_error("write", &partial, err));
        }
        if let Err(err) = tokio::fs::rename(&partial, &path).await {
            discard_partial(&partial).await;
            return Err(store_error("replace", &path, err));
        }
        Ok(())
    }

    fn checkpoint(&self, mark: &CacheHighWaterMark) {
        let mut current = match self.high_water_mark.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        match current.as_ref() {
            None => *current = Some(mark.clone()),
            Some(existing) if existing.is_for_same_cache(mark) => {
                if mark.time_ms > existing.time_ms {
                    *current = Some(mark.clone());
                }
            }
            Some(existing) => warn!(
                "Ignoring checkpoint for cache {}; store holds cache {}",
                mark.cache_id, existing.cache_id
            ),
        }
    }

    fn set_mark(&self, mark: Option<CacheHighWaterMark>) {
        match self.high_water_mark.lock() {
            Ok(mut current) => *current = mark,
            Err(poisoned) => *poisoned.into_inner() = mark,
        }
    }
}

/// Hidden sibling of `path` that a new version is written to before it
/// replaces `path`.
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, PARTIAL_SUFFIX))
}

async fn discard_partial(partial: &Path) {
    if let Err(err) = tokio::fs::remove_file(partial).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Could not remove {}: {}", partial.display(), err);
    }
}

fn store_error(action: &'static str, path: &Path, source: std::io::Error) -> CommunicationError {
    error!("File store could not {} {}: {}", action, path.display(), source);
    CommunicationError::FileStore {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl MessageHandler for FileStore {
    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, CommunicationError> {
        match message {
            Message::ClearCache => self.clear().await?,
            Message::DistributeFile(contents) => self.write(contents).await?,
            Message::DistributionCacheCheckpoint(mark) => self.checkpoint(mark),
            Message::Start(_)
            | Message::Stop
            | Message::Reset
            | Message::AgentProcessReport(_)
            | Message::WorkerProcessReport(_)
            | Message::InitialiseWorker(_) => return Ok(HandlerOutcome::NotHandled),
        }
        Ok(HandlerOutcome::Handled)
    }
}
