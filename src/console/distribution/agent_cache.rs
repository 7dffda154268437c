#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    UpToDate,
    Updating,
    OutOfDate,
}

/// The console's view of how current the agents' file caches are.
///
/// `earliest_file_time` is the modification time (ms) from which files must
/// be resent; `-1` means the caches are unknown and must be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentCacheState {
    status: CacheStatus,
    earliest_file_time: i64,
    post_update_earliest_file_time: i64,
}

impl Default for AgentCacheState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCacheState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: CacheStatus::OutOfDate,
            earliest_file_time: -1,
            post_update_earliest_file_time: -1,
        }
    }

    #[must_use]
    pub const fn status(&self) -> CacheStatus {
        self.status
    }

    #[must_use]
    pub const fn earliest_file_time(&self) -> i64 {
        self.earliest_file_time
    }

    #[must_use]
    pub const fn is_out_of_date(&self) -> bool {
        !matches!(self.status, CacheStatus::UpToDate)
    }

    /// Files modified at or after `invalid_after` must be resent. Pass `-1`
    /// to force the caches to be cleared.
    pub const fn set_out_of_date(&mut self, invalid_after: i64) {
        if self.post_update_earliest_file_time > invalid_after {
            self.post_update_earliest_file_time = invalid_after;
        }
        if self.earliest_file_time > invalid_after {
            self.earliest_file_time = invalid_after;
        }
        self.status = CacheStatus::OutOfDate;
    }

    /// A distribution covering files up to `latest_file_time` has begun.
    pub const fn update_started(&mut self, latest_file_time: i64) {
        self.post_update_earliest_file_time = latest_file_time;
        self.status = CacheStatus::Updating;
    }

    /// The distribution finished. Returns the new high-water mark time.
    ///
    /// The state only becomes up to date if nothing invalidated it while the
    /// update was running.
    pub const fn update_complete(&mut self) -> i64 {
        self.earliest_file_time = self.post_update_earliest_file_time;
        if matches!(self.status, CacheStatus::Updating) {
            self.status = CacheStatus::UpToDate;
        }
        self.post_update_earliest_file_time
    }
}
