use std::path::Path;

use regex::Regex;

use crate::error::ConfigError;

/// Directory the console keeps its own bookkeeping in; never distributed.
pub const PRIVATE_DIRECTORY_NAME: &str = ".loadfleet";
const FILE_STORE_SUFFIX: &str = "-file-store";

/// Decides which entries of the distribution directory are sent to agents.
///
/// The pattern must match a whole name. Directories are matched with a
/// trailing `/`, so `^CVS/$` excludes a directory but not a file named `CVS`.
#[derive(Debug, Clone)]
pub struct DistributionFilter {
    pattern: Regex,
}

impl DistributionFilter {
    /// # Errors
    ///
    /// Returns an error when `pattern` is not a valid regular expression.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let anchored = format!("^(?:{})$", pattern);
        let pattern = Regex::new(&anchored).map_err(|err| ConfigError::InvalidDistributionFilter {
            pattern: pattern.to_owned(),
            source: err,
        })?;
        Ok(Self { pattern })
    }

    #[must_use]
    pub fn accepts_file(&self, name: &str) -> bool {
        !self.pattern.is_match(name)
    }

    /// Agent file stores nested in the distribution directory are skipped
    /// along with the private directory.
    #[must_use]
    pub fn accepts_directory(&self, name: &str) -> bool {
        if name == PRIVATE_DIRECTORY_NAME || name.ends_with(FILE_STORE_SUFFIX) {
            return false;
        }
        !self.pattern.is_match(&format!("{}/", name))
    }

    /// Applies the file or directory rule by the entry's type.
    #[must_use]
    pub fn accepts(&self, path: &Path, is_dir: bool) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        if is_dir {
            self.accepts_directory(name)
        } else {
            self.accepts_file(name)
        }
    }
}
