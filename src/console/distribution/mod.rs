//! Console side of file distribution: which files agents are missing, and
//! sending them one at a time.
mod agent_cache;
mod file_distribution;
mod filter;
mod handler;


pub use agent_cache::{AgentCacheState, CacheStatus};
pub use file_distribution::{DistributionFile, FileDistribution};
pub use filter::{DistributionFilter, PRIVATE_DIRECTORY_NAME};
pub use handler::{DistributionProgress, FileDistributionHandler};
