//! Process identities for agents and their workers.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identity of an agent process.
///
/// Equality and hashing use the opaque token only, so two identities created
/// independently with the same name never compare equal. Renaming an identity
/// keeps its token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    token: u64,
    name: String,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            token: rand::thread_rng().r#gen(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl PartialEq for AgentIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for AgentIdentity {}

impl Hash for AgentIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identity of a worker: the owning agent plus a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    agent: AgentIdentity,
    number: u64,
}

impl WorkerIdentity {
    #[must_use]
    pub const fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    #[must_use]
    pub const fn number(&self) -> u64 {
        self.number
    }

    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-{}", self.agent.name(), self.number)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.agent.name(), self.number)
    }
}

/// Hands out worker numbers for one agent process. Numbers are never reused,
/// including across control cycles.
#[derive(Debug, Default)]
pub struct WorkerIdentitySequence {
    next: AtomicU64,
}

impl WorkerIdentitySequence {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_identity(&self, agent: &AgentIdentity) -> WorkerIdentity {
        WorkerIdentity {
            agent: agent.clone(),
            number: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Best-effort host name used as the default agent name.
#[must_use]
pub fn local_host_name() -> String {
    let mut buffer = [0u8; 256];
    // SAFETY: `buffer` is a valid writable region of `buffer.len()` bytes and
    // gethostname writes at most that many bytes into it.
    let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
    if result != 0 {
        return "localhost".to_owned();
    }
    let end = buffer
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(buffer.len());
    buffer
        .get(..end)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    #[test]
    fn identities_with_same_name_are_distinct() -> AppResult<()> {
        let first = AgentIdentity::new("host");
        let second = AgentIdentity::new("host");
        if first == second {
            return Err(AppError::validation("Expected distinct identities"));
        }
        if first != first.clone() {
            return Err(AppError::validation("Expected clone to compare equal"));
        }
        Ok(())
    }

    #[test]
    fn renaming_keeps_equality() -> AppResult<()> {
        let original = AgentIdentity::new("before");
        let mut renamed = original.clone();
        renamed.set_name("after");
        if original != renamed {
            return Err(AppError::validation("Expected renamed identity to be equal"));
        }
        if renamed.name() != "after" {
            return Err(AppError::validation("Expected new name"));
        }
        Ok(())
    }

    #[test]
    fn worker_numbers_increase() -> AppResult<()> {
        let agent = AgentIdentity::new("agent");
        let sequence = WorkerIdentitySequence::new();
        let first = sequence.next_identity(&agent);
        let second = sequence.next_identity(&agent);
        if first.number() != 0 || second.number() != 1 {
            return Err(AppError::validation(format!(
                "Unexpected worker numbers {} and {}",
                first.number(),
                second.number()
            )));
        }
        if second.name() != "agent-1" {
            return Err(AppError::validation(format!(
                "Unexpected worker name {}",
                second.name()
            )));
        }
        if first.agent() != &agent {
            return Err(AppError::validation("Worker should belong to agent"));
        }
        Ok(())
    }
}
