use std::path::Path;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::communication::codec::write_message;
use crate::error::AppError;
use crate::identity::{AgentIdentity, WorkerIdentitySequence};
use crate::test_support::run_async_test;

fn initialise(script: &Path, working_directory: &Path) -> InitialiseWorker {
    let agent = AgentIdentity::new("worker-test");
    InitialiseWorker {
        identity: WorkerIdentitySequence::new().next_identity(&agent),
        report_to_console: false,
        console_address: None,
        script: script.to_path_buf(),
        working_directory: working_directory.to_path_buf(),
        interpreter: "sh".to_owned(),
        report_interval_ms: 50,
    }
}

#[test]
fn script_exit_code_is_returned() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let script = dir.path().join("exit.sh");
        std::fs::write(&script, "exit 3\n")?;

        let (_agent_end, worker_end) = tokio::io::duplex(1024);
        let code = run_initialised_worker(
            initialise(&script, dir.path()),
            StreamReceiver::new(worker_end),
            &CommandScriptRunner::new("sh"),
            CancellationToken::new(),
        )
        .await?;
        if code != 3 {
            return Err(AppError::validation(format!("Unexpected exit code {}", code)));
        }
        Ok(())
    })
}

#[test]
fn stop_message_kills_the_script() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let script = dir.path().join("sleep.sh");
        std::fs::write(&script, "sleep 30\n")?;

        let (mut agent_end, worker_end) = tokio::io::duplex(1024);
        let init = initialise(&script, dir.path());
        let handle = tokio::spawn(async move {
            run_initialised_worker(
                init,
                StreamReceiver::new(worker_end),
                &CommandScriptRunner::new("sh"),
                CancellationToken::new(),
            )
            .await
        });
        write_message(&mut agent_end, &Message::Stop).await?;

        let code = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .map_err(|_err| AppError::validation("Worker did not stop"))???;
        if code != KILLED_EXIT_CODE {
            return Err(AppError::validation(format!("Unexpected exit code {}", code)));
        }
        Ok(())
    })
}

#[test]
fn cancellation_kills_the_script() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let script = dir.path().join("sleep.sh");
        std::fs::write(&script, "sleep 30\n")?;

        let (_agent_end, worker_end) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        let init = initialise(&script, dir.path());
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            run_initialised_worker(
                init,
                StreamReceiver::new(worker_end),
                &CommandScriptRunner::new("sh"),
                worker_token,
            )
            .await
        });
        token.cancel();

        let code = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .map_err(|_err| AppError::validation("Worker ignored cancellation"))???;
        if code != KILLED_EXIT_CODE {
            return Err(AppError::validation(format!("Unexpected exit code {}", code)));
        }
        Ok(())
    })
}

#[test]
fn first_message_must_initialise() -> AppResult<()> {
    run_async_test(async {
        let (mut agent_end, worker_end) = tokio::io::duplex(1024);
        write_message(&mut agent_end, &Message::Stop).await?;
        let result = run_worker(worker_end, CancellationToken::new()).await;
        if !matches!(
            result,
            Err(AppError::Engine(EngineError::UnexpectedInitialisation { kind: "stop" }))
        ) {
            return Err(AppError::validation(format!(
                "Expected unexpected initialisation, got {:?}",
                result
            )));
        }

        let (agent_end, worker_end) = tokio::io::duplex(1024);
        drop(agent_end);
        let result = run_worker(worker_end, CancellationToken::new()).await;
        if !matches!(result, Err(AppError::Engine(EngineError::MissingInitialisation))) {
            return Err(AppError::validation("Expected missing initialisation"));
        }
        Ok(())
    })
}

#[test]
fn unreadable_script_fails_to_start() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_agent_end, worker_end) = tokio::io::duplex(1024);
        let init = initialise(&dir.path().join("missing.sh"), &dir.path().join("no-such-dir"));
        let result = run_initialised_worker(
            init,
            StreamReceiver::new(worker_end),
            &CommandScriptRunner::new("sh"),
            CancellationToken::new(),
        )
        .await;
        if !matches!(result, Err(AppError::Engine(EngineError::ScriptSpawn { .. }))) {
            return Err(AppError::validation("Expected spawn failure for a missing directory"));
        }
        Ok(())
    })
}
