//! Build/run execution paths: synchronous and asynchronous modes, the
//! state machine around them, file staging and result retrieval.

mod common;

use std::time::Duration;

use common::{demo_definition, demo_request, Fixture, Outcome};
use runforge::formats::ParamValue;
use runforge::params::FileState;
use runforge::session::ExecuteOutcome;
use runforge::{Command, ExecuteMode, ParameterGroup, SessionError, State};

async fn created_session(fixture: &Fixture, overrides: serde_json::Value) -> uuid::Uuid {
    fixture.write_system("demo", "1.0", &demo_definition(true));
    fixture
        .store
        .create_session(demo_request(overrides), &fixture.source)
        .await
        .expect("session created")
}

/// Polls the persisted state until it leaves the busy states.
async fn await_settled(fixture: &Fixture, id: uuid::Uuid) -> State {
    for _ in 0..100 {
        let state = fixture
            .store
            .open_read_only(id)
            .await
            .expect("loads")
            .state;
        if !state.is_busy() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session never settled");
}

#[tokio::test]
async fn run_before_build_is_a_precondition_failure() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    let result = fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await;
    assert!(matches!(result, Err(SessionError::UnexpectedState(_))));
}

#[tokio::test]
async fn sync_build_then_run_reaches_ran() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;

    let outcome = fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, Some(30))
        .await
        .expect("build succeeds");
    match outcome {
        ExecuteOutcome::Completed(output) => assert_eq!(output, "build done\n"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let session = fixture.store.open_read_only(id).await.expect("loads");
    assert_eq!(session.state, State::Built);
    assert!(session.log.last().expect("log entry").message.contains("build done"));
    assert_eq!(*fixture.state.last_timeout.lock().expect("timeout"), Some(30));

    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");
    let session = fixture.store.open_read_only(id).await.expect("loads");
    assert_eq!(session.state, State::Ran);

    // the rendered configuration travels with every command
    assert!(fixture
        .state
        .transferred()
        .contains(&"/runforge/inputs/config.json".to_string()));
}

#[tokio::test]
async fn run_without_build_command_starts_directly() {
    let fixture = Fixture::new();
    fixture.write_system("demo", "1.0", &demo_definition(false));
    let id = fixture
        .store
        .create_session(demo_request(serde_json::json!({})), &fixture.source)
        .await
        .expect("session created");

    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");
    assert_eq!(
        fixture.store.open_read_only(id).await.expect("loads").state,
        State::Ran
    );
}

#[tokio::test]
async fn failed_run_is_a_terminal_state_with_the_output_logged() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");

    fixture.state.set_run(Outcome::Fail("segfault at step 3".to_string()));
    let result = fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await;
    assert!(matches!(result, Err(SessionError::UnexpectedState(_))));

    let session = fixture.store.open_read_only(id).await.expect("loads");
    assert_eq!(session.state, State::FailedRun);
    assert!(session
        .log
        .last()
        .expect("log entry")
        .message
        .contains("segfault at step 3"));

    // a fresh run may be triggered from the failure state
    fixture.state.set_run(Outcome::Succeed("ok\n".to_string()));
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("retry succeeds");
    assert_eq!(
        fixture.store.open_read_only(id).await.expect("loads").state,
        State::Ran
    );
}

#[tokio::test]
async fn backend_unavailability_does_not_advance_the_state() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");

    fixture
        .state
        .set_run(Outcome::Unavailable("daemon is down".to_string()));
    let result = fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await;
    assert!(matches!(
        result,
        Err(SessionError::Compute(
            runforge::ComputeError::Unavailable(_)
        ))
    ));
    // the attempt never reached the command; the session stays built
    assert_eq!(
        fixture.store.open_read_only(id).await.expect("loads").state,
        State::Built
    );
}

#[tokio::test]
async fn staging_failures_name_the_parameter_and_keep_the_state() {
    let fixture = Fixture::new();
    let id = created_session(
        &fixture,
        serde_json::json!({
            "run_parameters": { "stimuli": "definitely/not/there.bin" }
        }),
    )
    .await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");

    let result = fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await;
    match result {
        Err(SessionError::FileStaging { parameter, .. }) => assert_eq!(parameter, "stimuli"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        fixture.store.open_read_only(id).await.expect("loads").state,
        State::Built
    );
}

#[tokio::test]
async fn async_execution_acknowledges_and_appends_streamed_output() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture.state.set_chunks(&["hello ", "world\n"]);
    fixture.state.set_delay(Duration::from_millis(200));

    let outcome = fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Async, None)
        .await
        .expect("accepted");
    match outcome {
        ExecuteOutcome::Accepted(message) => assert!(message.contains("asynchronously")),
        other => panic!("unexpected outcome {other:?}"),
    }

    assert_eq!(await_settled(&fixture, id).await, State::Built);
    let session = fixture.store.open_read_only(id).await.expect("loads");
    let message = &session.log.last().expect("log entry").message;
    assert!(message.contains("hello world"), "log was: {message}");
}

#[tokio::test]
async fn async_failure_transitions_to_the_failure_state() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture.state.set_build(Outcome::Fail("missing Makefile".to_string()));

    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Async, None)
        .await
        .expect("accepted");
    assert_eq!(await_settled(&fixture, id).await, State::FailedBuild);
    let session = fixture.store.open_read_only(id).await.expect("loads");
    assert!(session
        .log
        .last()
        .expect("log entry")
        .message
        .contains("missing Makefile"));
}

#[tokio::test]
async fn stop_reaches_the_backend_while_running() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");

    fixture.state.set_delay(Duration::from_millis(500));
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Async, None)
        .await
        .expect("accepted");

    // wait until the running state is visible to observers
    for _ in 0..50 {
        if fixture.store.open_read_only(id).await.expect("loads").state == State::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    fixture.store.stop(id).await.expect("stop forwarded");
    assert!(fixture.state.calls().contains(&"stop".to_string()));
    await_settled(&fixture, id).await;
}

#[tokio::test]
async fn mutations_are_locked_while_the_async_task_runs() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture.state.set_delay(Duration::from_millis(1500));
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Async, None)
        .await
        .expect("accepted");

    // the detached task holds the exclusive lock for its whole lifetime
    let result = fixture.store.open(id).await;
    assert!(matches!(result, Err(SessionError::Locked(_))));
    await_settled(&fixture, id).await;
}

#[tokio::test]
async fn tracing_scenario_end_to_end() {
    let fixture = Fixture::new();
    let id = created_session(
        &fixture,
        serde_json::json!({ "build_parameters": { "tracing": true } }),
    )
    .await;

    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    let (available, message) = session
        .result_availability("trace.vcd")
        .expect("evaluates");
    assert!(available);
    assert!(message.is_none());

    let path = session.get_result("trace.vcd").await.expect("fetched");
    assert!(path.ends_with("trace.vcd"));
    assert!(path.is_file());
    assert!(fixture.state.calls().contains(&"get_result".to_string()));
}

#[tokio::test]
async fn disabled_tracing_names_the_gating_parameter() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    let (available, message) = session
        .result_availability("trace.vcd")
        .expect("evaluates");
    assert!(!available);
    assert!(message.expect("reason").contains("tracing"));
    assert!(matches!(
        session.get_result("trace.vcd").await,
        Err(SessionError::ResultNotAvailable(_))
    ));
}

#[tokio::test]
async fn run_parameter_mutation_regresses_ran_to_built() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;
    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");

    let mut guard = fixture.store.open(id).await.expect("open");
    guard
        .session_mut()
        .update_parameter(ParameterGroup::Run, "steps", ParamValue::Int(10))
        .expect("update");
    guard.commit().await.expect("commit");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    assert_eq!(session.state, State::Built);
    // the successful build's log entries are untouched
    assert!(session
        .log
        .iter()
        .any(|entry| entry.producer == "container.build"));
}

#[tokio::test]
async fn file_parameter_lifecycle_through_an_execution() {
    let fixture = Fixture::new();
    let payload_dir = tempfile::tempdir().expect("payload dir");
    let payload = payload_dir.path().join("waves.bin");
    std::fs::write(&payload, b"waves").expect("payload");

    let id = created_session(
        &fixture,
        serde_json::json!({
            "run_parameters": {
                "stimuli": payload.to_string_lossy()
            }
        }),
    )
    .await;

    // pending until an execution stages it
    let session = fixture.store.open_read_only(id).await.expect("loads");
    let stimuli = session
        .system
        .parameters
        .find(ParameterGroup::Run, "stimuli")
        .expect("parameter");
    assert_eq!(stimuli.file.as_ref().expect("file data").state, FileState::Pending);

    fixture
        .store
        .execute(id, Command::Build, ExecuteMode::Sync, None)
        .await
        .expect("build succeeds");
    fixture
        .store
        .execute(id, Command::Run, ExecuteMode::Sync, None)
        .await
        .expect("run succeeds");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    let stimuli = session
        .system
        .parameters
        .find(ParameterGroup::Run, "stimuli")
        .expect("parameter");
    let file = stimuli.file.as_ref().expect("file data");
    assert_eq!(file.state, FileState::Available);
    assert_eq!(
        file.container_path.as_deref(),
        Some("/runforge/inputs/run/stimuli/waves.bin")
    );
    assert!(fixture
        .state
        .transferred()
        .contains(&"/runforge/inputs/run/stimuli/waves.bin".to_string()));

    // reset discards the staged copy and returns to the default path
    let mut guard = fixture.store.open(id).await.expect("open");
    guard
        .session_mut()
        .reset_parameter(ParameterGroup::Run, "stimuli")
        .await
        .expect("reset");
    guard.commit().await.expect("commit");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    let file = session
        .system
        .parameters
        .find(ParameterGroup::Run, "stimuli")
        .expect("parameter")
        .file
        .clone()
        .expect("file data");
    assert_eq!(file.state, FileState::Default);
    assert_eq!(file.container_path.as_deref(), Some("data/default.bin"));
}

#[tokio::test]
async fn uploads_stage_directly_and_survive_commit() {
    let fixture = Fixture::new();
    let id = created_session(&fixture, serde_json::json!({})).await;

    let mut guard = fixture.store.open(id).await.expect("open");
    guard
        .session_mut()
        .add_file(ParameterGroup::Run, "stimuli", "upload.bin", b"content")
        .await
        .expect("upload");
    guard.commit().await.expect("commit");

    let session = fixture.store.open_read_only(id).await.expect("loads");
    let file = session
        .system
        .parameters
        .find(ParameterGroup::Run, "stimuli")
        .expect("parameter")
        .file
        .clone()
        .expect("file data");
    assert_eq!(file.state, FileState::Staged);
    assert!(file.local_path.expect("local path").is_file());
}
