//! Status, resume and cleanup behavior.

use quorum::{Error, Phase, Role, TaskId};
use tempfile::TempDir;

use crate::fixtures::{workflow_agent, write_script, Harness};

fn task(id: &str) -> TaskId {
    TaskId::new(id).unwrap()
}

fn happy_agent(dir: &std::path::Path, task_id: &str) -> std::path::PathBuf {
    workflow_agent(
        dir,
        task_id,
        &["A", "A", "B"],
        &["APPROVE", "APPROVE", "APPROVE"],
        None,
    )
}

#[tokio::test]
async fn test_status_for_unknown_task_is_not_found() {
    let script_dir = TempDir::new().unwrap();
    let agent = happy_agent(script_dir.path(), "t1");
    let harness = Harness::new(&agent, 5);

    let err = harness.orchestrator.status(&task("ghost")).unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let script_dir = TempDir::new().unwrap();
    let agent = happy_agent(script_dir.path(), "t1");
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap();
    let err = harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_cleanup_removes_task_resources_but_keeps_logs() {
    let script_dir = TempDir::new().unwrap();
    let agent = happy_agent(script_dir.path(), "t1");
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap();
    let logs_before = std::fs::read_dir(harness.logs_dir()).unwrap().count();
    assert!(logs_before > 0);

    harness.orchestrator.cleanup(&task("t1")).unwrap();

    // State, sessions and worktrees are gone.
    assert!(matches!(
        harness.orchestrator.status(&task("t1")),
        Err(Error::TaskNotFound(_))
    ));
    assert!(!harness.workspaces_dir().join("t1").exists());
    assert!(harness.orchestrator.list_tasks().unwrap().is_empty());

    // Raw logs survive cleanup.
    let logs_after = std::fs::read_dir(harness.logs_dir()).unwrap().count();
    assert_eq!(logs_before, logs_after);
}

#[tokio::test]
async fn test_cleanup_of_one_task_leaves_others_runnable() {
    let script_dir = TempDir::new().unwrap();
    // This agent derives the task id from its worktree path, so one
    // script serves every task on the orchestrator.
    let agent = write_script(
        script_dir.path(),
        "agent.sh",
        r#"base=$(basename "$PWD")
tid=$(basename "$(dirname "$PWD")")
echo '{"type":"system","subtype":"init","session_id":"sess-'$base'"}'
case "$base" in
  writer-*)
    echo "work by $base" > impl.txt
    ;;
  judge-*)
    mkdir -p .quorum
    n=0
    [ -f .cycle ] && n=$(cat .cycle)
    n=$((n+1))
    echo $n > .cycle
    if [ "$n" -eq 1 ]; then
      printf '{"judge":%s,"task_id":"%s","decision":"A","rationale":"panel"}' "${base#judge-}" "$tid" > .quorum/vote.json
    else
      printf '{"judge":%s,"task_id":"%s","decision":"APPROVE","rationale":"review"}' "${base#judge-}" "$tid" > .quorum/vote.json
    fi
    ;;
esac
echo '{"type":"result","subtype":"success","duration_ms":5}'"#,
    );
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap();
    harness.orchestrator.cleanup(&task("t1")).unwrap();

    // Cancelling t1 must not have touched the orchestrator itself.
    let state = harness
        .orchestrator
        .start(&task("t2"), "build it too", None)
        .await
        .expect("second task should run after the first was cleaned up");
    assert_eq!(state.phase, Phase::Complete);
}

#[tokio::test]
async fn test_resume_unknown_task_fails_fast() {
    let script_dir = TempDir::new().unwrap();
    let agent = happy_agent(script_dir.path(), "t1");
    let harness = Harness::new(&agent, 5);

    let err = harness
        .orchestrator
        .resume(&task("ghost"), Role::WriterA, "more feedback", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
}

#[tokio::test]
async fn test_resume_without_stored_session_fails_fast() {
    let script_dir = TempDir::new().unwrap();
    let agent = happy_agent(script_dir.path(), "t1");
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap();

    // judge-9 never ran, so it has no session handle.
    let err = harness
        .orchestrator
        .resume(&task("t1"), Role::Judge(9), "look again", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSessionToResume { .. }));
}

#[tokio::test]
async fn test_resume_clears_error_flag_after_success() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t1",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        Some("writer-b"),
    );
    let harness = Harness::new(&agent, 5);

    // writer-b fails, blocking the task in Writers with an error.
    harness
        .orchestrator
        .start(&task("t1"), "build it", None)
        .await
        .unwrap_err();
    let report = harness.orchestrator.status(&task("t1")).unwrap();
    assert!(report.error.is_some());

    // Resuming writer-a (whose session exists and whose run succeeds)
    // is the external decision that re-arms the task.
    harness
        .orchestrator
        .resume(&task("t1"), Role::WriterA, "carry on", None)
        .await
        .unwrap();
    let report = harness.orchestrator.status(&task("t1")).unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.phase, Phase::Writers);
}
