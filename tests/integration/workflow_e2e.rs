//! End-to-end workflow scenarios with scripted agents.

use quorum::event::EventKind;
use quorum::{Error, ChosenPath, Phase, Role, TaskId, WorkflowStatus};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::fixtures::{workflow_agent, Harness};

fn task(id: &str) -> TaskId {
    TaskId::new(id).unwrap()
}

#[tokio::test]
async fn test_happy_path_a_wins_and_completes() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-happy",
        &["A", "A", "B"],
        &["APPROVE", "APPROVE", "COMMENT"],
        None,
    );
    let harness = Harness::new(&agent, 5);
    let (tx, mut rx) = mpsc::channel(1024);

    let state = harness
        .orchestrator
        .start(&task("t-happy"), "implement the widget", Some(tx))
        .await
        .expect("workflow should complete");

    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.status, WorkflowStatus::Complete);
    assert_eq!(state.winner, Some(Role::WriterA));
    assert_eq!(state.path, ChosenPath::A);
    assert!(state.error.is_none());
    // Writers -> Panel -> Synthesis -> PeerReview -> Complete, no loop.
    assert_eq!(state.phase_history().len(), 5);

    // Every role streamed an init frame before anything else.
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(!events.is_empty());
    for role in [Role::WriterA, Role::WriterB] {
        let first = events.iter().find(|e| e.role == role).unwrap();
        assert!(matches!(first.kind, EventKind::Init { .. }));
    }

    // Status projection reflects the finished task.
    let report = harness.orchestrator.status(&task("t-happy")).unwrap();
    assert_eq!(report.phase, Phase::Complete);
    assert_eq!(report.branches.len(), 5); // 2 writers + 3 judges
    assert!(report
        .branches
        .contains(&"quorum/t-happy/writer-a".to_string()));
    assert_eq!(report.sessions.len(), 5);

    // Raw logs: 2 writer runs + 1 synthesis + 3 judges x 2 cycles.
    let logs = std::fs::read_dir(harness.logs_dir()).unwrap().count();
    assert_eq!(logs, 9);
}

#[tokio::test]
async fn test_writer_failure_blocks_panel() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-fail",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        Some("writer-a"),
    );
    let harness = Harness::new(&agent, 5);

    let err = harness
        .orchestrator
        .start(&task("t-fail"), "implement the widget", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WriterFailed { .. }));

    // Task stays in the Writers phase with the error recorded, and the
    // panel never ran.
    let report = harness.orchestrator.status(&task("t-fail")).unwrap();
    assert_eq!(report.phase, Phase::Writers);
    assert_eq!(report.status, WorkflowStatus::Active);
    assert!(report.error.is_some());
    assert!(!report
        .branches
        .iter()
        .any(|b| b.contains("judge")));

    // The failed writer's session was still captured for resume.
    assert!(report.sessions.iter().any(|s| s.role == "writer-a"));
}

#[tokio::test]
async fn test_repeated_rejections_escalate_after_cap_exceeded() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-esc",
        &["B", "B", "A"],
        &["REQUEST_CHANGES", "APPROVE", "APPROVE"],
        None,
    );
    // Cap of 2: the loop runs cycles 1 and 2, and the third rejection
    // escalates.
    let harness = Harness::new(&agent, 2);

    let err = harness
        .orchestrator
        .start(&task("t-esc"), "implement the widget", None)
        .await
        .unwrap_err();
    match err {
        Error::Escalated { cycles, .. } => assert_eq!(cycles, 3),
        other => panic!("Expected escalation, got {}", other),
    }

    let report = harness.orchestrator.status(&task("t-esc")).unwrap();
    assert_eq!(report.phase, Phase::PeerReview);
    assert_eq!(report.winner, Some(Role::WriterB));
    assert!(report.error.as_deref().unwrap_or("").contains("Escalated"));
}

#[tokio::test]
async fn test_continue_after_escalation_completes_the_task() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-cont",
        &["A", "A", "B"],
        &["REQUEST_CHANGES", "REQUEST_CHANGES", "REQUEST_CHANGES"],
        None,
    );
    // Cap of 0: the very first rejection escalates.
    let harness = Harness::new(&agent, 0);

    let err = harness
        .orchestrator
        .start(&task("t-cont"), "implement the widget", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Escalated { cycles: 1, .. }));
    let report = harness.orchestrator.status(&task("t-cont")).unwrap();
    assert_eq!(report.phase, Phase::PeerReview);
    assert!(report.error.is_some());

    // The blockers get addressed out of band; the panel now approves.
    workflow_agent(
        script_dir.path(),
        "t-cont",
        &["A", "A", "B"],
        &["APPROVE", "APPROVE", "APPROVE"],
        None,
    );

    let state = harness
        .orchestrator
        .continue_task(&task("t-cont"), "blockers were addressed, re-review", None)
        .await
        .expect("continued workflow should complete");

    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.winner, Some(Role::WriterA));
    assert!(state.error.is_none());
    // One extra synthesis/review cycle on top of the escalated one.
    assert_eq!(state.phase_history().len(), 7);
}

#[tokio::test]
async fn test_continue_after_writer_failure_runs_the_remaining_phases() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-retry",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        Some("writer-b"),
    );
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t-retry"), "implement the widget", None)
        .await
        .unwrap_err();

    // Fix the flaky writer, re-run it with its stored session, then
    // continue the workflow from the Writers phase.
    workflow_agent(
        script_dir.path(),
        "t-retry",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        None,
    );
    harness
        .orchestrator
        .resume(&task("t-retry"), Role::WriterB, "try again", None)
        .await
        .unwrap();

    let state = harness
        .orchestrator
        .continue_task(&task("t-retry"), "carry on", None)
        .await
        .expect("continued workflow should complete");

    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.winner, Some(Role::WriterA));
    assert!(state.error.is_none());
}

#[tokio::test]
async fn test_continue_rejects_completed_and_unknown_tasks() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-done",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        None,
    );
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t-done"), "implement the widget", None)
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .continue_task(&task("t-done"), "more", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = harness
        .orchestrator
        .continue_task(&task("ghost"), "more", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
}

#[tokio::test]
async fn test_writer_work_is_committed_on_candidate_branches() {
    let script_dir = TempDir::new().unwrap();
    let agent = workflow_agent(
        script_dir.path(),
        "t-commit",
        &["A", "A", "A"],
        &["APPROVE", "APPROVE", "APPROVE"],
        None,
    );
    let harness = Harness::new(&agent, 5);

    harness
        .orchestrator
        .start(&task("t-commit"), "implement the widget", None)
        .await
        .unwrap();

    // Both candidate worktrees carry the committed implementation file.
    for role in ["writer-a", "writer-b"] {
        let worktree = harness.workspaces_dir().join("t-commit").join(role);
        assert!(worktree.join("impl.txt").exists(), "{} lost its work", role);
    }
}
