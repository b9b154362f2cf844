//! Integration tests for the database layer.
//!
//! These tests verify the core database operations using an in-memory SQLite database.
//! Tests are organized by module and functionality.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use task_graph_scheduler::clock::ManualClock;
use task_graph_scheduler::config::RenewalPolicy;
use task_graph_scheduler::db::escalations::NewEscalation;
use task_graph_scheduler::db::{Database, Guardrails};
use task_graph_scheduler::error::{ErrorCode, error_code};
use task_graph_scheduler::events::EventKind;
use task_graph_scheduler::types::{
    BudgetPeriod, BudgetScope, EscalationStatus, GroupStatus, InstanceStatus, NewTask,
    NotificationSeverity, Priority, Severity, TaskStatus,
};

/// Helper to create a fresh in-memory database with the usual roles.
fn setup_db() -> Database {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    db.register_role_prefix("pm", "PM").unwrap();
    db.register_role_prefix("coder", "CD").unwrap();
    db
}

fn setup_with_clock(start_ms: i64) -> (Database, ManualClock) {
    let clock = ManualClock::new(start_ms);
    let db = Database::open_in_memory_with_clock(Arc::new(clock.clone())).unwrap();
    db.register_role_prefix("pm", "PM").unwrap();
    db.register_role_prefix("coder", "CD").unwrap();
    (db, clock)
}

fn at(y: i32, m: u32, d: u32, h: u32) -> i64 {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .unwrap()
        .timestamp_millis()
}

fn coder_task(group: &str, title: &str) -> NewTask {
    NewTask::new(group, title, "feature", "coder", "pm-1")
}

mod group_tests {
    use super::*;

    #[test]
    fn group_ids_come_from_their_own_sequence() {
        let db = setup_db();
        let g1 = db.create_group("Ship login", "user request", "pm-1").unwrap();
        let g2 = db.create_group("Fix billing", "incident", "pm-1").unwrap();
        assert_eq!(g1.id, "GRP-001");
        assert_eq!(g2.id, "GRP-002");
        assert_eq!(g1.status, GroupStatus::Active);

        // Task sequences are unaffected.
        let task = db
            .create_task(coder_task(&g1.id, "form"), &Guardrails::default())
            .unwrap();
        assert_eq!(task.id, "CD-001");
    }

    #[test]
    fn empty_title_is_rejected() {
        let db = setup_db();
        let err = db.create_group("  ", "x", "pm-1").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidFieldValue));
    }

    #[test]
    fn completing_twice_is_an_invalid_state() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let done = db.complete_group(&group.id).unwrap();
        assert_eq!(done.status, GroupStatus::Completed);
        assert!(done.completed_at.is_some());

        let err = db.complete_group(&group.id).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));

        let err = db.complete_group("GRP-404").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GroupNotFound));
    }

    #[test]
    fn list_filters_by_status() {
        let db = setup_db();
        let a = db.create_group("A", "x", "pm-1").unwrap();
        db.create_group("B", "x", "pm-1").unwrap();
        db.complete_group(&a.id).unwrap();

        assert_eq!(db.list_groups(None).unwrap().len(), 2);
        let active = db.list_groups(Some(GroupStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "B");
    }

    #[test]
    fn completed_group_accepts_no_new_tasks() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        db.complete_group(&group.id).unwrap();

        let err = db
            .create_task(coder_task(&group.id, "late"), &Guardrails::default())
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));
    }
}

mod task_creation_tests {
    use super::*;

    #[test]
    fn ids_are_sequential_per_prefix() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();

        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        let b = db.create_task(coder_task(&group.id, "b"), &g).unwrap();
        let p = db
            .create_task(NewTask::new(&group.id, "plan", "planning", "pm", "human"), &g)
            .unwrap();

        assert_eq!(a.id, "CD-001");
        assert_eq!(b.id, "CD-002");
        assert_eq!(p.id, "PM-001");
    }

    #[test]
    fn unknown_role_fails_with_unknown_prefix() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let err = db
            .create_task(
                NewTask::new(&group.id, "t", "x", "designer", "pm-1"),
                &Guardrails::default(),
            )
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::UnknownPrefix));
    }

    #[test]
    fn missing_group_fails() {
        let db = setup_db();
        let err = db
            .create_task(coder_task("GRP-404", "t"), &Guardrails::default())
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GroupNotFound));
    }

    #[test]
    fn initial_status_follows_blockers() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();

        let free = db.create_task(coder_task(&group.id, "free"), &g).unwrap();
        assert_eq!(free.status, TaskStatus::Pending);

        let waiting = db
            .create_task(coder_task(&group.id, "waiting").blocked_by([&free.id]), &g)
            .unwrap();
        assert_eq!(waiting.status, TaskStatus::Blocked);
        assert!(db.has_unresolved_blockers(&waiting.id).unwrap());
    }

    #[test]
    fn completed_blocker_yields_a_resolved_edge() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();

        let done = db.create_task(coder_task(&group.id, "done"), &g).unwrap();
        db.claim_task("coder", "coder-1").unwrap();
        db.complete_task(&done.id, None).unwrap();

        let later = db
            .create_task(coder_task(&group.id, "later").blocked_by([&done.id]), &g)
            .unwrap();
        assert_eq!(later.status, TaskStatus::Pending);

        let edges = db.get_blockers(&later.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].resolved);
        assert!(edges[0].resolved_at.is_some());
    }

    #[test]
    fn missing_blocker_is_an_invalid_dependency() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let err = db
            .create_task(
                coder_task(&group.id, "t").blocked_by(["CD-404"]),
                &Guardrails::default(),
            )
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidDependency));
        assert!(db.get_task("CD-001").unwrap().is_none());
    }

    #[test]
    fn duplicate_blockers_collapse() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        let b = db
            .create_task(coder_task(&group.id, "b").blocked_by([&a.id, &a.id]), &g)
            .unwrap();

        assert_eq!(db.get_blockers(&b.id).unwrap().len(), 1);
        let dependents = db.get_dependents(&a.id).unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].task_id, b.id);
    }

    #[test]
    fn edge_queries_on_missing_task_fail() {
        let db = setup_db();
        let err = db.get_blockers("CD-404").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::TaskNotFound));
        let err = db.get_dependents("CD-404").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::TaskNotFound));
    }
}

mod guardrail_tests {
    use super::*;

    fn limits(depth: u32, per_group: u32, cycles: u32) -> Guardrails {
        Guardrails {
            max_task_depth: depth,
            max_tasks_per_group: per_group,
            max_rejection_cycles: cycles,
        }
    }

    #[test]
    fn depth_counts_the_new_task() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = limits(2, 100, 3);

        let root = db.create_task(coder_task(&group.id, "root"), &g).unwrap();
        let child = db
            .create_task(coder_task(&group.id, "child").parent(&root.id), &g)
            .unwrap();
        let err = db
            .create_task(coder_task(&group.id, "grandchild").parent(&child.id), &g)
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GuardrailExceeded));
    }

    #[test]
    fn group_size_is_capped() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let other = db.create_group("H", "x", "pm-1").unwrap();
        let g = limits(5, 2, 3);

        db.create_task(coder_task(&group.id, "1"), &g).unwrap();
        db.create_task(coder_task(&group.id, "2"), &g).unwrap();
        let err = db.create_task(coder_task(&group.id, "3"), &g).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GuardrailExceeded));

        // The cap is per group.
        db.create_task(coder_task(&other.id, "elsewhere"), &g).unwrap();
    }

    #[test]
    fn revision_chain_is_capped() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = limits(5, 100, 1);

        let original = db.create_task(coder_task(&group.id, "v1"), &g).unwrap();
        let rev1 = db
            .create_task(coder_task(&group.id, "v2").revision_of(&original.id), &g)
            .unwrap();
        assert_eq!(rev1.revision_of.as_deref(), Some(original.id.as_str()));

        let err = db
            .create_task(coder_task(&group.id, "v3").revision_of(&rev1.id), &g)
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GuardrailExceeded));
    }

    #[test]
    fn missing_parent_is_reported_on_its_field() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let err = db
            .create_task(
                coder_task(&group.id, "orphan").parent("CD-404"),
                &Guardrails::default(),
            )
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::TaskNotFound));
    }
}

mod claim_tests {
    use super::*;

    #[test]
    fn claims_are_fifo_within_a_role() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        db.create_task(coder_task(&group.id, "first"), &g).unwrap();
        db.create_task(
            coder_task(&group.id, "second").priority(Priority::High),
            &g,
        )
        .unwrap();

        let first = db.claim_task("coder", "coder-1").unwrap().unwrap();
        let second = db.claim_task("coder", "coder-2").unwrap().unwrap();
        assert_eq!(first.id, "CD-001");
        assert_eq!(second.id, "CD-002");
        assert!(db.claim_task("coder", "coder-3").unwrap().is_none());
    }

    #[test]
    fn claim_records_the_instance() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        db.create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();

        let task = db.claim_task("coder", "coder-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.claimed_by.as_deref(), Some("coder-1"));
        assert_eq!(task.executed_by.as_deref(), Some("coder-1"));
        assert!(task.started_at.is_some());
    }

    #[test]
    fn blocked_and_foreign_tasks_are_not_claimable() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        let plan = db
            .create_task(NewTask::new(&group.id, "plan", "planning", "pm", "h"), &g)
            .unwrap();
        db.create_task(coder_task(&group.id, "build").blocked_by([&plan.id]), &g)
            .unwrap();

        assert!(db.claim_task("coder", "coder-1").unwrap().is_none());
        assert!(db.claim_task("reviewer", "rv-1").unwrap().is_none());
        assert_eq!(db.count_pending("pm").unwrap(), 1);
        assert_eq!(db.count_pending("coder").unwrap(), 0);
    }

    #[test]
    fn claim_publishes_an_event() {
        let db = setup_db();
        let mut events = db.events().subscribe();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        db.create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();
        db.claim_task("coder", "coder-1").unwrap();

        let kinds: Vec<EventKind> = events.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::TaskCreated, EventKind::TaskClaimed]);
    }
}

mod completion_tests {
    use super::*;

    #[test]
    fn completion_unblocks_only_fully_resolved_dependents() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();

        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        let d = db.create_task(coder_task(&group.id, "d"), &g).unwrap();
        let b = db
            .create_task(coder_task(&group.id, "b").blocked_by([&a.id]), &g)
            .unwrap();
        let c = db
            .create_task(coder_task(&group.id, "c").blocked_by([&a.id, &d.id]), &g)
            .unwrap();

        let claimed = db.claim_task("coder", "coder-1").unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        let completion = db.complete_task(&a.id, Some("branch:task/CD-001")).unwrap();

        assert_eq!(completion.unblocked, vec![b.id.clone()]);
        assert_eq!(completion.task.status, TaskStatus::Completed);
        assert_eq!(completion.task.claimed_by, None);
        assert_eq!(completion.task.executed_by.as_deref(), Some("coder-1"));
        assert_eq!(
            completion.task.output_ref.as_deref(),
            Some("branch:task/CD-001")
        );
        assert_eq!(
            db.get_task(&c.id).unwrap().unwrap().status,
            TaskStatus::Blocked
        );

        db.claim_task("coder", "coder-1").unwrap(); // d
        let completion = db.complete_task(&d.id, None).unwrap();
        assert_eq!(completion.unblocked, vec![c.id.clone()]);
    }

    #[test]
    fn unblocked_tasks_are_reported_in_creation_order() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();

        let root = db.create_task(coder_task(&group.id, "root"), &g).unwrap();
        let mut expected = Vec::new();
        for i in 0..4 {
            let t = db
                .create_task(
                    coder_task(&group.id, &format!("leaf {}", i)).blocked_by([&root.id]),
                    &g,
                )
                .unwrap();
            expected.push(t.id);
        }

        db.claim_task("coder", "coder-1").unwrap();
        let completion = db.complete_task(&root.id, None).unwrap();
        assert_eq!(completion.unblocked, expected);

        // And they are claimed in that order too.
        for id in expected {
            assert_eq!(db.claim_task("coder", "coder-1").unwrap().unwrap().id, id);
        }
    }

    #[test]
    fn completion_publishes_unblock_events() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        let b = db
            .create_task(coder_task(&group.id, "b").blocked_by([&a.id]), &g)
            .unwrap();
        db.claim_task("coder", "coder-1").unwrap();

        let mut events = db.events().subscribe();
        db.complete_task(&a.id, None).unwrap();
        let events = events.drain();

        assert_eq!(events[0].kind, EventKind::TaskCompleted);
        assert_eq!(events[0].get_str("instance_id"), Some("coder-1"));
        assert_eq!(events[1].kind, EventKind::TaskUnblocked);
        assert_eq!(events[1].get_str("task_id"), Some(b.id.as_str()));
    }

    #[test]
    fn only_in_progress_tasks_can_finish() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let task = db
            .create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();

        let err = db.complete_task(&task.id, None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));
        let err = db.fail_task(&task.id, "nope").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));
        let err = db.complete_task("CD-404", None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::TaskNotFound));

        db.claim_task("coder", "coder-1").unwrap();
        db.complete_task(&task.id, None).unwrap();
        let err = db.complete_task(&task.id, None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));
    }

    #[test]
    fn rejection_keeps_dependents_blocked() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        let b = db
            .create_task(coder_task(&group.id, "b").blocked_by([&a.id]), &g)
            .unwrap();

        db.claim_task("coder", "coder-1").unwrap();
        let rejected = db.reject_task(&a.id, "does not meet the brief").unwrap();
        assert_eq!(rejected.status, TaskStatus::Rejected);
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("does not meet the brief")
        );
        assert_eq!(rejected.claimed_by, None);
        assert!(rejected.completed_at.is_some());

        assert_eq!(
            db.get_task(&b.id).unwrap().unwrap().status,
            TaskStatus::Blocked
        );
        assert!(db.claim_task("coder", "coder-1").unwrap().is_none());
    }

    #[test]
    fn failure_is_terminal() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let task = db
            .create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();
        db.claim_task("coder", "coder-1").unwrap();

        let failed = db.fail_task(&task.id, "executor crashed").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.status.is_terminal());
        assert!(db.claim_task("coder", "coder-1").unwrap().is_none());
    }

    #[test]
    fn reassignment_moves_the_claim() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let task = db
            .create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();
        db.claim_task("coder", "coder-1").unwrap();

        let mut events = db.events().subscribe();
        let moved = db.reassign_task(&task.id, "coder-2").unwrap();
        assert_eq!(moved.status, TaskStatus::InProgress);
        assert_eq!(moved.claimed_by.as_deref(), Some("coder-2"));
        assert_eq!(db.tasks_claimed_by("coder-1").unwrap().len(), 0);
        assert_eq!(db.tasks_claimed_by("coder-2").unwrap().len(), 1);

        let event = &events.drain()[0];
        assert_eq!(event.kind, EventKind::TaskReassigned);
        assert_eq!(event.get_str("from"), Some("coder-1"));
        assert_eq!(event.get_str("to"), Some("coder-2"));
    }

    #[test]
    fn board_partitions_by_status() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        let other = db.create_group("H", "x", "pm-1").unwrap();
        let g = Guardrails::default();
        let a = db.create_task(coder_task(&group.id, "a"), &g).unwrap();
        db.create_task(coder_task(&group.id, "b").blocked_by([&a.id]), &g)
            .unwrap();
        db.create_task(coder_task(&other.id, "c"), &g).unwrap();
        db.claim_task("coder", "coder-1").unwrap();

        let board = db.get_board(Some(group.id.as_str())).unwrap();
        assert_eq!(board.total(), 2);
        assert_eq!(board.in_progress.len(), 1);
        assert_eq!(board.blocked.len(), 1);

        let everything = db.get_board(None).unwrap();
        assert_eq!(everything.total(), 3);
        assert_eq!(everything.pending.len(), 1);

        let err = db.get_board(Some("GRP-404")).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::GroupNotFound));
    }
}

mod instance_tests {
    use super::*;

    #[test]
    fn registration_starts_idle() {
        let db = setup_db();
        let instance = db.register_instance("coder-1", "coder").unwrap();
        assert_eq!(instance.status, InstanceStatus::Idle);
        assert!(instance.current_task.is_none());
        assert!(instance.last_heartbeat.is_none());
        assert_eq!(db.list_instances(Some("coder")).unwrap().len(), 1);
        assert!(db.list_instances(Some("pm")).unwrap().is_empty());
    }

    #[test]
    fn status_updates_validate_input() {
        let db = setup_db();
        db.register_instance("coder-1", "coder").unwrap();

        let err = db.update_status("coder-1", "busy", None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidStatus));

        let err = db.update_status("ghost", "idle", None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InstanceNotFound));

        let updated = db.update_status("coder-1", "working", Some("CD-001")).unwrap();
        assert_eq!(updated.status, InstanceStatus::Working);
        assert_eq!(updated.current_task.as_deref(), Some("CD-001"));
    }

    #[test]
    fn heartbeat_requires_registration() {
        let db = setup_db();
        let err = db.heartbeat("ghost").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InstanceNotFound));
    }

    #[test]
    fn silent_working_instance_goes_stale() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        db.register_instance("coder-1", "coder").unwrap();
        db.register_instance("coder-2", "coder").unwrap();
        db.set_instance_status("coder-1", InstanceStatus::Working, Some("CD-001"))
            .unwrap();
        db.heartbeat("coder-1").unwrap();

        clock.advance_secs(61 * 60);
        let stale = db.get_stale(3600).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].instance_id, "coder-1");

        // A fresh heartbeat clears it; idle instances are never stale.
        db.heartbeat("coder-1").unwrap();
        assert!(db.get_stale(3600).unwrap().is_empty());
    }

    #[test]
    fn working_instance_without_heartbeat_ages_from_start() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        db.register_instance("coder-1", "coder").unwrap();
        db.set_instance_status("coder-1", InstanceStatus::Working, None)
            .unwrap();

        clock.advance_secs(30 * 60);
        assert!(db.get_stale(3600).unwrap().is_empty());
        clock.advance_secs(31 * 60);
        assert_eq!(db.get_stale(3600).unwrap().len(), 1);
    }

    #[test]
    fn reregistration_resets_state() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        db.register_instance("coder-1", "coder").unwrap();
        db.set_instance_status("coder-1", InstanceStatus::Working, Some("CD-001"))
            .unwrap();
        db.heartbeat("coder-1").unwrap();

        clock.advance_secs(10);
        let again = db.register_instance("coder-1", "coder").unwrap();
        assert_eq!(again.status, InstanceStatus::Idle);
        assert!(again.current_task.is_none());

        let stored = db.get_instance("coder-1").unwrap().unwrap();
        assert_eq!(stored.started_at, at(2026, 3, 10, 12) + 10_000);
        assert!(stored.last_heartbeat.is_none());
    }

    #[test]
    fn deregistration_orphans_claims() {
        let db = setup_db();
        let group = db.create_group("G", "x", "pm-1").unwrap();
        db.create_task(coder_task(&group.id, "t"), &Guardrails::default())
            .unwrap();
        db.register_instance("coder-1", "coder").unwrap();
        db.claim_task("coder", "coder-1").unwrap();
        assert!(db.orphaned_claims().unwrap().is_empty());

        db.deregister_instance("coder-1").unwrap();
        let orphaned = db.orphaned_claims().unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].id, "CD-001");

        let err = db.deregister_instance("coder-1").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InstanceNotFound));
    }

    #[test]
    fn claims_outliving_their_worker_are_abandoned() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        let group = db.create_group("G", "x", "pm-1").unwrap();
        for title in ["a", "b"] {
            db.create_task(coder_task(&group.id, title), &Guardrails::default())
                .unwrap();
        }
        db.register_instance("coder-1", "coder").unwrap();
        db.register_instance("coder-2", "coder").unwrap();
        db.claim_task("coder", "coder-1").unwrap();
        db.claim_task("coder", "coder-2").unwrap();
        db.set_instance_status("coder-1", InstanceStatus::Working, Some("CD-001"))
            .unwrap();
        db.set_instance_status("coder-2", InstanceStatus::Working, Some("CD-002"))
            .unwrap();

        clock.advance_secs(600);
        db.register_instance("coder-2", "coder").unwrap();
        // Too recent to tell apart from a worker between claim and start.
        assert!(db.abandoned_claims(3600).unwrap().is_empty());

        clock.advance_secs(3600);
        let abandoned = db.abandoned_claims(3600).unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, "CD-002");
        assert_eq!(abandoned[0].claimed_by.as_deref(), Some("coder-2"));
    }
}

mod escalation_tests {
    use super::*;

    fn raise(db: &Database, task: Option<&str>) -> i64 {
        db.create_escalation(NewEscalation {
            task_id: task.map(str::to_string),
            from_agent: "coder-1".into(),
            to_agent: Some("pm".into()),
            reason: "stuck".into(),
            severity: Severity::High,
        })
        .unwrap()
        .id
    }

    #[test]
    fn escalations_resolve_once() {
        let db = setup_db();
        let id = raise(&db, Some("CD-001"));
        assert!(db.has_open_escalation("CD-001").unwrap());

        let resolved = db.resolve_escalation(id, "reassigned").unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("reassigned"));
        assert!(!db.has_open_escalation("CD-001").unwrap());

        let err = db.resolve_escalation(id, "again").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidState));
        let err = db.resolve_escalation(999, "x").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::EscalationNotFound));
    }

    #[test]
    fn listing_is_newest_first() {
        let db = setup_db();
        let first = raise(&db, None);
        let second = raise(&db, Some("CD-002"));
        db.resolve_escalation(first, "done").unwrap();

        let all = db.list_escalations(None).unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second, first]);
        let open = db.list_escalations(Some(EscalationStatus::Open)).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second);
    }
}

mod budget_tests {
    use super::*;

    #[test]
    fn no_budgets_means_unrestricted() {
        let db = setup_db();
        let check = db.check_budget(Some("coder"), Some("GRP-001")).unwrap();
        assert!(check.allowed);
        assert!(check.scope.is_none());
        assert!(check.remaining.is_none());
    }

    #[test]
    fn exhausted_global_budget_short_circuits() {
        let db = setup_db();
        db.create_budget(BudgetScope::Global, 10.0, None, BudgetPeriod::Daily)
            .unwrap();
        db.create_budget(BudgetScope::Role, 5.0, Some("coder"), BudgetPeriod::Daily)
            .unwrap();
        db.record_spend(10.0, None, None).unwrap();

        let check = db.check_budget(Some("coder"), None).unwrap();
        assert!(!check.allowed);
        assert_eq!(check.scope, Some(BudgetScope::Global));
        assert_eq!(check.remaining, Some(0.0));
    }

    #[test]
    fn tightest_budget_is_reported_when_all_allow() {
        let db = setup_db();
        db.create_budget(BudgetScope::Global, 100.0, None, BudgetPeriod::Monthly)
            .unwrap();
        db.create_budget(BudgetScope::Role, 10.0, Some("coder"), BudgetPeriod::Daily)
            .unwrap();

        let check = db.check_budget(Some("coder"), None).unwrap();
        assert!(check.allowed);
        assert_eq!(check.scope, Some(BudgetScope::Role));
        assert_eq!(check.remaining, Some(10.0));

        // Other roles only see the global budget.
        let check = db.check_budget(Some("pm"), None).unwrap();
        assert_eq!(check.scope, Some(BudgetScope::Global));
    }

    #[test]
    fn spend_is_charged_to_every_matching_scope() {
        let db = setup_db();
        let global = db
            .create_budget(BudgetScope::Global, 100.0, None, BudgetPeriod::Daily)
            .unwrap();
        let role = db
            .create_budget(BudgetScope::Role, 50.0, Some("coder"), BudgetPeriod::Daily)
            .unwrap();
        let group = db
            .create_budget(BudgetScope::Group, 20.0, Some("GRP-001"), BudgetPeriod::Daily)
            .unwrap();
        let other = db
            .create_budget(BudgetScope::Role, 50.0, Some("pm"), BudgetPeriod::Daily)
            .unwrap();

        db.record_spend(2.5, Some("coder"), Some("GRP-001")).unwrap();

        for (id, spent) in [(global.id, 2.5), (role.id, 2.5), (group.id, 2.5), (other.id, 0.0)] {
            assert_eq!(db.get_budget(id).unwrap().unwrap().spent_usd, spent);
        }
    }

    #[test]
    fn threshold_notifications_are_deduplicated_until_read() {
        let db = setup_db();
        let budget = db
            .create_budget(BudgetScope::Role, 10.0, Some("coder"), BudgetPeriod::Daily)
            .unwrap();

        assert!(db.record_spend(7.0, Some("coder"), None).unwrap().is_empty());

        let created = db.record_spend(1.5, Some("coder"), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].severity, NotificationSeverity::Warning);
        assert_eq!(created[0].ref_id.as_deref(), Some(format!("budget:{}", budget.id).as_str()));

        // Unread warning suppresses further ones, even past 100%.
        assert!(db.record_spend(2.0, Some("coder"), None).unwrap().is_empty());

        db.mark_notification_read(created[0].id).unwrap();
        let created = db.record_spend(0.5, Some("coder"), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].severity, NotificationSeverity::Critical);

        assert_eq!(db.list_notifications(true).unwrap().len(), 1);
        assert_eq!(db.list_notifications(false).unwrap().len(), 2);
    }

    #[test]
    fn threshold_crossing_publishes_an_event() {
        let db = setup_db();
        db.create_budget(BudgetScope::Global, 1.0, None, BudgetPeriod::Daily)
            .unwrap();
        let mut events = db.events().subscribe();
        db.record_spend(0.9, None, None).unwrap();

        let event = &events.drain()[0];
        assert_eq!(event.kind, EventKind::BudgetThreshold);
        assert_eq!(event.get_str("severity"), Some("warning"));
    }

    #[test]
    fn invalid_amounts_and_scopes_are_rejected() {
        let db = setup_db();
        let err = db.record_spend(-1.0, None, None).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidFieldValue));

        let err = db
            .create_budget(BudgetScope::Role, 10.0, None, BudgetPeriod::Daily)
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidFieldValue));

        let err = db
            .create_budget(BudgetScope::Global, 0.0, None, BudgetPeriod::Daily)
            .unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::InvalidFieldValue));

        let err = db.delete_budget(42).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::BudgetNotFound));
    }

    #[test]
    fn ensure_budget_only_creates_once() {
        let db = setup_db();
        let first = db
            .ensure_budget(BudgetScope::Global, 25.0, None, BudgetPeriod::Weekly)
            .unwrap();
        assert!(first.is_some());
        let second = db
            .ensure_budget(BudgetScope::Global, 50.0, None, BudgetPeriod::Weekly)
            .unwrap();
        assert!(second.is_none());
        assert_eq!(db.list_budgets().unwrap().len(), 1);
    }

    #[test]
    fn expired_budgets_follow_the_renewal_policy() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        let budget = db
            .create_budget(BudgetScope::Global, 10.0, None, BudgetPeriod::Daily)
            .unwrap();
        assert_eq!(budget.reset_at, Some(at(2026, 3, 11, 0)));
        db.record_spend(10.0, None, None).unwrap();
        assert!(!db.check_budget(None, None).unwrap().allowed);

        // Past the boundary the budget no longer matches.
        clock.set_ms(at(2026, 3, 11, 1));
        assert!(db.check_budget(None, None).unwrap().scope.is_none());

        assert_eq!(db.renew_budgets(RenewalPolicy::Deactivate).unwrap(), vec![budget.id]);
        assert!(db.check_budget(None, None).unwrap().scope.is_none());

        assert_eq!(db.renew_budgets(RenewalPolicy::Reset).unwrap(), vec![budget.id]);
        let renewed = db.get_budget(budget.id).unwrap().unwrap();
        assert_eq!(renewed.spent_usd, 0.0);
        assert_eq!(renewed.reset_at, Some(at(2026, 3, 12, 0)));
        let check = db.check_budget(None, None).unwrap();
        assert!(check.allowed);
        assert_eq!(check.budget_id, Some(budget.id));

        // Renewed budgets are active again and not re-expired.
        assert!(db.renew_budgets(RenewalPolicy::Reset).unwrap().is_empty());
    }

    #[test]
    fn expired_budgets_are_not_charged() {
        let (db, clock) = setup_with_clock(at(2026, 3, 10, 12));
        let budget = db
            .create_budget(BudgetScope::Global, 10.0, None, BudgetPeriod::Daily)
            .unwrap();
        clock.set_ms(at(2026, 3, 12, 0));
        db.record_spend(3.0, None, None).unwrap();
        assert_eq!(db.get_budget(budget.id).unwrap().unwrap().spent_usd, 0.0);
    }
}

mod notification_tests {
    use super::*;

    #[test]
    fn marking_unknown_notification_fails() {
        let db = setup_db();
        let err = db.mark_notification_read(7).unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::NotificationNotFound));
    }
}

mod sequence_tests {
    use super::*;

    #[test]
    fn prefixes_count_independently_and_never_reuse() {
        let db = setup_db();
        assert_eq!(db.next_id("CD").unwrap(), "CD-001");
        assert_eq!(db.next_id("CD").unwrap(), "CD-002");
        assert_eq!(db.next_id("PM").unwrap(), "PM-001");

        // Rebinding a role keeps the old counter.
        db.register_role_prefix("coder", "DEV").unwrap();
        assert_eq!(db.prefix_for_role("coder").unwrap().as_deref(), Some("DEV"));
        db.register_role_prefix("coder", "CD").unwrap();
        assert_eq!(db.next_id("CD").unwrap(), "CD-003");
    }

    #[test]
    fn unregistered_prefix_is_an_error() {
        let db = setup_db();
        let err = db.next_id("ZZ").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::UnregisteredPrefix));
    }
}
