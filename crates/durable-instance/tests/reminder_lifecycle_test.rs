// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for reminder reconciliation across pause, save and reload.

mod common;

use std::time::Duration;

use common::*;
use durable_instance::host::mock::ReminderCall;
use durable_instance::reminders::{PersistedReminder, bookmarks_key};
use durable_instance::{
    ExecutionState, FiredReminder, InstanceError, InstanceHost, ReminderState, SnapshotStore,
};

async fn saved_bookmarks(ctx: &TestContext) -> Vec<String> {
    let snapshot = ctx
        .store
        .load_snapshot(&ctx.config.instance_id)
        .await
        .unwrap()
        .expect("snapshot should exist");
    let persisted: Vec<PersistedReminder> = snapshot
        .read_write_view()
        .get_as(&bookmarks_key())
        .unwrap()
        .unwrap_or_default();
    persisted.into_iter().map(|p| p.bookmark).collect()
}

#[tokio::test]
async fn test_reminder_registered_before_save_and_kept() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    ctx.host.clear_calls();

    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisterAndSave)
    );

    // pause registers the reminder before anything is saved
    instance.reminders_mut().on_paused().await.unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredButNotSaved)
    );
    match ctx.host.mutations().as_slice() {
        [ReminderCall::Register { name, due_time }] => {
            assert_eq!(name, "bookmark:R1");
            assert!(approximately(*due_time, Duration::from_secs(5)));
        }
        other => panic!("unexpected calls: {:?}", other),
    }
    assert_eq!(ctx.store.save_count(), 0);

    instance.reminders_mut().on_saving().await.unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredAndSaved)
    );

    instance.reminders_mut().on_saved().await.unwrap();
    assert_eq!(ctx.host.mutations().len(), 1, "no unregister call expected");
    assert_eq!(ctx.host.live_reminders(), vec!["bookmark:R1"]);
}

#[tokio::test]
async fn test_full_idle_registers_and_persists_bookmark() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    ctx.host.clear_calls();

    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();
    instance.idle().await.unwrap();

    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredAndSaved)
    );
    assert_eq!(ctx.host.mutations().len(), 1);
    assert_eq!(saved_bookmarks(&ctx).await, vec!["R1"]);
}

#[tokio::test]
async fn test_unregister_before_pause_makes_no_external_calls() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    ctx.host.clear_calls();

    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();
    instance.reminders_mut().unregister("R1").unwrap();
    assert!(instance.reminders().is_empty());

    instance.idle().await.unwrap();
    assert!(ctx.host.mutations().is_empty());
    assert!(saved_bookmarks(&ctx).await.is_empty());
}

#[tokio::test]
async fn test_cancelled_reminder_unregistered_only_after_commit() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(60))
        .unwrap();
    instance.idle().await.unwrap();
    ctx.host.clear_calls();

    instance.reminders_mut().unregister("R1").unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::SaveAndUnregister)
    );

    // a failed snapshot write must not cancel the reminder
    ctx.store.set_fail_saves(true);
    let err = instance.idle().await.unwrap_err();
    assert_eq!(err.error_code(), "STORE_ERROR");
    assert!(!err.is_fatal());
    assert!(ctx.host.mutations().is_empty());
    assert_eq!(saved_bookmarks(&ctx).await, vec!["R1"]);
    assert_eq!(ctx.host.live_reminders(), vec!["bookmark:R1"]);

    ctx.store.set_fail_saves(false);
    instance.idle().await.unwrap();
    assert_eq!(ctx.host.mutations(), vec![unregister_call("R1")]);
    assert!(saved_bookmarks(&ctx).await.is_empty());
    assert!(instance.reminders().is_empty());
}

#[tokio::test]
async fn test_reregistering_a_cancelled_reminder() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(60))
        .unwrap();
    instance.idle().await.unwrap();
    ctx.host.clear_calls();

    instance.reminders_mut().unregister("R1").unwrap();
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(120))
        .unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::ReregisterAndResave)
    );

    instance.reminders_mut().on_paused().await.unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredButNotResaved)
    );
    match ctx.host.mutations().as_slice() {
        [ReminderCall::Register { name, due_time }] => {
            assert_eq!(name, "bookmark:R1");
            assert!(approximately(*due_time, Duration::from_secs(120)));
        }
        other => panic!("unexpected calls: {:?}", other),
    }

    // cancelling now still waits for the next save
    instance.reminders_mut().unregister("R1").unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::SaveAndUnregister)
    );
    instance.idle().await.unwrap();

    let mutations = ctx.host.mutations();
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[1], unregister_call("R1"));
    assert!(instance.reminders().is_empty());
}

#[tokio::test]
async fn test_saved_reminder_cannot_be_updated_in_place() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(60))
        .unwrap();
    instance.idle().await.unwrap();

    let err = instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(120))
        .unwrap_err();
    match err {
        InstanceError::InvalidReminderTransition {
            bookmark, state, ..
        } => {
            assert_eq!(bookmark, "R1");
            assert_eq!(state, ReminderState::RegisteredAndSaved);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_register_while_awaiting_save_is_invalid() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();
    instance.reminders_mut().on_paused().await.unwrap();

    let err = instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(10))
        .unwrap_err();
    assert!(matches!(err, InstanceError::InvalidReminderTransition { .. }));
    assert_eq!(err.error_code(), "INVALID_REMINDER_TRANSITION");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_reactivation_marker_lifecycle() {
    let ctx = TestContext::new();
    ctx.host.set_execution_state(ExecutionState::Runnable);
    let mut instance = ctx.activated().await;

    // activation of a runnable instance without reminders registers the marker
    assert_eq!(
        ctx.host.mutations(),
        vec![ReminderCall::Register {
            name: "reactivation".to_string(),
            due_time: Duration::from_secs(30),
        }]
    );
    assert!(instance.reminders().is_reactivation_registered());

    ctx.host.clear_calls();
    instance.idle().await.unwrap();
    assert!(ctx.host.mutations().is_empty(), "marker registered exactly once");

    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();
    instance.idle().await.unwrap();
    let mutations = ctx.host.mutations();
    assert_eq!(mutations.len(), 2);
    assert!(matches!(&mutations[0], ReminderCall::Register { name, .. } if name == "bookmark:R1"));
    assert_eq!(
        mutations[1],
        ReminderCall::Unregister {
            name: "reactivation".to_string()
        }
    );
    assert!(!instance.reminders().is_reactivation_registered());
}

#[tokio::test]
async fn test_marker_registered_on_save_and_released_when_idle() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    assert!(!instance.reminders().is_reactivation_registered());

    ctx.host.set_execution_state(ExecutionState::Runnable);
    instance.idle().await.unwrap();
    assert_eq!(ctx.host.live_reminders(), vec!["reactivation"]);

    ctx.host.set_execution_state(ExecutionState::Complete);
    ctx.host.clear_calls();
    instance.idle().await.unwrap();
    assert_eq!(
        ctx.host.mutations(),
        vec![ReminderCall::Unregister {
            name: "reactivation".to_string()
        }]
    );
    assert!(ctx.host.live_reminders().is_empty());
}

#[tokio::test]
async fn test_reload_unregisters_unsaved_reminder() {
    let ctx = TestContext::new();
    {
        let mut instance = ctx.activated().await;
        instance
            .reminders_mut()
            .register_or_update("R1", Duration::from_secs(5))
            .unwrap();
        // crash after pause, before the snapshot write
        instance.reminders_mut().on_paused().await.unwrap();
    }
    assert_eq!(ctx.host.live_reminders(), vec!["bookmark:R1"]);
    ctx.host.clear_calls();

    let instance = ctx.activated().await;
    assert!(instance.reminders().is_empty());
    assert_eq!(ctx.host.mutations(), vec![unregister_call("R1")]);
    assert_eq!(instance.reminder_fired("bookmark:R1"), FiredReminder::Stale);
}

#[tokio::test]
async fn test_reload_restores_and_reregisters_missing_reminder() {
    let ctx = TestContext::new();
    {
        let mut instance = ctx.activated().await;
        instance
            .reminders_mut()
            .register_or_update("R1", Duration::from_secs(60))
            .unwrap();
        instance.idle().await.unwrap();
    }

    // the reminder service lost the registration
    ctx.host.unregister_reminder("bookmark:R1").await.unwrap();
    ctx.host.clear_calls();

    let instance = ctx.activated().await;
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredAndSaved)
    );
    match ctx.host.mutations().as_slice() {
        [ReminderCall::Register { name, due_time }] => {
            assert_eq!(name, "bookmark:R1");
            assert!(*due_time <= Duration::from_secs(60));
        }
        other => panic!("unexpected calls: {:?}", other),
    }
    assert_eq!(
        instance.reminder_fired("bookmark:R1"),
        FiredReminder::Bookmark("R1".to_string())
    );
}

#[tokio::test]
async fn test_reload_keeps_foreign_reminders_and_detects_marker() {
    let ctx = TestContext::new();
    ctx.host
        .insert_live_reminder("reactivation", Duration::from_secs(30));
    ctx.host
        .insert_live_reminder("maintenance", Duration::from_secs(30));

    let instance = ctx.activated().await;
    assert!(!instance.reminders().is_reactivation_registered());
    // idle host: the marker found on load is released, other names are left alone
    assert_eq!(
        ctx.host.mutations(),
        vec![ReminderCall::Unregister {
            name: "reactivation".to_string()
        }]
    );
    assert_eq!(ctx.host.live_reminders(), vec!["maintenance"]);
}

#[tokio::test]
async fn test_host_failure_aborts_idle_without_snapshot() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;
    instance
        .reminders_mut()
        .register_or_update("R1", Duration::from_secs(5))
        .unwrap();

    ctx.host.set_failing(Some("reminder service unavailable"));
    let err = instance.idle().await.unwrap_err();
    assert_eq!(err.error_code(), "HOST_ERROR");
    assert_eq!(ctx.store.save_count(), 0);
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisterAndSave)
    );

    // retrying from the same state succeeds once the host recovers
    ctx.host.set_failing(None);
    instance.idle().await.unwrap();
    assert_eq!(
        instance.reminders().state("R1"),
        Some(ReminderState::RegisteredAndSaved)
    );
    assert_eq!(ctx.store.save_count(), 1);
}

#[tokio::test]
async fn test_no_premature_cancellation_over_mixed_sequence() {
    let ctx = TestContext::new();
    let mut instance = ctx.activated().await;

    let bookmarks = ["a", "b", "c", "d"];
    for (round, bookmark) in bookmarks.iter().enumerate() {
        instance
            .reminders_mut()
            .register_or_update(bookmark, Duration::from_secs(10 + round as u64))
            .unwrap();
        if round > 0 {
            instance.reminders_mut().unregister(bookmarks[round - 1]).unwrap();
        }

        let saved_before = saved_bookmarks_or_empty(&ctx).await;
        ctx.host.clear_calls();
        instance.reminders_mut().on_paused().await.unwrap();
        instance.reminders_mut().on_saving().await.unwrap();

        // nothing referenced by the last committed snapshot was unregistered
        for call in ctx.host.mutations() {
            if let ReminderCall::Unregister { name } = call {
                let bookmark = name.trim_start_matches("bookmark:");
                assert!(!saved_before.iter().any(|b| b == bookmark), "{bookmark} cancelled early");
            }
        }

        instance.idle().await.unwrap();
    }

    assert_eq!(saved_bookmarks(&ctx).await, vec!["d"]);
    assert_eq!(ctx.host.live_reminders(), vec!["bookmark:d"]);
}

async fn saved_bookmarks_or_empty(ctx: &TestContext) -> Vec<String> {
    if ctx.store.save_count() == 0 {
        return Vec::new();
    }
    saved_bookmarks(ctx).await
}
