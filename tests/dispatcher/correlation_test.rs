//! Tests for correlation between concurrent commands and out-of-order responses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wxbridge::dispatcher::{CommandError, Dispatcher};

#[tokio::test]
async fn out_of_order_responses_reach_their_own_callers() {
    let dispatcher = Arc::new(Dispatcher::default());

    let mut waiters = Vec::new();
    for name in ["get_contacts", "get_groups", "get_session_list"] {
        let (ticket, _line) = dispatcher.register(name, &json!({})).expect("register");
        let id = ticket.id.clone();
        let d = Arc::clone(&dispatcher);
        waiters.push((id, tokio::spawn(async move { d.wait(ticket).await })));
    }
    assert_eq!(dispatcher.pending_count(), 3);

    // Responses arrive as 3, 1, 2.
    for id in ["3", "1", "2"] {
        assert!(dispatcher.resolve(id, json!({"answer_for": id})));
    }

    for (id, waiter) in waiters {
        let payload = waiter
            .await
            .expect("waiter task should not panic")
            .expect("command should resolve");
        assert_eq!(payload, json!({"answer_for": id}));
    }
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn unknown_ids_are_discarded_without_side_effects() {
    let dispatcher = Dispatcher::default();
    let (ticket, _) = dispatcher.register("get_contacts", &json!({})).expect("register");

    assert!(!dispatcher.resolve("999", json!({"success": true})));
    assert_eq!(dispatcher.pending_count(), 1);

    assert!(dispatcher.resolve(&ticket.id, json!({"success": true})));
    assert!(dispatcher.wait(ticket).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_settles_nothing() {
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(60)));
    let (ticket, _) = dispatcher
        .register("get_message_history", &json!({"contact_name": "张三"}))
        .expect("register");
    let id = ticket.id.clone();

    let d = Arc::clone(&dispatcher);
    let waiter = tokio::spawn(async move { d.wait(ticket).await });

    tokio::time::sleep(Duration::from_secs(61)).await;
    let result = waiter.await.expect("waiter task should not panic");
    match result {
        Err(CommandError::CommandTimeout { id: timed_out, timeout, .. }) => {
            assert_eq!(timed_out, id);
            assert_eq!(timeout, Duration::from_secs(60));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    assert!(!dispatcher.resolve(&id, json!({"success": true})));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn response_just_before_deadline_wins() {
    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(60)));
    let (ticket, _) = dispatcher.register("bulk_send", &json!({})).expect("register");
    let id = ticket.id.clone();

    let d = Arc::clone(&dispatcher);
    let waiter = tokio::spawn(async move { d.wait(ticket).await });

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(dispatcher.resolve(&id, json!({"success": true, "sent": 2})));

    let payload = waiter
        .await
        .expect("waiter task should not panic")
        .expect("should resolve before the deadline");
    assert_eq!(payload["sent"], 2);
}

#[tokio::test]
async fn ids_keep_increasing_after_settlement() {
    let dispatcher = Dispatcher::default();
    let mut seen = Vec::new();
    for _ in 0..5 {
        let (ticket, line) = dispatcher.register("get_status", &json!(null)).expect("register");
        let text = String::from_utf8(line).expect("utf8");
        assert!(text.contains(&format!("\"id\":\"{}\"", ticket.id)));
        assert!(dispatcher.resolve(&ticket.id, json!({})));
        seen.push(ticket.id.parse::<u64>().expect("numeric id"));
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "ids: {seen:?}");
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_does_not_leak_the_entry() {
    let dispatcher = Dispatcher::new(Duration::from_secs(60));
    let (ticket, _) = dispatcher
        .register("get_message_history", &json!({}))
        .expect("register");
    let id = ticket.id.clone();

    // The caller gives up long before the command timeout.
    let outer = tokio::time::timeout(Duration::from_secs(1), dispatcher.wait(ticket)).await;
    assert!(outer.is_err());
    assert_eq!(dispatcher.pending_count(), 0);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(dispatcher.pending_count(), 0);
    assert!(!dispatcher.resolve(&id, json!({"success": true})));
}

#[tokio::test]
async fn registration_after_rejection_fails_fast() {
    let dispatcher = Dispatcher::default();
    let (ticket, _) = dispatcher.register("get_contacts", &json!({})).expect("register");
    assert_eq!(
        dispatcher.reject_all(|| CommandError::ProcessUnavailable),
        1
    );
    assert!(matches!(
        dispatcher.wait(ticket).await,
        Err(CommandError::ProcessUnavailable)
    ));

    let err = dispatcher
        .register("get_groups", &json!({}))
        .expect_err("closed dispatcher refuses new commands");
    assert!(matches!(err, CommandError::ProcessUnavailable));
    assert_eq!(dispatcher.pending_count(), 0);
}
