//! End-to-end user turns through the application context.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use nurture_core::dispatch::{EMPTY_RESPONSE_TEXT, ERROR_RESPONSE_TEXT};
use nurture_core::context::CONTEXT_STORAGE_KEY;
use nurture_core::queue::QUEUE_STORAGE_KEY;
use nurture_core::rate_limit::RATE_LIMIT_STORAGE_KEY;
use nurture_core::{
    ConversationId, DispatchError, KvStore, MemoryStore, Priority, Role, SendOptions, UserProfile,
};
use nurture_test_utils::fixtures::{auth_error, response_with_usage, server_error, text_response};
use nurture_test_utils::{ScriptedClient, TestApp, TestConfigBuilder};

#[test_log::test(tokio::test)]
async fn test_answer_fills_placeholder_and_records_tokens() {
    let harness = TestApp::new(ScriptedClient::always(Ok(response_with_usage(
        "Ginger tea can help.",
        150,
    ))));

    let sent = harness
        .dispatcher()
        .send_message("Any tips for nausea?", None)
        .await
        .unwrap();
    assert_eq!(sent.user_message.role, Role::User);
    assert_eq!(sent.user_message.content, "Any tips for nausea?");

    harness.settle().await;

    let conversation = harness.conversation(&sent.conversation_id).await;
    assert_eq!(conversation.message_history.len(), 2);
    let answer = &conversation.message_history[1];
    assert_eq!(answer.id, sent.placeholder_id);
    assert_eq!(answer.role, Role::Assistant);
    assert_eq!(answer.content, "Ginger tea can help.");
    assert!(!answer.read);

    let quota = harness.dispatcher().get_rate_limit_status().await.unwrap();
    assert_eq!(quota.minute_remaining, 9);
    assert_eq!(quota.hour_remaining, 99);
    assert_eq!(quota.tokens_remaining, 100_000 - 150);
}

#[tokio::test]
async fn test_placeholder_is_empty_until_answered() {
    let (client, gate) = ScriptedClient::replying("Later").gated();
    let harness = TestApp::new(client);

    let sent = harness
        .dispatcher()
        .send_message("hello", None)
        .await
        .unwrap();
    let placeholder = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(placeholder.content, "");
    assert!(!placeholder.read);
    assert_eq!(harness.dispatcher().get_queue_length(), 1);

    gate.open();
    harness.settle().await;
    let answered = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(answered.content, "Later");
}

#[tokio::test]
async fn test_empty_answer_uses_fallback_text() {
    let harness = TestApp::new(ScriptedClient::always(Ok(text_response(""))));
    let sent = harness
        .dispatcher()
        .send_message("hello", None)
        .await
        .unwrap();
    harness.settle().await;

    let message = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(message.content, EMPTY_RESPONSE_TEXT);
}

#[tokio::test]
async fn test_failure_writes_error_text_and_records_nothing() {
    let harness = TestApp::new(ScriptedClient::failing(auth_error()));
    let sent = harness
        .dispatcher()
        .send_message("hello", None)
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(harness.client.calls(), 1);
    let message = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(message.content, ERROR_RESPONSE_TEXT);

    let quota = harness.dispatcher().get_rate_limit_status().await.unwrap();
    assert_eq!(quota.minute_remaining, 10);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_write_error_text() {
    let harness = TestApp::new(ScriptedClient::failing(server_error()));
    let sent = harness
        .dispatcher()
        .send_message("hello", None)
        .await
        .unwrap();
    harness.settle().await;

    assert_eq!(harness.client.calls(), 4);
    let message = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(message.content, ERROR_RESPONSE_TEXT);
}

#[tokio::test]
async fn test_rate_limit_denial_enqueues_nothing() {
    let config = TestConfigBuilder::new().max_requests_per_minute(1).build();
    let harness = TestApp::with_config(config, ScriptedClient::new());
    let dispatcher = harness.dispatcher();

    let first = dispatcher.send_message("one", None).await.unwrap();
    harness.settle().await;

    let err = dispatcher
        .send_message("two", Some(&first.conversation_id))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::RateLimited));
    assert_eq!(err.to_string(), "Rate limit exceeded. Please try again later.");
    assert_eq!(dispatcher.get_queue_length(), 0);
    assert_eq!(harness.client.calls(), 1);

    // The user turn stays; no placeholder is added for it.
    let conversation = harness.conversation(&first.conversation_id).await;
    let roles: Vec<Role> = conversation.message_history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
}

#[tokio::test]
async fn test_unknown_conversation_is_rejected() {
    let harness = TestApp::new(ScriptedClient::new());
    let missing = ConversationId::from("does-not-exist");
    let err = harness
        .dispatcher()
        .send_message("hello", Some(&missing))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ConversationNotFound(id) if id == missing));
    assert!(harness.dispatcher().get_conversations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_follow_up_carries_history() {
    let harness = TestApp::new(
        ScriptedClient::replying("second answer").then(Ok(text_response("first answer"))),
    );
    let dispatcher = harness.dispatcher();

    let first = dispatcher.send_message("first question", None).await.unwrap();
    harness.settle().await;
    dispatcher
        .send_message("second question", Some(&first.conversation_id))
        .await
        .unwrap();
    harness.settle().await;

    let requests = harness.client.requests();
    assert_eq!(requests.len(), 2);
    let second: Vec<(Role, &str)> = requests[1]
        .messages
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(second.len(), 4);
    assert_eq!(second[0].0, Role::System);
    assert_eq!(
        &second[1..],
        &[
            (Role::User, "first question"),
            (Role::Assistant, "first answer"),
            (Role::User, "second question"),
        ]
    );
    assert_eq!(requests[1].model, "gpt-4-turbo");
}

#[tokio::test]
async fn test_history_window_applies_to_dispatch() {
    let config = TestConfigBuilder::new().max_history(4).build();
    let harness = TestApp::with_config(config, ScriptedClient::new());
    let dispatcher = harness.dispatcher();

    let first = dispatcher.send_message("q1", None).await.unwrap();
    for prompt in ["q2", "q3"] {
        harness.settle().await;
        dispatcher
            .send_message(prompt, Some(&first.conversation_id))
            .await
            .unwrap();
    }
    harness.settle().await;

    let conversation = harness.conversation(&first.conversation_id).await;
    let contents: Vec<&str> = conversation
        .message_history
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["q2", "ok", "q3", "ok"]);
}

#[tokio::test]
async fn test_profile_personalizes_prompt() {
    let harness = TestApp::new(ScriptedClient::new());
    let profile = UserProfile {
        id: "u1".to_string(),
        name: "Robin".to_string(),
        current_week_of_pregnancy: Some(30),
        medical_conditions: vec!["hypertension".to_string()],
        ..Default::default()
    };
    let options = SendOptions {
        profile: Some(profile.clone()),
        ..Default::default()
    };
    let sent = harness
        .dispatcher()
        .send_message_with("Is swimming safe?", None, options)
        .await
        .unwrap();
    harness.settle().await;

    let system = &harness.client.requests()[0].messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.ends_with(
        "The user is currently in week 30 of pregnancy. \
         The user has reported the following medical conditions: hypertension."
    ));

    let updated = UserProfile {
        current_week_of_pregnancy: Some(31),
        ..profile
    };
    assert_eq!(
        harness
            .dispatcher()
            .update_user_profile(&updated)
            .await
            .unwrap(),
        1
    );
    let conversation = harness.conversation(&sent.conversation_id).await;
    assert_eq!(conversation.pregnancy_week, Some(31));
}

#[tokio::test]
async fn test_high_priority_send_overtakes_queued_normal() {
    let (client, gate) = ScriptedClient::new().gated();
    let harness = TestApp::new(client);
    let dispatcher = harness.dispatcher();

    dispatcher.send_message("blocker", None).await.unwrap();
    harness.client.wait_for_calls(1).await;

    dispatcher.send_message("normal", None).await.unwrap();
    dispatcher
        .send_message_with_priority("urgent", None, Priority::High)
        .await
        .unwrap();

    gate.open();
    harness.settle().await;
    assert_eq!(
        harness.client.user_prompts(),
        vec!["blocker", "urgent", "normal"]
    );
}

#[tokio::test]
async fn test_late_outcome_for_deleted_conversation_is_ignored() {
    let (client, gate) = ScriptedClient::replying("too late").gated();
    let harness = TestApp::new(client);
    let dispatcher = harness.dispatcher();

    let sent = dispatcher.send_message("hello", None).await.unwrap();
    harness.client.wait_for_calls(1).await;
    assert!(
        dispatcher
            .delete_conversation(&sent.conversation_id)
            .await
            .unwrap()
    );

    gate.open();
    harness.settle().await;

    assert_eq!(dispatcher.outcomes_applied(), 1);
    assert!(
        dispatcher
            .get_conversation(&sent.conversation_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_clear_queue_drops_pending_turns() {
    let (client, gate) = ScriptedClient::replying("answered").gated();
    let harness = TestApp::new(client);
    let dispatcher = harness.dispatcher();

    let in_flight = dispatcher.send_message("first", None).await.unwrap();
    harness.client.wait_for_calls(1).await;
    let pending = dispatcher.send_message("second", None).await.unwrap();

    assert_eq!(dispatcher.clear_queue().await.unwrap(), 2);
    gate.open();
    harness.settle().await;

    let answered = harness
        .message(&in_flight.conversation_id, &in_flight.placeholder_id)
        .await
        .unwrap();
    assert_eq!(answered.content, "answered");
    let dropped = harness
        .message(&pending.conversation_id, &pending.placeholder_id)
        .await
        .unwrap();
    assert_eq!(dropped.content, "");
    assert_eq!(harness.client.calls(), 1);
}

#[tokio::test]
async fn test_restart_fills_placeholder_from_persisted_queue() {
    let config = TestConfigBuilder::new().build();
    let store = Arc::new(MemoryStore::new());

    let (stuck, _gate) = ScriptedClient::new().gated();
    let before = TestApp::with_store(config.clone(), store.clone(), Arc::new(stuck));
    let sent = before
        .dispatcher()
        .send_message("are you there?", None)
        .await
        .unwrap();
    before.client.wait_for_calls(1).await;

    let after = TestApp::with_store(
        config,
        store.clone(),
        Arc::new(ScriptedClient::replying("back again")),
    );
    assert!(after.app.start().await.unwrap());
    after.settle().await;

    let message = after
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(message.content, "back again");
}

#[test_log::test(tokio::test)]
async fn test_unreadable_documents_are_set_aside() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(QUEUE_STORAGE_KEY, json!({"not": "a list"}))
        .await
        .unwrap();
    store.set(CONTEXT_STORAGE_KEY, json!([1, 2, 3])).await.unwrap();
    store
        .set(RATE_LIMIT_STORAGE_KEY, json!("garbage"))
        .await
        .unwrap();

    let harness = TestApp::with_store(
        TestConfigBuilder::new().build(),
        store.clone(),
        Arc::new(ScriptedClient::replying("still here")),
    );
    assert!(harness.app.start().await.unwrap());
    assert_eq!(harness.dispatcher().get_queue_length(), 0);
    assert!(harness.dispatcher().get_conversations().await.unwrap().is_empty());

    let sent = harness
        .dispatcher()
        .send_message("hello?", None)
        .await
        .unwrap();
    harness.settle().await;
    let answer = harness
        .message(&sent.conversation_id, &sent.placeholder_id)
        .await
        .unwrap();
    assert_eq!(answer.content, "still here");

    assert_eq!(
        store.get("ai_message_queue.corrupt").await.unwrap(),
        Some(json!({"not": "a list"}))
    );
    assert_eq!(
        store.get("ai_context.corrupt").await.unwrap(),
        Some(json!([1, 2, 3]))
    );
    let quota = harness.dispatcher().get_rate_limit_status().await.unwrap();
    assert_eq!(quota.minute_remaining, 9);
}

#[tokio::test]
async fn test_reset_rate_limits_reopens_admission() {
    let config = TestConfigBuilder::new().max_requests_per_minute(1).build();
    let harness = TestApp::with_config(config, ScriptedClient::new());
    let dispatcher = harness.dispatcher();

    dispatcher.send_message("one", None).await.unwrap();
    harness.settle().await;
    assert!(matches!(
        dispatcher.send_message("two", None).await,
        Err(DispatchError::RateLimited)
    ));

    dispatcher.reset_rate_limits().await.unwrap();
    dispatcher.send_message("three", None).await.unwrap();
    harness.settle().await;
    assert_eq!(harness.client.calls(), 2);
}
