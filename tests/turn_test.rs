//! Turn-engine behavior against a scripted provider and a mock gateway.

mod common;

use common::{MockGateway, ScriptedProvider, text_completion, tool_call_completion};
use serde_json::{Map, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use versioned_agent::{AgentSpec, Error, MessageRole, Store, TurnOptions};

fn spec() -> AgentSpec {
    AgentSpec::new("Calculator", "You are a calculator.", "claude-3-5-haiku")
}

fn store_with(provider: Arc<ScriptedProvider>) -> Store {
    Store::in_memory().with_chat_provider(provider)
}

#[tokio::test]
async fn lineage_of_three() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 2));
    let store = store_with(provider.clone());

    let a1 = store.create_agent(spec()).await.unwrap();
    let a2 = store
        .advance(&a1, "first", None, &TurnOptions::default())
        .await
        .unwrap();
    let a3 = store
        .advance(&a2, "second", None, &TurnOptions::default())
        .await
        .unwrap();

    let lineage = store.lineage(&a3).await.unwrap();
    assert_eq!(lineage, vec![a1.clone(), a2.clone(), a3.clone()]);
    assert!(lineage[0].parent_id.is_none());
    assert_eq!(lineage[1].parent_id, Some(a1.id));
    assert_eq!(lineage[2].parent_id, Some(a2.id));

    // Two turns, two messages each: user + assistant.
    let conversation = store.conversation(&a3).await.unwrap();
    assert_eq!(conversation.message_ids.len(), 4);
    assert_eq!(provider.request_count(), 2);
}

#[tokio::test]
async fn clone_is_a_sibling() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 1));
    let store = store_with(provider);

    let a = store.create_agent(spec()).await.unwrap();
    let b = store
        .advance(&a, "hello", None, &TurnOptions::default())
        .await
        .unwrap();
    let c = store.clone_agent(&b).await.unwrap();

    assert_eq!(c.parent_id, b.parent_id);
    assert_eq!(c.parent_id, Some(a.id));
    assert_eq!(c.conversation_id, b.conversation_id);
    assert_ne!(c.id, b.id);
}

#[tokio::test]
async fn tool_round_trip() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_completion(&[("call_1", "echo", r#"{"s":"hi"}"#)])),
        Ok(text_completion("done")),
    ]));
    let store = store_with(provider);
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();
    let next = store
        .advance(&agent, "echo hi", Some(&gateway), &TurnOptions::default())
        .await
        .unwrap();

    let messages = store.messages(&next).await.unwrap();
    assert_eq!(messages.len(), 4);

    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content.as_deref(), Some("echo hi"));

    assert_eq!(messages[1].role, MessageRole::Assistant);
    let calls = messages[1].tool_calls.as_ref().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "echo");
    assert_eq!(calls[0].arguments, r#"{"s":"hi"}"#);

    assert_eq!(messages[2].role, MessageRole::Tool);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(messages[2].content.as_deref(), Some("hi"));

    assert_eq!(messages[3].role, MessageRole::Assistant);
    assert_eq!(messages[3].content.as_deref(), Some("done"));
}

#[tokio::test]
async fn tool_fan_out_is_concurrent_and_ordered() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_completion(&[
            ("call_a", "slow", r#"{"tag":"a"}"#),
            ("call_b", "slow", r#"{"tag":"b"}"#),
        ])),
        Ok(text_completion("done")),
    ]));
    let store = store_with(provider);
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();

    let started = Instant::now();
    let next = store
        .advance(&agent, "run both", Some(&gateway), &TurnOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Two 100ms tools executed concurrently, not back to back.
    assert!(
        elapsed < Duration::from_millis(180),
        "fan-out took {elapsed:?}, expected concurrent execution"
    );

    // Results are appended in the assistant's call order.
    let messages = store.messages(&next).await.unwrap();
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(messages[2].content.as_deref(), Some("a"));
    assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_b"));
    assert_eq!(messages[3].content.as_deref(), Some("b"));
}

#[tokio::test]
async fn tool_failure_is_fed_back_not_fatal() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_completion(&[("call_1", "boom", "{}")])),
        Ok(text_completion("recovered")),
    ]));
    let store = store_with(provider);
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();
    let next = store
        .advance(&agent, "try it", Some(&gateway), &TurnOptions::default())
        .await
        .unwrap();

    let messages = store.messages(&next).await.unwrap();
    assert_eq!(messages[2].role, MessageRole::Tool);
    let text = messages[2].content.as_deref().unwrap();
    assert!(text.starts_with("Error:"), "got {text:?}");
    assert!(text.contains("boom"));
    // The model observed the failure and the turn still completed.
    assert_eq!(messages[3].content.as_deref(), Some("recovered"));
}

#[tokio::test]
async fn unknown_tool_result_is_data() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_completion(&[("call_1", "nonexistent", "{}")])),
        Ok(text_completion("noted")),
    ]));
    let store = store_with(provider);
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();
    let next = store
        .advance(&agent, "call something", Some(&gateway), &TurnOptions::default())
        .await
        .unwrap();

    let messages = store.messages(&next).await.unwrap();
    assert_eq!(
        messages[2].content.as_deref(),
        Some("Error: Unknown tool 'nonexistent'")
    );
}

#[tokio::test]
async fn round_cap_stops_the_loop() {
    // The model keeps asking for tools; the cap cuts it off after two
    // rounds without a closing text message.
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tool_call_completion(&[("call_1", "echo", r#"{"s":"x"}"#)])),
        Ok(tool_call_completion(&[("call_2", "echo", r#"{"s":"y"}"#)])),
        Ok(tool_call_completion(&[("call_3", "echo", r#"{"s":"z"}"#)])),
    ]));
    let store = store_with(provider.clone());
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();
    let next = store
        .advance(
            &agent,
            "loop forever",
            Some(&gateway),
            &TurnOptions::default().with_max_tool_rounds(2),
        )
        .await
        .unwrap();

    assert_eq!(provider.request_count(), 2);
    // user + 2 * (assistant + tool result)
    let messages = store.messages(&next).await.unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[4].role, MessageRole::Tool);
}

#[tokio::test]
async fn per_call_overrides_overlay_agent_config() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 1));
    let store = store_with(provider.clone());

    let mut config = Map::new();
    config.insert("temperature".into(), json!(0.5));
    config.insert("max_tokens".into(), json!(100));
    let agent = store
        .create_agent(spec().with_model_config(config.clone()))
        .await
        .unwrap();

    let next = store
        .advance(
            &agent,
            "hi",
            None,
            &TurnOptions::default().with_temperature(0.9).with_top_p(0.8),
        )
        .await
        .unwrap();

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    // Overridden for the call...
    assert_eq!(requests[0].options["temperature"], json!(0.9));
    assert_eq!(requests[0].options["top_p"], json!(0.8));
    // ...while untouched keys pass through...
    assert_eq!(requests[0].options["max_tokens"], json!(100));
    // ...and the evolved agent inherits the original config.
    assert_eq!(next.model_config, config);
}

#[tokio::test]
async fn system_prompt_and_tools_are_forwarded() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 1));
    let store = store_with(provider.clone());
    let gateway = MockGateway;

    let agent = store.create_agent(spec()).await.unwrap();
    store
        .advance(&agent, "hi", Some(&gateway), &TurnOptions::default())
        .await
        .unwrap();

    let requests = provider.requests.lock().unwrap();
    let request = &requests[0];
    assert_eq!(request.model, "claude-3-5-haiku");
    assert_eq!(request.messages[0].role, "system");
    assert_eq!(
        request.messages[0].content.as_deref(),
        Some("You are a calculator.")
    );
    assert_eq!(request.messages[1].role, "user");
    assert!(!request.stream);

    let tools = request.tools.as_ref().unwrap();
    assert_eq!(tools.len(), 3);
}

#[tokio::test]
async fn failed_turn_persists_nothing() {
    let provider = Arc::new(ScriptedProvider::new(vec![Err(Error::api(
        400,
        "bad request",
    ))]));
    let store = store_with(provider);

    let agent = store.create_agent(spec()).await.unwrap();
    let err = store
        .advance(&agent, "hi", None, &TurnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Llm(_)));

    // The parent is unchanged and no new agent appeared.
    assert_eq!(store.count_agents(None).await.unwrap(), 1);
    let reloaded = store.load_agent(agent.id).await.unwrap();
    assert_eq!(reloaded.conversation_id, agent.conversation_id);
    assert!(store.messages(&reloaded).await.unwrap().is_empty());
}

#[tokio::test]
async fn advances_from_same_parent_are_siblings() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 2));
    let store = store_with(provider);

    let parent = store.create_agent(spec()).await.unwrap();
    let left = store
        .advance(&parent, "go left", None, &TurnOptions::default())
        .await
        .unwrap();
    let right = store
        .advance(&parent, "go right", None, &TurnOptions::default())
        .await
        .unwrap();

    assert_eq!(left.parent_id, Some(parent.id));
    assert_eq!(right.parent_id, Some(parent.id));
    assert_ne!(left.conversation_id, right.conversation_id);

    // Disjoint new-message sets: neither sees the other's messages.
    let left_ids: Vec<_> = store
        .messages(&left)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    let right_ids: Vec<_> = store
        .messages(&right)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert!(left_ids.iter().all(|id| !right_ids.contains(id)));
}

#[tokio::test]
async fn transcript_prefix_property() {
    let provider = Arc::new(ScriptedProvider::always_text("ok", 2));
    let store = store_with(provider);

    let a1 = store.create_agent(spec()).await.unwrap();
    let a2 = store
        .advance(&a1, "one", None, &TurnOptions::default())
        .await
        .unwrap();
    let a3 = store
        .advance(&a2, "two", None, &TurnOptions::default())
        .await
        .unwrap();

    let c2 = store.conversation(&a2).await.unwrap();
    let c3 = store.conversation(&a3).await.unwrap();
    assert!(c3.message_ids.len() > c2.message_ids.len());
    assert_eq!(&c3.message_ids[..c2.message_ids.len()], &c2.message_ids[..]);
}

#[tokio::test]
async fn token_usage_sums_assistant_messages() {
    // Each scripted completion reports 10 in / 5 out.
    let provider = Arc::new(ScriptedProvider::always_text("ok", 2));
    let store = store_with(provider);

    let a1 = store.create_agent(spec()).await.unwrap();
    let a2 = store
        .advance(&a1, "one", None, &TurnOptions::default())
        .await
        .unwrap();
    let a3 = store
        .advance(&a2, "two", None, &TurnOptions::default())
        .await
        .unwrap();

    let usage = store.token_usage(&a3).await.unwrap();
    assert_eq!(usage.input_tokens, 20);
    assert_eq!(usage.output_tokens, 10);

    // The earlier version only saw one turn.
    let usage = store.token_usage(&a2).await.unwrap();
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.output_tokens, 5);
}
