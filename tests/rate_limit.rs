// End-to-end behavior of the broker + retry wrapper under contention: a
// denied call waits out the window and then succeeds, and the window never
// leaks locked tokens.

use mockito::Matcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use call_insights_rs::broker::TokenBudgetBroker;
use call_insights_rs::config::LlmConfig;
use call_insights_rs::llm::LlmClient;
use call_insights_rs::token_client::TokenClient;

fn llm_config(endpoint: &str) -> LlmConfig {
    LlmConfig {
        endpoint: endpoint.to_string(),
        deployment: "gpt-4".to_string(),
        api_version: "2024-02-01".to_string(),
        api_key: "test-key".to_string(),
        max_tokens: 50,
        temperature: 0.0,
    }
}

fn completion_body() -> String {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": "classified"}}],
        // actual usage nearly fills the 100-token window
        "usage": {"prompt_tokens": 50, "completion_tokens": 45}
    })
    .to_string()
}

#[tokio::test]
async fn denied_call_recovers_after_the_window_resets() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/openai/deployments/gpt-4/chat/completions")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(completion_body())
        .expect_at_least(2)
        .create_async()
        .await;

    // 100-token ceiling with a one-second window so the test can wait it out
    let broker = Arc::new(TokenBudgetBroker::with_timing(
        100,
        Duration::from_secs(1),
        Duration::from_secs(300),
    ));
    let client_a = LlmClient::new(
        llm_config(&server.url()),
        TokenClient::new("app_a", Arc::clone(&broker)),
        5,
    );
    let client_b = LlmClient::new(
        llm_config(&server.url()),
        TokenClient::new("app_b", Arc::clone(&broker)),
        5,
    );

    let variables: HashMap<String, String> =
        [("text".to_string(), "hello".to_string())].into_iter().collect();

    let started = Instant::now();
    let (first, second) = tokio::join!(
        client_a.send_prompt("classify", "input: {text}", &variables, &[]),
        client_b.send_prompt("classify", "input: {text}", &variables, &[]),
    );

    // both eventually succeed; the loser waited at least one window
    assert_eq!(first.unwrap(), "classified");
    assert_eq!(second.unwrap(), "classified");
    assert!(started.elapsed() >= Duration::from_secs(1));

    // no leaked reservations after quiescence
    assert_eq!(broker.status().locked_tokens, 0);
}

#[tokio::test]
async fn serial_denial_reports_the_reset_hint() {
    let broker = Arc::new(TokenBudgetBroker::new(100));
    let client = TokenClient::new("app", Arc::clone(&broker));

    let first = client.lock_tokens(60);
    assert!(first.allowed);

    let denied = client.lock_tokens(60);
    assert!(!denied.allowed);
    assert_eq!(denied.reason.as_deref(), Some("rate_limit_exceeded"));
    assert!(denied.reset_seconds <= 60);

    // release the winner: the window is usable again without a reset
    assert!(client.release_tokens(&first.request_id.unwrap()));
    assert!(client.lock_tokens(60).allowed);
}
