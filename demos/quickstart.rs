//! Minimal end-to-end example for `llm-gateway`.
//!
//! Fans three prompts out through the gateway (one of them twice, to show
//! coalescing and the cache), then prints each answer and the credential
//! pool's health.
//!
//! To run:
//! - Set `LLM_GATEWAY_API_KEYS` (comma-separated) or `LLM_GATEWAY_API_KEY`
//! - Optionally set `LLM_GATEWAY_BASE_URL` for any OpenAI-compatible endpoint
//! - `cargo run --example quickstart`

use std::sync::Arc;

use llm_gateway::{
    Attribution, BatchSummary, BoundedExecutor, ChatGateway, CompletionRequest, Message,
    RequestGateway, StderrUsageSink,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // -- Infrastructure setup ------------------------------------------------

    // StderrUsageSink prints one JSON record per attempt; swap in
    // NoopUsageSink to silence it.
    let gateway = RequestGateway::from_env(Arc::new(StderrUsageSink))?;
    let chat: Arc<dyn ChatGateway> = Arc::new(gateway.clone());

    // -- The actual requests ---------------------------------------------------

    let prompts = [
        "Name one prime number larger than 100.",
        "Summarize the CAP theorem in one sentence.",
        "Name one prime number larger than 100.", // same as the first: one network call
    ];

    let tasks = prompts.iter().map(|prompt| {
        let chat = chat.clone();
        let req = CompletionRequest::new(
            "gpt-4o-mini",
            vec![
                Message::system("Answer in one short sentence."),
                Message::user(*prompt),
            ],
            Attribution::new("quickstart"),
        )
        .max_output_tokens(128);
        move || async move { chat.chat(req).await }
    });

    // Two at a time; the gateway still spaces dispatches on its own.
    let results = BoundedExecutor::execute(tasks, 2).await;

    // -- Output ----------------------------------------------------------------

    for (prompt, result) in prompts.iter().zip(&results) {
        match result {
            Ok(resp) => println!(
                "{prompt}\n  -> {} ({} tokens)",
                resp.text.trim(),
                resp.usage.total_tokens
            ),
            Err(err) => println!("{prompt}\n  !! {err}"),
        }
    }

    let summary = BatchSummary::from_results(&results);
    println!("\n{}/{} succeeded", summary.succeeded, summary.total);
    println!("cache: {:?}", gateway.cache().stats());
    println!("{}", serde_json::to_string_pretty(&gateway.pool().snapshot())?);

    Ok(())
}
