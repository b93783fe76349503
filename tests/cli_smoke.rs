use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 2, "completion_tokens": 3 }
    }))
}

fn gateway_command(base_url: &str) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_llm-gateway"));
    cmd.env_remove("LLM_GATEWAY_API_KEY")
        .env("LLM_GATEWAY_API_KEYS", "sk-one,sk-two")
        .env("LLM_GATEWAY_BASE_URL", base_url)
        .env("LLM_GATEWAY_GLOBAL_SPACING_MS", "0")
        .env("LLM_GATEWAY_KEY_SPACING_MS", "0")
        .env("RUST_LOG", "warn");
    cmd
}

async fn run(mut cmd: Command) -> Output {
    tokio::task::spawn_blocking(move || cmd.output().expect("failed to run llm-gateway"))
        .await
        .unwrap()
}

#[tokio::test]
async fn complete_prints_response_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(reply("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let mut cmd = gateway_command(&server.uri());
    cmd.args(["complete", "--model", "gpt-4o-mini", "--prompt", "ping"]);
    let output = run(cmd).await;

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let resp: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(resp["text"], "pong");
    assert_eq!(resp["usage"]["total_tokens"], 5);
}

#[tokio::test]
async fn batch_writes_one_line_per_prompt_in_order() {
    let server = MockServer::start().await;
    for word in ["alpha", "beta", "gamma"] {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains(word))
            .respond_with(reply(&format!("{word}!")))
            .mount(&server)
            .await;
    }

    let dir = tempdir().unwrap();
    let input = dir.path().join("prompts.jsonl");
    let out = dir.path().join("results.jsonl");
    std::fs::write(
        &input,
        concat!(
            r#"{"id": "a", "prompt": "say alpha"}"#,
            "\n",
            r#"{"id": "b", "prompt": "say beta", "system": "be loud"}"#,
            "\n\n",
            r#"{"prompt": "say gamma"}"#,
            "\n",
        ),
    )
    .unwrap();

    let mut cmd = gateway_command(&server.uri());
    cmd.arg("batch")
        .arg("--input")
        .arg(&input)
        .arg("--out")
        .arg(&out)
        .args(["--model", "gpt-4o-mini", "--concurrency", "2"]);
    let output = run(cmd).await;
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {stderr}");

    let lines: Vec<Value> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["id"], "a");
    assert_eq!(lines[0]["text"], "alpha!");
    assert_eq!(lines[1]["id"], "b");
    assert_eq!(lines[1]["text"], "beta!");
    assert_eq!(lines[2]["index"], 2);
    assert_eq!(lines[2]["text"], "gamma!");
    assert!(lines.iter().all(|l| l["ok"] == true));

    assert!(stderr.contains(r#""succeeded":3"#));
    assert!(stderr.contains("key-1"));
    assert!(!stderr.contains("sk-one"));
}

#[test]
fn missing_credentials_fail_fast() {
    let output = Command::new(env!("CARGO_BIN_EXE_llm-gateway"))
        .env_remove("LLM_GATEWAY_API_KEY")
        .env_remove("LLM_GATEWAY_API_KEYS")
        .args(["complete", "--model", "m", "--prompt", "p"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("LLM_GATEWAY_API_KEYS"));
}
