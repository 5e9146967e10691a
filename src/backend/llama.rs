//! llama.cpp chat-completion backends.
//!
//! Two shapes exist for the same engine. `CliBackend` drives the one-shot
//! `llama-cli` binary and is the streaming-capable variant. `ServerBackend`
//! keeps a `llama-server` sidecar alive on a fixed port and talks to its
//! OpenAI-style chat endpoint. One of the two is registered per process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Backend, Executor, Request, Response, ResponseMetadata, ServerConfig, ServerManager,
    StreamChunk, StreamingBackend, PROVIDER_LLAMA_CPP,
};
use crate::error::{Error, Result};
use crate::params;

/// Default port for the llama-server sidecar.
pub const SERVER_PORT: u16 = 8081;

const CLI_TIMEOUT: Duration = Duration::from_secs(60);
const SERVER_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Constrains CLI output to a `{"response": "..."}` object.
const DEFAULT_JSON_SCHEMA: &str =
    r#"{"type":"object","properties":{"response":{"type":"string"}},"required":["response"]}"#;

// ============================================================================
// CLI-shaped backend
// ============================================================================

/// One-shot `llama-cli` backend; the streaming-capable shape.
pub struct CliBackend {
    executor: Executor,
}

impl CliBackend {
    pub fn new(bin_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            executor: Executor::new(bin_path, CLI_TIMEOUT)?,
        })
    }

    fn build_args(req: &Request) -> Vec<String> {
        let p = &req.parameters;
        let mut args = vec!["--model".to_string(), req.model_path.clone()];

        if let Some(system_prompt) = params::get_opt::<String>(p, "system_prompt") {
            args.push("--system-prompt".to_string());
            args.push(system_prompt);
        }

        args.push("--ctx-size".to_string());
        args.push(params::get(p, "n_ctx", 4096i64).to_string());
        args.push("-n".to_string());
        args.push(params::get(p, "n_predict", 128i64).to_string());
        args.push("-ngl".to_string());
        args.push(params::get(p, "n_gpu_layers", -1i64).to_string());
        args.push("--temp".to_string());
        args.push(format!("{:.2}", params::get(p, "temperature", 0.7f64)));
        args.push("--top-p".to_string());
        args.push(format!("{:.2}", params::get(p, "top_p", 0.9f64)));
        args.push("--top-k".to_string());
        args.push(params::get(p, "top_k", 40i64).to_string());
        args.push("--min-p".to_string());
        args.push(format!("{:.2}", params::get(p, "min_p", 0.05f64)));
        args.push("--repeat-penalty".to_string());
        args.push(format!("{:.2}", params::get(p, "repeat_penalty", 1.1f64)));

        if let Some(v) = params::get_opt::<f64>(p, "presence_penalty") {
            args.push("--presence-penalty".to_string());
            args.push(format!("{v:.2}"));
        }
        if let Some(v) = params::get_opt::<f64>(p, "frequency_penalty") {
            args.push("--frequency-penalty".to_string());
            args.push(format!("{v:.2}"));
        }

        let schema =
            params::get(p, "json_schema", DEFAULT_JSON_SCHEMA.to_string());
        args.push("-j".to_string());
        args.push(schema);

        // Single-turn conversation against the chat template, no prompt echo.
        args.push("--no-warmup".to_string());
        args.push("--jinja".to_string());
        args.push("-cnv".to_string());
        args.push("-st".to_string());
        args.push("--no-display-prompt".to_string());

        args
    }

    /// Extract the `response` field from the outermost JSON object in the
    /// CLI output. Malformed output yields empty text, not an error.
    fn parse_output(output: &str) -> String {
        let Some(start) = output.find('{') else {
            return String::new();
        };
        let Some(end) = output.rfind('}') else {
            return String::new();
        };
        if start >= end {
            return String::new();
        }

        match serde_json::from_str::<serde_json::Value>(&output[start..=end]) {
            Ok(value) => value
                .get("response")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn provider(&self) -> &'static str {
        PROVIDER_LLAMA_CPP
    }

    async fn infer(&self, cancel: &CancellationToken, req: Request) -> Result<Response> {
        let mut args = Self::build_args(&req);
        let prompt = String::from_utf8_lossy(&req.input).into_owned();
        args.push("--prompt".to_string());
        args.push(prompt);

        let started = Instant::now();
        let out = self.executor.execute(cancel, &args, None).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        let text = Self::parse_output(&stdout);

        let mut metadata =
            ResponseMetadata::new(self.provider(), &req.model_path, elapsed, text.len() as u64);
        metadata.backend_specific.insert("stdout".into(), json!(stdout));
        metadata.backend_specific.insert("stderr".into(), json!(stderr));
        metadata
            .backend_specific
            .insert("args".into(), json!(args.join(" ")));

        Ok(Response {
            output: text.into_bytes(),
            metadata,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_streaming(self: Arc<Self>) -> Option<Arc<dyn StreamingBackend>> {
        Some(self)
    }
}

#[async_trait]
impl StreamingBackend for CliBackend {
    async fn infer_stream(
        &self,
        cancel: &CancellationToken,
        req: Request,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let mut args = Self::build_args(&req);
        let prompt = String::from_utf8_lossy(&req.input).into_owned();
        args.push("--prompt".to_string());
        args.push(prompt);

        self.executor.stream(cancel, &args, None).await
    }
}

// ============================================================================
// Sidecar-shaped backend
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessage>,
    temperature: f64,
    top_k: i64,
    top_p: f64,
    min_p: f64,
    n_predict: i64,
    repeat_penalty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Choice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// `llama-server` sidecar backend.
pub struct ServerBackend {
    manager: Arc<ServerManager>,
    client: reqwest::Client,
    bin_path: PathBuf,
    port: u16,
}

impl ServerBackend {
    pub fn new(bin_path: impl Into<PathBuf>, manager: Arc<ServerManager>) -> Self {
        Self::with_port(bin_path, manager, SERVER_PORT)
    }

    pub(crate) fn with_port(
        bin_path: impl Into<PathBuf>,
        manager: Arc<ServerManager>,
        port: u16,
    ) -> Self {
        Self {
            manager,
            client: reqwest::Client::builder()
                .timeout(SERVER_CLIENT_TIMEOUT)
                .build()
                .expect("chat client construction cannot fail"),
            bin_path: bin_path.into(),
            port,
        }
    }

    fn build_chat_request(req: &Request, prompt: &str) -> ChatCompletionRequest {
        let p = &req.parameters;

        let mut messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        if let Some(system_prompt) = params::get_opt::<String>(p, "system_prompt") {
            if !system_prompt.is_empty() {
                messages.insert(
                    0,
                    ChatMessage {
                        role: "system".to_string(),
                        content: system_prompt,
                    },
                );
            }
        }

        ChatCompletionRequest {
            messages,
            temperature: params::get(p, "temperature", 0.7),
            top_k: params::get(p, "top_k", 40),
            top_p: params::get(p, "top_p", 0.9),
            min_p: params::get(p, "min_p", 0.05),
            n_predict: params::get(p, "n_predict", 128),
            repeat_penalty: params::get(p, "repeat_penalty", 1.1),
            presence_penalty: params::get_opt(p, "presence_penalty"),
            frequency_penalty: params::get_opt(p, "frequency_penalty"),
        }
    }
}

#[async_trait]
impl Backend for ServerBackend {
    fn provider(&self) -> &'static str {
        PROVIDER_LLAMA_CPP
    }

    async fn infer(&self, _cancel: &CancellationToken, req: Request) -> Result<Response> {
        let args = vec![
            "--model".to_string(),
            req.model_path.clone(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];

        self.manager
            .start_server(ServerConfig::new(
                self.provider(),
                &self.bin_path,
                args,
                self.port,
            ))
            .await?;

        let prompt = String::from_utf8_lossy(&req.input).into_owned();
        let body = Self::build_chat_request(&req, &prompt);

        let started = Instant::now();
        let resp = self
            .client
            .post(format!("http://localhost:{}/v1/chat/completions", self.port))
            .json(&body)
            .send()
            .await?;
        let elapsed = started.elapsed().as_secs_f64();

        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Execution(format!(
                "request failed with status code {status}: {body}"
            )));
        }

        let completion: ChatCompletionResponse = resp.json().await?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        let mut metadata = ResponseMetadata::new(
            self.provider(),
            &req.model_path,
            elapsed,
            content.len() as u64,
        );
        if let Ok(value) = serde_json::to_value(&completion) {
            metadata.backend_specific.insert("response".into(), value);
        }

        Ok(Response {
            output: content.into_bytes(),
            metadata,
        })
    }

    async fn close(&self) -> Result<()> {
        match self.manager.stop_server(self.provider(), self.port).await {
            Err(Error::ServerNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn request(params: &[(&str, serde_json::Value)]) -> Request {
        Request {
            model_path: "/models/qwen.gguf".to_string(),
            input: b"hello".to_vec(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn build_args_applies_defaults() {
        let args = CliBackend::build_args(&request(&[]));

        assert_eq!(arg_value(&args, "--model"), Some("/models/qwen.gguf"));
        assert_eq!(arg_value(&args, "--ctx-size"), Some("4096"));
        assert_eq!(arg_value(&args, "-n"), Some("128"));
        assert_eq!(arg_value(&args, "-ngl"), Some("-1"));
        assert_eq!(arg_value(&args, "--temp"), Some("0.70"));
        assert_eq!(arg_value(&args, "--top-p"), Some("0.90"));
        assert_eq!(arg_value(&args, "--top-k"), Some("40"));
        assert_eq!(arg_value(&args, "--min-p"), Some("0.05"));
        assert_eq!(arg_value(&args, "--repeat-penalty"), Some("1.10"));
        assert_eq!(arg_value(&args, "-j"), Some(DEFAULT_JSON_SCHEMA));
        assert!(args.contains(&"--no-display-prompt".to_string()));
        assert!(!args.contains(&"--presence-penalty".to_string()));
    }

    #[test]
    fn build_args_coerces_float_parameters_to_integer_flags() {
        let args = CliBackend::build_args(&request(&[
            ("n_ctx", json!(1024.0)),
            ("n_predict", json!(50.0)),
            ("temperature", json!(1)),
        ]));

        assert_eq!(arg_value(&args, "--ctx-size"), Some("1024"));
        assert_eq!(arg_value(&args, "-n"), Some("50"));
        assert_eq!(arg_value(&args, "--temp"), Some("1.00"));
    }

    #[test]
    fn build_args_includes_system_prompt_and_penalties_when_set() {
        let args = CliBackend::build_args(&request(&[
            ("system_prompt", json!("be brief")),
            ("presence_penalty", json!(0.5)),
            ("frequency_penalty", json!(0.25)),
        ]));

        assert_eq!(arg_value(&args, "--system-prompt"), Some("be brief"));
        assert_eq!(arg_value(&args, "--presence-penalty"), Some("0.50"));
        assert_eq!(arg_value(&args, "--frequency-penalty"), Some("0.25"));
    }

    #[test]
    fn parse_output_extracts_response_field() {
        let text = CliBackend::parse_output(
            "llama init noise\n{\"response\":\"hello there\"}\ntrailing",
        );
        assert_eq!(text, "hello there");
    }

    #[test]
    fn parse_output_handles_malformed_output() {
        assert_eq!(CliBackend::parse_output("no json here"), "");
        assert_eq!(CliBackend::parse_output("{not valid json}"), "");
        assert_eq!(CliBackend::parse_output("}{"), "");
        assert_eq!(CliBackend::parse_output("{\"other\":1}"), "");
    }

    #[test]
    fn chat_request_applies_sampling_defaults() {
        let body = ServerBackend::build_chat_request(&request(&[]), "hi");

        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.temperature, 0.7);
        assert_eq!(body.top_k, 40);
        assert_eq!(body.top_p, 0.9);
        assert_eq!(body.min_p, 0.05);
        assert_eq!(body.n_predict, 128);
        assert_eq!(body.repeat_penalty, 1.1);
        assert!(body.presence_penalty.is_none());
    }

    #[test]
    fn chat_request_prepends_system_message() {
        let body = ServerBackend::build_chat_request(
            &request(&[("system_prompt", json!("you are terse"))]),
            "hi",
        );

        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[0].content, "you are terse");
        assert_eq!(body.messages[1].role, "user");
    }

    #[cfg(unix)]
    mod sidecar {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        /// A stand-in server binary that ignores its argv and stays alive.
        fn fake_server_binary(dir: &tempfile::TempDir) -> std::path::PathBuf {
            let path = dir.path().join("fake-llama-server");
            std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn infer_posts_chat_request_to_sidecar() {
            let mock = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/health"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&mock)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{
                        "message": {"role": "assistant", "content": "hello from sidecar"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
                })))
                .mount(&mock)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let manager = Arc::new(ServerManager::new());
            let backend = ServerBackend::with_port(
                fake_server_binary(&dir),
                manager.clone(),
                mock.address().port(),
            );

            let resp = backend
                .infer(&CancellationToken::new(), request(&[]))
                .await
                .unwrap();

            assert_eq!(resp.output, b"hello from sidecar");
            assert_eq!(resp.metadata.provider, PROVIDER_LLAMA_CPP);
            assert!(manager
                .is_running(PROVIDER_LLAMA_CPP, mock.address().port())
                .await);

            backend.close().await.unwrap();
            assert!(!manager
                .is_running(PROVIDER_LLAMA_CPP, mock.address().port())
                .await);
        }

        #[tokio::test]
        async fn infer_surfaces_non_200_bodies() {
            let mock = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/health"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&mock)
                .await;
            Mock::given(method("POST"))
                .and(path("/v1/chat/completions"))
                .respond_with(ResponseTemplate::new(500).set_body_string("model exploded"))
                .mount(&mock)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let manager = Arc::new(ServerManager::new());
            let backend = ServerBackend::with_port(
                fake_server_binary(&dir),
                manager,
                mock.address().port(),
            );

            let err = backend
                .infer(&CancellationToken::new(), request(&[]))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("model exploded"), "{err}");
        }

        #[tokio::test]
        async fn close_without_started_server_is_a_no_op() {
            let dir = tempfile::tempdir().unwrap();
            let manager = Arc::new(ServerManager::new());
            let backend = ServerBackend::with_port(fake_server_binary(&dir), manager, 1);

            backend.close().await.unwrap();
        }
    }
}
