//! Chat-completions translation engine (OpenAI-compatible, e.g. DeepSeek).
//! Connection pooling via reqwest, simple token-bucket rate limiting,
//! retry on 429/5xx/timeout. The model is asked for a JSON `{text, parts}` reply.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{EngineRequest, EngineResponse, TranslationEngine};
use crate::config::EngineConfig;
use crate::error::EngineError;

pub struct ChatEngine {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    name: String,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
    max_retries: u32,
}

impl ChatEngine {
    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            EngineError::Config(format!("{} environment variable not set", config.api_key_env))
        })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &EngineConfig, api_key: String) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout())
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            name: config.name.clone(),
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: config.min_interval(),
            max_retries: config.max_retries,
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// 429: Retry-After or 1s/2s/4s. 5xx: exponential backoff. Timeout: one retry.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, EngineError> {
        let mut attempt: u32 = 0;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    let wait = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt.min(5)));
                    if attempt >= self.max_retries {
                        return Err(EngineError::RateLimited {
                            retry_after_ms: wait.as_millis() as u64,
                        });
                    }
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::Status {
                            status: resp.status().as_u16(),
                            body: String::new(),
                        });
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt.min(5)));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(EngineError::Status {
                        status,
                        body: body_text.chars().take(200).collect(),
                    });
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(EngineError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(EngineError::Http(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl TranslationEngine for ChatEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        self.rate_limit_wait().await;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(request)}
            ],
            "response_format": {"type": "json_object"},
            "stream": false,
            "temperature": 0.1
        });

        let start = Instant::now();
        let response = self.send_with_retry(&body).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| EngineError::Malformed(format!("completion body: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::Malformed("no message content".into()))?;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            tokens = completion.usage.map(|u| u.total_tokens).unwrap_or(0),
            "engine replied"
        );
        parse_reply(&content)
    }
}

// --- Prompt construction ---

const SYSTEM_PROMPT: &str = "You are a translator. The user sends JSON with `text`, `mapping`, \
`locale`, `formality` and optional `options`. Translate into `locale` using the given formality. \
If `mapping` is non-empty it wraps each segment of `text` as <id>segment</id>: translate every \
segment and reply {\"text\": <full translation>, \"parts\": {<id>: <translated segment>}}, where \
`text` is the concatenation of the parts in order. Segments escape `&`, `<` and `>` as \
&amp; &lt; &gt;; reply with unescaped text. If `mapping` is empty reply \
{\"text\": <translation>, \"parts\": {}}. Reply with JSON only.";

fn build_user_prompt(request: &EngineRequest) -> String {
    let spec = request.output.canonical();
    serde_json::json!({
        "text": request.flat_text,
        "mapping": request.path_mapping,
        "locale": spec.locale,
        "formality": spec.formality.as_str(),
        "options": request.output.extra,
    })
    .to_string()
}

/// Extract the `{text, parts}` object, tolerating markdown code fences or
/// chatter around it.
fn parse_reply(content: &str) -> Result<EngineResponse, EngineError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(EngineError::Malformed(format!(
                "no JSON object in reply: {}",
                content.chars().take(80).collect::<String>()
            )))
        }
    };
    let reply: RawReply =
        serde_json::from_str(json).map_err(|e| EngineError::Malformed(e.to_string()))?;
    Ok(EngineResponse {
        text: reply.text,
        parts: reply.parts.unwrap_or_default(),
    })
}

// --- Response types ---

#[derive(Deserialize)]
struct RawReply {
    text: String,
    parts: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::translate::key::{Formality, OutputSpec};

    /// Serves `responses` in order, one per connection, then stops accepting.
    async fn scripted_server(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                return;
            }
        }
    }

    fn http(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {status}\r\n");
        for (name, value) in headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ));
        out
    }

    fn completion(reply: &str) -> String {
        let body = serde_json::json!({
            "choices": [{"message": {"content": reply}}],
            "usage": {"total_tokens": 7}
        });
        http("200 OK", &[], &body.to_string())
    }

    fn engine_at(base_url: &str, max_retries: u32) -> ChatEngine {
        let config = EngineConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            min_interval_ms: 0,
            max_retries,
            ..EngineConfig::default()
        };
        ChatEngine::new(&config, "test-key".into()).unwrap()
    }

    fn hello() -> EngineRequest {
        EngineRequest {
            flat_text: "Hello".into(),
            path_mapping: String::new(),
            output: OutputSpec::for_locale("de"),
        }
    }

    const HALLO: &str = "{\"text\": \"Hallo\", \"parts\": {}}";

    #[tokio::test]
    async fn rate_limit_with_retry_after_then_success() {
        let (url, hits) = scripted_server(vec![
            http("429 Too Many Requests", &[("Retry-After", "0")], ""),
            completion(HALLO),
        ])
        .await;
        let reply = engine_at(&url, 2).translate(&hello()).await.unwrap();
        assert_eq!(reply.text, "Hallo");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_error_is_retried_after_backoff() {
        let (url, hits) = scripted_server(vec![
            http("503 Service Unavailable", &[], ""),
            completion(HALLO),
        ])
        .await;
        let start = Instant::now();
        let reply = engine_at(&url, 1).translate(&hello()).await.unwrap();
        assert_eq!(reply.text, "Hallo");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rate_limit_gives_up_after_max_retries() {
        let (url, hits) = scripted_server(vec![
            http("429 Too Many Requests", &[("Retry-After", "0")], ""),
            http("429 Too Many Requests", &[("Retry-After", "0")], ""),
        ])
        .await;
        let err = engine_at(&url, 1).translate(&hello()).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { retry_after_ms: 0 }));
        assert_eq!(err.code(), "ENGINE_RATE_LIMITED");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_error_gives_up_with_status() {
        let (url, _) = scripted_server(vec![http("502 Bad Gateway", &[], "")]).await;
        let err = engine_at(&url, 0).translate(&hello()).await.unwrap_err();
        assert!(matches!(err, EngineError::Status { status: 502, .. }));
        assert_eq!(err.code(), "ENGINE_HTTP");
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let (url, hits) = scripted_server(vec![
            http("401 Unauthorized", &[], "{\"error\": \"bad key\"}"),
            completion(HALLO),
        ])
        .await;
        let err = engine_at(&url, 3).translate(&hello()).await.unwrap_err();
        match err {
            EngineError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_json_completion_body_is_malformed() {
        let (url, _) =
            scripted_server(vec![http("200 OK", &[], "<html>gateway</html>")]).await;
        let err = engine_at(&url, 0).translate(&hello()).await.unwrap_err();
        assert_eq!(err.code(), "ENGINE_MALFORMED");
    }

    #[tokio::test]
    async fn completion_without_content_is_malformed() {
        let body = serde_json::json!({"choices": []}).to_string();
        let (url, _) = scripted_server(vec![http("200 OK", &[], &body)]).await;
        let err = engine_at(&url, 0).translate(&hello()).await.unwrap_err();
        assert!(matches!(err, EngineError::Malformed(_)));
    }

    #[test]
    fn prompt_carries_canonical_spec_and_options() {
        let request = EngineRequest {
            flat_text: "Hello \"world\"".into(),
            path_mapping: "<0>Hello \"world\"</0>".into(),
            output: OutputSpec::for_locale("de-ch")
                .with_formality(Formality::Informal)
                .with_extra("domain", serde_json::json!("legal")),
        };
        let prompt: serde_json::Value = serde_json::from_str(&build_user_prompt(&request)).unwrap();
        assert_eq!(prompt["text"], "Hello \"world\"");
        assert_eq!(prompt["locale"], "de-CH");
        assert_eq!(prompt["formality"], "informal");
        assert_eq!(prompt["options"]["domain"], "legal");
    }

    #[test]
    fn reply_inside_code_fence_parses() {
        let reply = "```json\n{\"text\": \"Bonjour monde\", \"parts\": {\"0\": \"Bonjour \", \"1\": \"monde\"}}\n```";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.text, "Bonjour monde");
        assert_eq!(parsed.parts["1"], "monde");
    }

    #[test]
    fn reply_without_parts_defaults_to_empty() {
        let parsed = parse_reply("{\"text\": \"Hallo\"}").unwrap();
        assert_eq!(parsed.text, "Hallo");
        assert!(parsed.parts.is_empty());
    }

    #[test]
    fn non_json_reply_is_malformed() {
        let err = parse_reply("Sorry, I cannot help with that.").unwrap_err();
        assert_eq!(err.code(), "ENGINE_MALFORMED");
        let err = parse_reply("{\"translation\": \"Hallo\"}").unwrap_err();
        assert_eq!(err.code(), "ENGINE_MALFORMED");
    }

    #[test]
    fn missing_api_key_env_is_config_error() {
        let config = EngineConfig {
            api_key_env: "LINGOCACHE_UNSET_KEY_FOR_TESTS".into(),
            ..EngineConfig::default()
        };
        let err = ChatEngine::from_config(&config).err().expect("missing key");
        assert_eq!(err.code(), "ENGINE_CONFIG");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = EngineConfig {
            base_url: "http://localhost:9000/".into(),
            ..EngineConfig::default()
        };
        let engine = ChatEngine::new(&config, "k".into()).unwrap();
        assert_eq!(engine.base_url, "http://localhost:9000");
        assert_eq!(engine.name(), "deepseek-chat");
    }
}
