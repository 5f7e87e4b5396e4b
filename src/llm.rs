use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";

/// Backend selected by name in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Azure,
    Ollama,
    Groq,
    OpenRouter,
    Command,
}

impl ProviderKind {
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-sonnet-20241022",
            ProviderKind::Google => "gemini-1.5-pro",
            ProviderKind::Azure => "gpt-4",
            ProviderKind::Ollama => "llama3.2",
            ProviderKind::Groq => "llama-3.1-70b-versatile",
            ProviderKind::OpenRouter => "openai/gpt-4o-mini",
            ProviderKind::Command => "",
        }
    }

    /// Conventional environment variable holding the API key, if the
    /// backend needs one.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Google => Some("GOOGLE_API_KEY"),
            ProviderKind::Azure => Some("AZURE_OPENAI_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Ollama | ProviderKind::Command => None,
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com"),
            ProviderKind::Google => Some("https://generativelanguage.googleapis.com"),
            ProviderKind::Ollama => Some("http://localhost:11434/v1"),
            ProviderKind::Groq => Some("https://api.groq.com/openai/v1"),
            ProviderKind::OpenRouter => Some("https://openrouter.ai/api/v1"),
            ProviderKind::Azure | ProviderKind::Command => None,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "azure" => Ok(ProviderKind::Azure),
            "ollama" => Ok(ProviderKind::Ollama),
            "groq" => Ok(ProviderKind::Groq),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "command" => Ok(ProviderKind::Command),
            other => Err(Error::ConfigValidation(format!(
                "unknown provider: {other} (expected: openai, anthropic, google, azure, ollama, groq, openrouter, command)"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Azure => "azure",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Command => "command",
        };
        write!(f, "{name}")
    }
}

pub trait LlmProvider {
    /// Send `prompt` with `context` as standing instructions and return the
    /// model's text.
    fn complete(
        &self,
        prompt: &str,
        context: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// A fully built HTTP call, independent of the backend that built it.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[derive(Clone)]
struct Sampling {
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl Sampling {
    fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Chat completions API shared by OpenAI, Groq, OpenRouter and Ollama.
pub struct ChatCompletionsClient {
    base_url: String,
    api_key: Option<String>,
    sampling: Sampling,
    agent: ureq::Agent,
}

impl ChatCompletionsClient {
    pub fn build_request(&self, prompt: &str, context: &str) -> HttpRequest {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(ref key) = self.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }
        HttpRequest {
            url: format!("{}/chat/completions", self.base_url.trim_end_matches('/')),
            headers,
            body: chat_body(Some(&self.sampling.model), &self.sampling, prompt, context),
        }
    }
}

/// Azure OpenAI deployment; the model name is the deployment name.
pub struct AzureClient {
    endpoint: String,
    api_version: String,
    api_key: String,
    sampling: Sampling,
    agent: ureq::Agent,
}

impl AzureClient {
    pub fn build_request(&self, prompt: &str, context: &str) -> HttpRequest {
        HttpRequest {
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.endpoint.trim_end_matches('/'),
                self.sampling.model,
                self.api_version
            ),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("api-key".to_string(), self.api_key.clone()),
            ],
            body: chat_body(None, &self.sampling, prompt, context),
        }
    }
}

pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    sampling: Sampling,
    agent: ureq::Agent,
}

impl AnthropicClient {
    pub fn build_request(&self, prompt: &str, context: &str) -> HttpRequest {
        let mut body = json!({
            "model": self.sampling.model,
            "max_tokens": self.sampling.max_tokens,
            "temperature": self.sampling.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        if !context.is_empty() {
            body["system"] = json!(context);
        }
        HttpRequest {
            url: format!("{}/v1/messages", self.base_url.trim_end_matches('/')),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("x-api-key".to_string(), self.api_key.clone()),
                (
                    "anthropic-version".to_string(),
                    ANTHROPIC_VERSION.to_string(),
                ),
            ],
            body,
        }
    }
}

/// Google Gemini `generateContent`.
pub struct GeminiClient {
    base_url: String,
    api_key: String,
    sampling: Sampling,
    agent: ureq::Agent,
}

impl GeminiClient {
    pub fn build_request(&self, prompt: &str, context: &str) -> HttpRequest {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.sampling.temperature,
                "maxOutputTokens": self.sampling.max_tokens,
            },
        });
        if !context.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": context}]});
        }
        HttpRequest {
            url: format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url.trim_end_matches('/'),
                self.sampling.model
            ),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("x-goog-api-key".to_string(), self.api_key.clone()),
            ],
            body,
        }
    }
}

/// Pipes the prompt into a local CLI and reads the answer from stdout.
pub struct CommandProvider {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(command: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            args,
            timeout,
        }
    }
}

impl LlmProvider for CommandProvider {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        let stdin = if context.is_empty() {
            prompt.to_string()
        } else {
            format!("{context}\n\n{prompt}")
        };
        let config = ProcessConfig {
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: PathBuf::from("."),
            timeout: Some(self.timeout),
            log_prefix: "llm".to_string(),
            env: vec![],
            stdin_data: Some(stdin),
        };
        let output = spawn_and_stream(config).await?;
        if !output.success() {
            return Err(Error::Provider(format!(
                "'{}' exited with code {}: {}",
                self.command,
                output.exit_code,
                output.stderr_tail(20)
            )));
        }
        Ok(output.stdout())
    }
}

/// One variant per backend, chosen once from configuration.
pub enum AnyProvider {
    ChatCompletions(ChatCompletionsClient),
    Azure(AzureClient),
    Anthropic(AnthropicClient),
    Gemini(GeminiClient),
    Command(CommandProvider),
}

impl AnyProvider {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout);
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let sampling = Sampling::from_config(config);
        let base_url = config
            .base_url
            .clone()
            .or_else(|| config.provider.default_base_url().map(str::to_string));

        let provider = match config.provider {
            ProviderKind::OpenAi
            | ProviderKind::Groq
            | ProviderKind::OpenRouter
            | ProviderKind::Ollama => {
                let api_key = if config.provider.default_api_key_env().is_some()
                    || config.api_key_env.is_some()
                {
                    Some(require_key(config)?)
                } else {
                    config.api_key.clone()
                };
                AnyProvider::ChatCompletions(ChatCompletionsClient {
                    base_url: require_base_url(base_url, config.provider)?,
                    api_key,
                    sampling,
                    agent,
                })
            }
            ProviderKind::Azure => AnyProvider::Azure(AzureClient {
                endpoint: require_base_url(base_url, config.provider)?,
                api_version: config
                    .api_version
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
                api_key: require_key(config)?,
                sampling,
                agent,
            }),
            ProviderKind::Anthropic => AnyProvider::Anthropic(AnthropicClient {
                base_url: require_base_url(base_url, config.provider)?,
                api_key: require_key(config)?,
                sampling,
                agent,
            }),
            ProviderKind::Google => AnyProvider::Gemini(GeminiClient {
                base_url: require_base_url(base_url, config.provider)?,
                api_key: require_key(config)?,
                sampling,
                agent,
            }),
            ProviderKind::Command => {
                let command = config.command.clone().ok_or_else(|| {
                    Error::ConfigValidation(
                        "llm.command is required for the command provider".to_string(),
                    )
                })?;
                AnyProvider::Command(CommandProvider::new(command, config.args.clone(), timeout))
            }
        };
        Ok(provider)
    }
}

impl LlmProvider for AnyProvider {
    async fn complete(&self, prompt: &str, context: &str) -> Result<String> {
        match self {
            AnyProvider::ChatCompletions(c) => {
                let body = send(&c.agent, c.build_request(prompt, context)).await?;
                chat_text(&body)
            }
            AnyProvider::Azure(c) => {
                let body = send(&c.agent, c.build_request(prompt, context)).await?;
                chat_text(&body)
            }
            AnyProvider::Anthropic(c) => {
                let body = send(&c.agent, c.build_request(prompt, context)).await?;
                anthropic_text(&body)
            }
            AnyProvider::Gemini(c) => {
                let body = send(&c.agent, c.build_request(prompt, context)).await?;
                gemini_text(&body)
            }
            AnyProvider::Command(c) => c.complete(prompt, context).await,
        }
    }
}

fn require_key(config: &LlmConfig) -> Result<String> {
    config.api_key.clone().ok_or_else(|| {
        let var = config
            .api_key_env
            .as_deref()
            .or_else(|| config.provider.default_api_key_env())
            .unwrap_or("api_key_env");
        Error::ConfigValidation(format!(
            "no API key for provider {}: set ${var}",
            config.provider
        ))
    })
}

fn require_base_url(base_url: Option<String>, kind: ProviderKind) -> Result<String> {
    base_url.ok_or_else(|| {
        Error::ConfigValidation(format!("llm.base_url is required for provider {kind}"))
    })
}

fn chat_body(model: Option<&str>, sampling: &Sampling, prompt: &str, context: &str) -> Value {
    let mut messages = Vec::new();
    if !context.is_empty() {
        messages.push(json!({"role": "system", "content": context}));
    }
    messages.push(json!({"role": "user", "content": prompt}));

    let mut body = json!({
        "messages": messages,
        "temperature": sampling.temperature,
        "max_tokens": sampling.max_tokens,
    });
    if let Some(model) = model {
        body["model"] = json!(model);
    }
    body
}

/// Post on a blocking thread; ureq is synchronous.
async fn send(agent: &ureq::Agent, request: HttpRequest) -> Result<Value> {
    let agent = agent.clone();
    tokio::task::spawn_blocking(move || send_blocking(&agent, &request))
        .await
        .map_err(|e| Error::Provider(format!("request task failed: {e}")))?
}

fn send_blocking(agent: &ureq::Agent, request: &HttpRequest) -> Result<Value> {
    debug!(url = %redact_url(&request.url), "sending llm request");
    let mut call = agent.post(&request.url);
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }
    match call.send_json(request.body.clone()) {
        Ok(response) => response
            .into_json::<Value>()
            .map_err(|e| Error::Provider(format!("failed to read provider response: {e}"))),
        Err(err) => Err(classify(err)),
    }
}

/// 429, 5xx and transport failures are transient; other statuses are not.
fn classify(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            if code == 429 || code >= 500 {
                Error::Provider(format!("HTTP {code}: {snippet}"))
            } else {
                Error::ProviderRejected(format!("HTTP {code}: {snippet}"))
            }
        }
        ureq::Error::Transport(t) => Error::Provider(format!("transport error: {t}")),
    }
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub fn chat_text(body: &Value) -> Result<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Provider(format!("unexpected chat completion response: {body}")))
}

pub fn anthropic_text(body: &Value) -> Result<String> {
    let parts = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Provider(format!("unexpected messages response: {body}")))?;
    Ok(parts
        .iter()
        .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

pub fn gemini_text(body: &Value) -> Result<String> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Provider(format!("unexpected generateContent response: {body}")))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::config::{ConfigFile, merge};
    use clap::Parser;

    fn llm_config(args: &[&str]) -> LlmConfig {
        let mut argv = vec!["covloop"];
        argv.extend_from_slice(args);
        merge(ConfigFile::default(), &Cli::parse_from(argv))
            .unwrap()
            .llm
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("Gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        let err = "bard".parse::<ProviderKind>().unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_provider_kind_display_roundtrip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Google,
            ProviderKind::Azure,
            ProviderKind::Ollama,
            ProviderKind::Groq,
            ProviderKind::OpenRouter,
            ProviderKind::Command,
        ] {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = llm_config(&["--provider", "anthropic"]);
        let err = AnyProvider::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let config = llm_config(&["--provider", "ollama"]);
        match AnyProvider::from_config(&config).unwrap() {
            AnyProvider::ChatCompletions(c) => {
                let req = c.build_request("write a test", "");
                assert_eq!(req.url, "http://localhost:11434/v1/chat/completions");
                assert!(!req.headers.iter().any(|(k, _)| k == "Authorization"));
                assert_eq!(req.body["model"], "llama3.2");
                assert_eq!(req.body["messages"].as_array().unwrap().len(), 1);
            }
            _ => panic!("expected chat completions client"),
        }
    }

    #[test]
    fn test_chat_request_shape() {
        let mut config = llm_config(&["--provider", "groq"]);
        config.api_key = Some("gsk-test".to_string());
        let AnyProvider::ChatCompletions(c) = AnyProvider::from_config(&config).unwrap() else {
            panic!("expected chat completions client");
        };
        let req = c.build_request("prompt", "you write tests");
        assert_eq!(req.url, "https://api.groq.com/openai/v1/chat/completions");
        assert!(
            req.headers
                .contains(&("Authorization".to_string(), "Bearer gsk-test".to_string()))
        );
        assert_eq!(req.body["messages"][0]["role"], "system");
        assert_eq!(req.body["messages"][1]["content"], "prompt");
        assert_eq!(req.body["max_tokens"], 4000);
    }

    #[test]
    fn test_azure_request_shape() {
        let mut config = llm_config(&["--provider", "azure"]);
        config.api_key = Some("az-key".to_string());
        config.base_url = Some("https://acme.openai.azure.com/".to_string());
        let AnyProvider::Azure(c) = AnyProvider::from_config(&config).unwrap() else {
            panic!("expected azure client");
        };
        let req = c.build_request("p", "");
        assert_eq!(
            req.url,
            "https://acme.openai.azure.com/openai/deployments/gpt-4/chat/completions?api-version=2024-02-15-preview"
        );
        assert!(req.body.get("model").is_none());
    }

    #[test]
    fn test_azure_requires_endpoint() {
        let mut config = llm_config(&["--provider", "azure"]);
        config.api_key = Some("az-key".to_string());
        let err = AnyProvider::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_anthropic_request_shape() {
        let mut config = llm_config(&["--provider", "anthropic"]);
        config.api_key = Some("sk-ant".to_string());
        let AnyProvider::Anthropic(c) = AnyProvider::from_config(&config).unwrap() else {
            panic!("expected anthropic client");
        };
        let req = c.build_request("p", "sys");
        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(req.body["system"], "sys");
        assert_eq!(req.body["model"], "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn test_gemini_request_keeps_key_out_of_url() {
        let mut config = llm_config(&["--provider", "google"]);
        config.api_key = Some("g-key".to_string());
        let AnyProvider::Gemini(c) = AnyProvider::from_config(&config).unwrap() else {
            panic!("expected gemini client");
        };
        let req = c.build_request("p", "");
        assert!(req.url.ends_with("/v1beta/models/gemini-1.5-pro:generateContent"));
        assert!(!req.url.contains("g-key"));
        assert_eq!(req.body["generationConfig"]["maxOutputTokens"], 4000);
    }

    #[test]
    fn test_command_provider_requires_command() {
        let config = llm_config(&["--provider", "command"]);
        assert!(AnyProvider::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_command_provider_pipes_prompt() {
        let provider = CommandProvider::new(
            "cat".to_string(),
            vec![],
            Duration::from_secs(10),
        );
        let text = provider.complete("the prompt", "the context").await.unwrap();
        assert_eq!(text, "the context\n\nthe prompt");
    }

    #[tokio::test]
    async fn test_command_provider_failure_is_transient() {
        let provider = CommandProvider::new(
            "sh".to_string(),
            vec!["-c".to_string(), "echo overloaded >&2; exit 3".to_string()],
            Duration::from_secs(10),
        );
        let err = provider.complete("p", "").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_response_extraction() {
        let chat = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(chat_text(&chat).unwrap(), "hello");
        assert!(chat_text(&json!({"error": "x"})).is_err());

        let anthropic = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "tool_use", "id": "t"},
            {"type": "text", "text": "b"}
        ]});
        assert_eq!(anthropic_text(&anthropic).unwrap(), "ab");

        let gemini = json!({"candidates": [{"content": {"parts": [{"text": "x"}, {"text": "y"}]}}]});
        assert_eq!(gemini_text(&gemini).unwrap(), "xy");
    }
}
