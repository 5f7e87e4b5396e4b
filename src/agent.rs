use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::coverage::{UncoveredRegion, normalize_path};
use crate::error::{Error, Result};
use crate::llm::LlmProvider;
use crate::prompts::{GeneratePromptVars, PromptEngine, RepairPromptVars, SourceFile};
use crate::runner::{TestOutcome, TestStatus};
use crate::sandbox::validate_relative_path;
use crate::session::FilePatch;

const EXCERPT_MARGIN: u32 = 2;

/// Sources and history handed to the agent with every request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairContext {
    pub files: Vec<SourceFile>,
    pub previous_attempts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub summary: String,
    pub files: Vec<FilePatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Candidate(Candidate),
    /// The agent could not produce a candidate. Not an error.
    Refusal(String),
}

/// Produces candidate test changes. Every call is an independent attempt:
/// the same input may yield a different candidate.
pub trait RepairAgent {
    fn repair(
        &self,
        test: &TestOutcome,
        context: &RepairContext,
    ) -> impl std::future::Future<Output = Result<AgentReply>> + Send;

    fn generate(
        &self,
        region: &UncoveredRegion,
        context: &RepairContext,
    ) -> impl std::future::Future<Output = Result<AgentReply>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ReplyWire {
    Patch {
        #[serde(default)]
        summary: String,
        files: Vec<FilePatch>,
    },
    Refusal {
        reason: String,
    },
}

/// Repair agent backed by an LLM provider.
pub struct LlmRepairAgent<P: LlmProvider> {
    provider: P,
    prompts: PromptEngine,
    test_path_prefixes: Vec<String>,
}

impl<P: LlmProvider + Sync> LlmRepairAgent<P> {
    pub fn new(provider: P, prompts: PromptEngine, test_path_prefixes: Vec<String>) -> Self {
        Self {
            provider,
            prompts,
            test_path_prefixes,
        }
    }

    /// Ask once; if the reply is unusable, ask again with the parse error.
    /// A second unusable reply becomes a refusal.
    async fn ask(&self, prompt: &str) -> Result<AgentReply> {
        let system = self.prompts.system()?;
        let first = self.provider.complete(prompt, &system).await?;
        let error = match parse_reply(&first) {
            Ok(reply) => return Ok(self.check_paths(reply)),
            Err(e) => e,
        };

        warn!(error = %error, "agent reply unusable, asking for a corrected reply");
        let correction = format!(
            "{prompt}\n\n## Correction\n\nYour previous reply could not be used: {error}\n\
             Reply again with only the JSON object described in your instructions."
        );
        let second = self.provider.complete(&correction, &system).await?;
        match parse_reply(&second) {
            Ok(reply) => Ok(self.check_paths(reply)),
            Err(e) => Ok(AgentReply::Refusal(format!("unusable reply: {e}"))),
        }
    }

    fn check_paths(&self, reply: AgentReply) -> AgentReply {
        let AgentReply::Candidate(candidate) = reply else {
            return reply;
        };
        if candidate.files.is_empty() {
            return AgentReply::Refusal("candidate contained no files".to_string());
        }
        for file in &candidate.files {
            if let Err(e) = validate_relative_path(&file.path) {
                return AgentReply::Refusal(format!("candidate rejected: {e}"));
            }
            let path = normalize_path(&file.path);
            if !self.test_path_prefixes.is_empty()
                && !self
                    .test_path_prefixes
                    .iter()
                    .any(|prefix| under_prefix(&path, prefix))
            {
                return AgentReply::Refusal(format!(
                    "candidate rejected: {} is outside the test paths ({})",
                    file.path,
                    self.test_path_prefixes.join(", ")
                ));
            }
        }
        AgentReply::Candidate(candidate)
    }
}

/// Whether `path` is `prefix` itself or lies below it, on a component boundary.
fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = normalize_path(prefix);
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

impl<P: LlmProvider + Sync> RepairAgent for LlmRepairAgent<P> {
    async fn repair(&self, test: &TestOutcome, context: &RepairContext) -> Result<AgentReply> {
        let reason = match &test.status {
            TestStatus::Failed(r) | TestStatus::Errored(r) => r.clone(),
            _ => String::new(),
        };
        let vars = RepairPromptVars {
            test_id: test.id.clone(),
            status: test.status.to_string(),
            reason,
            diagnostic: test.diagnostic.clone().unwrap_or_default(),
            files: context.files.clone(),
            has_prefixes: !self.test_path_prefixes.is_empty(),
            test_path_prefixes: self.test_path_prefixes.clone(),
            has_previous: !context.previous_attempts.is_empty(),
            previous_attempts: context.previous_attempts.clone(),
        };
        let prompt = self.prompts.render_repair(&vars)?;
        debug!(test = %test.id, bytes = prompt.len(), "requesting test repair");
        let reply = self.ask(&prompt).await?;
        log_reply(&format!("test:{}", test.id), &reply);
        Ok(reply)
    }

    async fn generate(
        &self,
        region: &UncoveredRegion,
        context: &RepairContext,
    ) -> Result<AgentReply> {
        let excerpt = context
            .files
            .iter()
            .find(|f| f.path == region.file)
            .map(|f| excerpt(&f.content, region.first_line(), region.last_line()))
            .unwrap_or_default();
        let vars = GeneratePromptVars {
            file: region.file.clone(),
            first_line: region.first_line(),
            last_line: region.last_line(),
            excerpt,
            files: context.files.clone(),
            has_prefixes: !self.test_path_prefixes.is_empty(),
            test_path_prefixes: self.test_path_prefixes.clone(),
            has_previous: !context.previous_attempts.is_empty(),
            previous_attempts: context.previous_attempts.clone(),
        };
        let prompt = self.prompts.render_generate(&vars)?;
        debug!(file = %region.file, bytes = prompt.len(), "requesting test generation");
        let reply = self.ask(&prompt).await?;
        log_reply(&region.file, &reply);
        Ok(reply)
    }
}

fn log_reply(key: &str, reply: &AgentReply) {
    match reply {
        AgentReply::Candidate(c) => {
            info!(key, files = c.files.len(), summary = %c.summary, "agent produced candidate")
        }
        AgentReply::Refusal(reason) => info!(key, reason = %reason, "agent refused"),
    }
}

/// Parse an agent reply, tolerating markdown code fences around the JSON.
pub fn parse_reply(raw: &str) -> Result<AgentReply> {
    let json = strip_markdown_fences(raw);
    let wire: ReplyWire = serde_json::from_str(&json)
        .map_err(|e| Error::Prompt(format!("failed to parse agent reply JSON: {e}")))?;
    Ok(match wire {
        ReplyWire::Patch { summary, files } => AgentReply::Candidate(Candidate { summary, files }),
        ReplyWire::Refusal { reason } => AgentReply::Refusal(reason),
    })
}

/// Remove a surrounding ```` ```json ```` fence, if any.
fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(pos) = rest.find('\n') else {
        return String::new();
    };
    let body = &rest[pos + 1..];
    match body.rfind("```") {
        Some(end) => body[..end].trim().to_string(),
        None => body.trim().to_string(),
    }
}

/// Numbered lines around `first..=last`.
fn excerpt(content: &str, first: u32, last: u32) -> String {
    let start = first.saturating_sub(EXCERPT_MARGIN).max(1);
    let end = last + EXCERPT_MARGIN;
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i as u32 + 1, line))
        .filter(|(n, _)| *n >= start && *n <= end)
        .map(|(n, line)| format!("{n:>5}: {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
