use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::{
    AuditEvent, DecidedBy, Escalation, EscalationKind, RepairAction, Session, TargetHistory,
    Verdict,
};

/// Verdict substituted for an operator in unattended runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDecision {
    Retry,
    Accept,
    Abandon,
}

impl AutoDecision {
    pub fn verdict(&self) -> Verdict {
        match self {
            AutoDecision::Retry => Verdict::Retry,
            AutoDecision::Accept => Verdict::AcceptAsIs,
            AutoDecision::Abandon => Verdict::AbandonTarget,
        }
    }
}

impl FromStr for AutoDecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retry" => Ok(AutoDecision::Retry),
            "accept" | "accept-as-is" => Ok(AutoDecision::Accept),
            "abandon" | "abandon-target" => Ok(AutoDecision::Abandon),
            other => Err(Error::ConfigValidation(format!(
                "unknown auto decision: {other} (expected: retry, accept, abandon)"
            ))),
        }
    }
}

impl fmt::Display for AutoDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoDecision::Retry => write!(f, "retry"),
            AutoDecision::Accept => write!(f, "accept"),
            AutoDecision::Abandon => write!(f, "abandon"),
        }
    }
}

/// What the gate sees when asked to decide.
pub struct GateContext<'a> {
    pub escalation: &'a Escalation,
    /// History of the escalated target; `None` for session-level failures.
    pub history: Option<&'a TargetHistory>,
    /// Every repair action recorded for the target.
    pub actions: Vec<&'a RepairAction>,
    pub session: &'a Session,
}

impl<'a> GateContext<'a> {
    pub fn new(session: &'a Session, escalation: &'a Escalation) -> Self {
        let history = escalation
            .target
            .as_deref()
            .and_then(|key| session.targets.get(key));
        let actions = escalation
            .target
            .as_deref()
            .map(|key| session.actions_for(key))
            .unwrap_or_default();
        Self {
            escalation,
            history,
            actions,
            session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub rationale: String,
    pub by: DecidedBy,
}

/// Where stuck or risky outcomes go for a decision.
pub trait DecisionGate {
    /// Block until a verdict is available.
    fn decide(
        &self,
        ctx: &GateContext<'_>,
    ) -> impl std::future::Future<Output = Result<Decision>> + Send;

    /// Approve a candidate before it is applied.
    fn approve(
        &self,
        action: &RepairAction,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}

/// Ask the gate about `escalation` and append the verdict to the session log.
pub async fn escalate<G: DecisionGate>(
    gate: &G,
    session: &mut Session,
    escalation: &Escalation,
) -> Result<Decision> {
    let decision = {
        let ctx = GateContext::new(session, escalation);
        gate.decide(&ctx).await?
    };
    session.record(AuditEvent::Verdict {
        target: escalation.target.clone(),
        verdict: decision.verdict,
        rationale: decision.rationale.clone(),
        by: decision.by,
    });
    info!(
        target_key = escalation.target.as_deref().unwrap_or("session"),
        verdict = %decision.verdict,
        "escalation decided"
    );
    Ok(decision)
}

/// Answers every escalation with a configured verdict.
pub struct AutoGate {
    decision: AutoDecision,
}

impl AutoGate {
    pub fn new(decision: AutoDecision) -> Self {
        Self { decision }
    }
}

impl DecisionGate for AutoGate {
    async fn decide(&self, ctx: &GateContext<'_>) -> Result<Decision> {
        Ok(Decision {
            verdict: self.decision.verdict(),
            rationale: format!(
                "auto-decision '{}' for: {}",
                self.decision, ctx.escalation.reason
            ),
            by: DecidedBy::Auto,
        })
    }

    async fn approve(&self, _action: &RepairAction) -> Result<bool> {
        Ok(true)
    }
}

/// Interactive gate: prints the escalation and reads the operator's answer.
pub struct PromptGate<R, W> {
    input: Mutex<R>,
    output: Mutex<W>,
}

impl<R, W> PromptGate<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    async fn write(&self, text: &str) -> Result<()> {
        let mut out = self.output.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    async fn read_line(&self) -> Result<String> {
        let mut line = String::new();
        let n = self.input.lock().await.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Gate(
                "operator input closed before a decision was made".to_string(),
            ));
        }
        Ok(line.trim().to_string())
    }
}

fn describe_escalation(ctx: &GateContext<'_>) -> String {
    let e = ctx.escalation;
    let mut text = String::from("\n=== covloop: decision needed ===\n");
    let kind = match &e.kind {
        EscalationKind::Stuck => "target keeps failing".to_string(),
        EscalationKind::Policy => "failing test may not be repaired automatically".to_string(),
        EscalationKind::Infrastructure { resume } => {
            format!("infrastructure failure while {resume}")
        }
    };
    text.push_str(&format!(
        "session {} | iteration {}/{} | coverage {:.1}% (target {:.1}%)\n",
        ctx.session.id,
        ctx.session.iteration,
        ctx.session.max_iterations,
        ctx.session.coverage.coverage_ratio() * 100.0,
        ctx.session.target_ratio * 100.0
    ));
    text.push_str(&format!(
        "target: {}\nkind: {kind}\nreason: {}\n",
        e.target.as_deref().unwrap_or("(session)"),
        e.reason
    ));
    if let Some(history) = ctx.history {
        text.push_str("attempts:\n");
        for line in history.describe_attempts() {
            text.push_str(&format!("  - {line}\n"));
        }
    }
    for action in &ctx.actions {
        let files: Vec<&str> = action.files.iter().map(|f| f.path.as_str()).collect();
        text.push_str(&format!(
            "action #{} [{}] {} ({})\n",
            action.id,
            action.provenance,
            action.summary,
            files.join(", ")
        ));
    }
    text
}

/// Parse an operator answer. Accepts the first letter or the full word.
pub fn parse_verdict(answer: &str) -> Option<Verdict> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" => Some(Verdict::Retry),
        "a" | "accept" | "accept-as-is" => Some(Verdict::AcceptAsIs),
        "b" | "abandon" | "abandon-target" => Some(Verdict::AbandonTarget),
        "c" | "cancel" => Some(Verdict::Cancel),
        _ => None,
    }
}

impl<R, W> DecisionGate for PromptGate<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn decide(&self, ctx: &GateContext<'_>) -> Result<Decision> {
        let summary = describe_escalation(ctx);
        self.write(&summary).await?;
        let verdict = loop {
            self.write("[r]etry, [a]ccept as-is, a[b]andon target, [c]ancel session > ")
                .await?;
            let answer = self.read_line().await?;
            match parse_verdict(&answer) {
                Some(v) => break v,
                None => self.write(&format!("unrecognised answer: {answer:?}\n")).await?,
            }
        };
        self.write("rationale (optional) > ").await?;
        let rationale = self.read_line().await?;
        Ok(Decision {
            verdict,
            rationale,
            by: DecidedBy::Operator,
        })
    }

    async fn approve(&self, action: &RepairAction) -> Result<bool> {
        let mut text = format!(
            "\n=== covloop: approve patch #{} for {} ===\n{}\n",
            action.id,
            action.target_key(),
            action.summary
        );
        for file in &action.files {
            text.push_str(&format!(
                "--- {} ({} lines)\n",
                file.path,
                file.content.lines().count()
            ));
        }
        self.write(&text).await?;
        loop {
            self.write("apply this patch? [y/n] > ").await?;
            match self.read_line().await?.to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                other => self.write(&format!("unrecognised answer: {other:?}\n")).await?,
            }
        }
    }
}

pub type StdinGate = PromptGate<tokio::io::BufReader<tokio::io::Stdin>, tokio::io::Stderr>;

/// Gate selected once from configuration.
pub enum AnyGate {
    Auto(AutoGate),
    Prompt(StdinGate),
}

impl AnyGate {
    pub fn from_decision(auto: Option<AutoDecision>) -> Self {
        match auto {
            Some(decision) => AnyGate::Auto(AutoGate::new(decision)),
            None => AnyGate::Prompt(PromptGate::new(
                tokio::io::BufReader::new(tokio::io::stdin()),
                tokio::io::stderr(),
            )),
        }
    }
}

impl DecisionGate for AnyGate {
    async fn decide(&self, ctx: &GateContext<'_>) -> Result<Decision> {
        match self {
            AnyGate::Auto(g) => g.decide(ctx).await,
            AnyGate::Prompt(g) => g.decide(ctx).await,
        }
    }

    async fn approve(&self, action: &RepairAction) -> Result<bool> {
        match self {
            AnyGate::Auto(g) => g.approve(action).await,
            AnyGate::Prompt(g) => g.approve(action).await,
        }
    }
}
