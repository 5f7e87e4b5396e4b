use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::coverage::{ChangeSet, CoverageReport, UncoveredRegion};
use crate::runner::TestOutcome;
use crate::sandbox::SandboxJournal;

/// Iteration controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Init,
    MeasuringBaseline,
    Deciding,
    Repairing,
    Reverifying,
    Escalated,
    Succeeded,
    Exhausted,
    Abandoned,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Exhausted | State::Abandoned)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "init",
            State::MeasuringBaseline => "measuring_baseline",
            State::Deciding => "deciding",
            State::Repairing => "repairing",
            State::Reverifying => "reverifying",
            State::Escalated => "escalated",
            State::Succeeded => "succeeded",
            State::Exhausted => "exhausted",
            State::Abandoned => "abandoned",
        };
        write!(f, "{name}")
    }
}

/// A failing test or an uncovered region selected for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairTarget {
    FailingTest { outcome: TestOutcome },
    CoverageGap { region: UncoveredRegion },
}

impl RepairTarget {
    /// Identity of the target across iterations.
    pub fn key(&self) -> String {
        match self {
            RepairTarget::FailingTest { outcome } => test_key(&outcome.id),
            RepairTarget::CoverageGap { region } => gap_key(region),
        }
    }

    /// How the target currently fails.
    pub fn signature(&self) -> String {
        match self {
            RepairTarget::FailingTest { outcome } => outcome.signature(),
            RepairTarget::CoverageGap { region } => format!(
                "uncovered: {}",
                region
                    .lines
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, RepairTarget::FailingTest { .. })
    }

    /// Whether this target's key or region covers `(file, line)`.
    pub fn covers_line(&self, file: &str, line: u32) -> bool {
        match self {
            RepairTarget::CoverageGap { region } => {
                region.file == file && region.first_line() <= line && line <= region.last_line()
            }
            RepairTarget::FailingTest { .. } => false,
        }
    }
}

pub fn test_key(test_id: &str) -> String {
    format!("test:{test_id}")
}

pub fn gap_key(region: &UncoveredRegion) -> String {
    format!(
        "gap:{}:{}-{}",
        region.file,
        region.first_line(),
        region.last_line()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    LlmGenerated,
    HumanApproved,
    AutoApplied,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::LlmGenerated => write!(f, "llm-generated"),
            Provenance::HumanApproved => write!(f, "human-approved"),
            Provenance::AutoApplied => write!(f, "auto-applied"),
        }
    }
}

/// New full content for one test file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub content: String,
}

/// A proposed test change. Immutable: approval or application produces a
/// new action that supersedes this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    pub id: u64,
    pub iteration: u32,
    pub origin: RepairTarget,
    pub provenance: Provenance,
    pub summary: String,
    pub files: Vec<FilePatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<u64>,
}

impl RepairAction {
    pub fn target_key(&self) -> String {
        self.origin.key()
    }

    pub fn superseded_by(&self, id: u64, provenance: Provenance) -> RepairAction {
        RepairAction {
            id,
            provenance,
            supersedes: Some(self.id),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptResult {
    Applied { action_id: u64 },
    Refused { reason: String },
    /// The operator declined the candidate.
    Rejected { action_id: u64 },
    /// The agent call failed after retries.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub iteration: u32,
    pub result: AttemptResult,
    pub resolved: bool,
    /// Failure signature after the attempt; `None` when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Open,
    Resolved,
    Escalated,
    Accepted,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHistory {
    pub target: RepairTarget,
    pub status: TargetStatus,
    pub attempts: Vec<Attempt>,
    pub consecutive_unresolved: u32,
}

impl TargetHistory {
    pub fn new(target: RepairTarget) -> Self {
        Self {
            target,
            status: TargetStatus::Open,
            attempts: Vec::new(),
            consecutive_unresolved: 0,
        }
    }

    /// Record an attempt. Consecutive unresolved attempts are counted only
    /// while the failure signature stays the same.
    pub fn record(&mut self, attempt: Attempt) {
        if attempt.resolved {
            self.consecutive_unresolved = 0;
            self.status = TargetStatus::Resolved;
        } else {
            let same_failure = self
                .attempts
                .last()
                .is_some_and(|prev| !prev.resolved && prev.signature == attempt.signature);
            self.consecutive_unresolved = if same_failure {
                self.consecutive_unresolved + 1
            } else {
                1
            };
            self.status = TargetStatus::Open;
        }
        self.attempts.push(attempt);
    }

    /// One line per attempt, for prompts and the decision gate.
    pub fn describe_attempts(&self) -> Vec<String> {
        self.attempts
            .iter()
            .map(|a| {
                let what = match &a.result {
                    AttemptResult::Applied { action_id } => format!("applied action #{action_id}"),
                    AttemptResult::Refused { reason } => format!("agent refused: {reason}"),
                    AttemptResult::Rejected { action_id } => {
                        format!("operator rejected action #{action_id}")
                    }
                    AttemptResult::Failed { error } => format!("agent call failed: {error}"),
                };
                match (&a.signature, a.resolved) {
                    (_, true) => format!("iteration {}: {what}, resolved", a.iteration),
                    (Some(sig), false) => {
                        format!("iteration {}: {what}, still {sig}", a.iteration)
                    }
                    (None, false) => format!("iteration {}: {what}, unresolved", a.iteration),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationKind {
    /// The target stayed unresolved on consecutive attempts.
    Stuck,
    /// A failing test that may not be repaired under the current settings.
    Policy,
    /// An adapter kept failing; `resume` is the state to re-enter on retry.
    Infrastructure { resume: State },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// `None` for session-level infrastructure failures.
    pub target: Option<String>,
    pub kind: EscalationKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Retry,
    AcceptAsIs,
    AbandonTarget,
    /// Stop the whole session.
    Cancel,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Retry => write!(f, "retry"),
            Verdict::AcceptAsIs => write!(f, "accept-as-is"),
            Verdict::AbandonTarget => write!(f, "abandon-target"),
            Verdict::Cancel => write!(f, "cancel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    Operator,
    Auto,
}

/// What happened, one record per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Transition {
        from: State,
        to: State,
    },
    Measured {
        ratio: f64,
        covered: usize,
        total: usize,
        failing: usize,
    },
    TargetsSelected {
        targets: Vec<String>,
    },
    ActionRecorded {
        action_id: u64,
        target: String,
        provenance: Provenance,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supersedes: Option<u64>,
    },
    AttemptRecorded {
        target: String,
        attempt: Attempt,
    },
    Escalated {
        escalation: Escalation,
    },
    Verdict {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        verdict: Verdict,
        rationale: String,
        by: DecidedBy,
    },
    Note {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: u64,
    pub iteration: u32,
    pub state: State,
    pub event: AuditEvent,
}

/// An attempt made during the current iteration, judged in Reverifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttempt {
    pub target: String,
    pub result: AttemptResult,
}

/// Everything the controller knows about a run. Persisted after every
/// transition so the run can be resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: u64,
    pub base_ref: String,
    pub head_ref: String,
    pub change_set: ChangeSet,
    pub target_ratio: f64,
    pub max_iterations: u32,
    pub iteration: u32,
    pub state: State,
    pub coverage: CoverageReport,
    pub outcomes: Vec<TestOutcome>,
    pub targets: BTreeMap<String, TargetHistory>,
    pub actions: Vec<RepairAction>,
    pub escalations: Vec<Escalation>,
    pub iteration_targets: Vec<String>,
    pub pending: Vec<PendingAttempt>,
    /// Failing tests already put to the gate because auto-fix is off.
    #[serde(default)]
    pub policy_escalated: BTreeSet<String>,
    /// Failing tests the operator allowed to be repaired despite auto-fix being off.
    #[serde(default)]
    pub repair_authorized: BTreeSet<String>,
    /// Retry verdicts on session-level infrastructure escalations since the
    /// last successful measurement.
    #[serde(default)]
    pub infra_retries: u32,
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,
    #[serde(default)]
    pub sandbox_journal: SandboxJournal,
    pub log: Vec<AuditRecord>,
}

impl Session {
    pub fn new(
        id: String,
        base_ref: String,
        head_ref: String,
        change_set: ChangeSet,
        target_ratio: f64,
        max_iterations: u32,
    ) -> Self {
        Self {
            id,
            created_at: unix_now(),
            base_ref,
            head_ref,
            change_set,
            target_ratio,
            max_iterations,
            iteration: 0,
            state: State::Init,
            coverage: CoverageReport::default(),
            outcomes: Vec::new(),
            targets: BTreeMap::new(),
            actions: Vec::new(),
            escalations: Vec::new(),
            iteration_targets: Vec::new(),
            pending: Vec::new(),
            policy_escalated: BTreeSet::new(),
            repair_authorized: BTreeSet::new(),
            infra_retries: 0,
            sandbox_root: None,
            sandbox_journal: SandboxJournal::default(),
            log: Vec::new(),
        }
    }

    /// Append a record to the log. The log is never rewritten.
    pub fn record(&mut self, event: AuditEvent) -> &AuditRecord {
        let seq = self.log.last().map_or(1, |r| r.seq + 1);
        self.log.push(AuditRecord {
            seq,
            timestamp: unix_now(),
            iteration: self.iteration,
            state: self.state,
            event,
        });
        &self.log[self.log.len() - 1]
    }

    pub fn next_action_id(&self) -> u64 {
        self.actions.last().map_or(1, |a| a.id + 1)
    }

    pub fn action(&self, id: u64) -> Option<&RepairAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Every action recorded for `target`, oldest first.
    pub fn actions_for(&self, target: &str) -> Vec<&RepairAction> {
        self.actions
            .iter()
            .filter(|a| a.target_key() == target)
            .collect()
    }

    pub fn failing_tests(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes.iter().filter(|o| o.is_failing())
    }

    pub fn has_status(&self, key: &str, status: TargetStatus) -> bool {
        self.targets.get(key).is_some_and(|h| h.status == status)
    }

    /// Whether an accepted or abandoned gap target covers the line.
    pub fn line_settled(&self, file: &str, line: u32, status: TargetStatus) -> bool {
        self.targets
            .values()
            .any(|h| h.status == status && h.target.covers_line(file, line))
    }

    /// Whether the suite has been measured at least once.
    pub fn has_measurement(&self) -> bool {
        self.log
            .iter()
            .any(|r| matches!(r.event, AuditEvent::Measured { .. }))
    }

    /// Transitions, in order, as (from, to) pairs.
    pub fn transitions(&self) -> Vec<(State, State)> {
        self.log
            .iter()
            .filter_map(|r| match r.event {
                AuditEvent::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Session id from the clock and pid; unique per machine for practical purposes.
pub fn new_session_id() -> String {
    format!("{}-{}", unix_now(), std::process::id())
}
