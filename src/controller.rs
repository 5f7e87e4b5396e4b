use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{AgentReply, Candidate, RepairAgent, RepairContext};
use crate::config::Config;
use crate::coverage::{self, ChangeSet, CoverageReport, UncoveredRegion};
use crate::error::{Error, Result};
use crate::gate::{self, DecisionGate};
use crate::prompts::SourceFile;
use crate::retry::{RetryPolicy, with_retries};
use crate::runner::{TestOutcome, TestRun, TestRunner};
use crate::sandbox::Sandbox;
use crate::session::{
    Attempt, AttemptResult, AuditEvent, Escalation, EscalationKind, PendingAttempt, Provenance,
    RepairAction, RepairTarget, Session, State, TargetHistory, TargetStatus, Verdict, test_key,
};
use crate::state::SessionStore;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Slack on top of the provider timeout; an agent call may include one
/// correction round-trip.
const AGENT_TIMEOUT_GRACE_SECS: u64 = 10;

/// Loop knobs that do not live in the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub auto_fix_broken_tests: bool,
    pub escalation_threshold: u32,
    pub max_parallel_repairs: usize,
    pub approve_patches: bool,
    pub max_context_bytes: usize,
    /// Retry verdicts allowed on session-level infrastructure escalations
    /// before the session stops `Exhausted`.
    pub max_infra_retries: u32,
    /// Refuse candidates that rewrite files of the change under review.
    pub protect_changed_sources: bool,
    pub runner_retry: RetryPolicy,
    pub agent_retry: RetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            auto_fix_broken_tests: true,
            escalation_threshold: 2,
            max_parallel_repairs: 4,
            approve_patches: false,
            max_context_bytes: 60_000,
            max_infra_retries: 2,
            protect_changed_sources: true,
            runner_retry: RetryPolicy::none(),
            agent_retry: RetryPolicy::none(),
        }
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        let agent_timeout = Duration::from_secs(
            config
                .llm
                .timeout
                .saturating_mul(2)
                .saturating_add(AGENT_TIMEOUT_GRACE_SECS),
        );
        Self {
            auto_fix_broken_tests: config.auto_fix_broken_tests,
            escalation_threshold: config.escalation_threshold.max(1),
            max_parallel_repairs: config.max_parallel_repairs.max(1),
            approve_patches: config.approve_patches,
            max_context_bytes: config.max_context_bytes,
            max_infra_retries: config.escalation_threshold.max(1),
            // configured test prefixes already confine writes
            protect_changed_sources: config.test_path_prefixes.is_empty(),
            // the runner enforces its own per-run timeout
            runner_retry: RetryPolicy::new(config.runner.retries, config.runner.backoff_ms, None),
            agent_retry: RetryPolicy::new(
                config.llm.retries,
                config.llm.backoff_ms,
                Some(agent_timeout),
            ),
        }
    }
}

/// Observer for loop progress shown to the operator.
pub trait ProgressReporter: Send + Sync {
    fn state_changed(&self, from: State, to: State);
    fn measured(&self, iteration: u32, report: &CoverageReport, failing: usize);
    fn targets_selected(&self, keys: &[String]);
    fn escalated(&self, escalation: &Escalation);
}

/// Default reporter that prints to stderr.
pub struct StderrReporter;

impl ProgressReporter for StderrReporter {
    fn state_changed(&self, from: State, to: State) {
        eprintln!("[covloop] {from} -> {to}");
    }

    fn measured(&self, iteration: u32, report: &CoverageReport, failing: usize) {
        eprintln!(
            "[covloop] iteration {iteration}: {:.1}% of changed lines covered ({}/{}), {failing} failing test(s)",
            report.coverage_ratio() * 100.0,
            report.covered_lines(),
            report.total_lines()
        );
    }

    fn targets_selected(&self, keys: &[String]) {
        eprintln!(
            "[covloop] Repairing {} target(s): {}",
            keys.len(),
            keys.join(", ")
        );
    }

    fn escalated(&self, escalation: &Escalation) {
        eprintln!(
            "[covloop] Escalating {}: {}",
            escalation.target.as_deref().unwrap_or("session"),
            escalation.reason
        );
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOutcome {
    pub state: State,
    pub iterations: u32,
    pub coverage_ratio: f64,
    pub failing_tests: usize,
}

impl ControllerOutcome {
    /// Process exit status for the session's terminal state.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            State::Succeeded => 0,
            State::Exhausted => 2,
            State::Abandoned => 3,
            _ => 1,
        }
    }
}

/// One measurement without the loop: test outcomes plus the coverage report.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub outcomes: Vec<TestOutcome>,
    pub report: CoverageReport,
}

/// Run the suite once and analyze coverage against `change_set`. No agent
/// is involved.
pub async fn measure<T: TestRunner>(
    runner: &T,
    change_set: &ChangeSet,
    selector: Option<&str>,
    retry: RetryPolicy,
) -> Result<Measurement> {
    let run = with_retries(retry, "test run", || runner.run(selector)).await?;
    Ok(Measurement {
        report: coverage::analyze(change_set, &run.coverage),
        outcomes: run.outcomes,
    })
}

/// Drives one session from `Init` to a terminal state.
pub struct Controller<T, A, G, P = StderrReporter> {
    runner: T,
    agent: Arc<A>,
    gate: G,
    sandbox: Sandbox,
    store: SessionStore,
    session: Session,
    settings: ControllerSettings,
    reporter: P,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<T, A, G> Controller<T, A, G>
where
    T: TestRunner,
    A: RepairAgent + Send + Sync + 'static,
    G: DecisionGate,
{
    pub fn new(
        runner: T,
        agent: A,
        gate: G,
        sandbox: Sandbox,
        store: SessionStore,
        session: Session,
        settings: ControllerSettings,
    ) -> Self {
        Self::with_reporter(
            runner,
            agent,
            gate,
            sandbox,
            store,
            session,
            settings,
            StderrReporter,
        )
    }
}

impl<T, A, G, P> Controller<T, A, G, P>
where
    T: TestRunner,
    A: RepairAgent + Send + Sync + 'static,
    G: DecisionGate,
    P: ProgressReporter,
{
    #[allow(clippy::too_many_arguments)]
    pub fn with_reporter(
        runner: T,
        agent: A,
        gate: G,
        sandbox: Sandbox,
        store: SessionStore,
        session: Session,
        settings: ControllerSettings,
        reporter: P,
    ) -> Self {
        Self {
            runner,
            agent: Arc::new(agent),
            gate,
            sandbox,
            store,
            session,
            settings,
            reporter,
            shutdown: None,
        }
    }

    /// When `shutdown` becomes true, the controller stops between states.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn into_parts(self) -> (Session, Sandbox) {
        (self.session, self.sandbox)
    }

    /// Run until a terminal state. Content failures and adapter failures
    /// are handled inside the loop; only persistence, sandbox and gate
    /// errors end the run with `Err`.
    pub async fn run(&mut self) -> Result<ControllerOutcome> {
        info!(
            session = %self.session.id,
            state = %self.session.state,
            iteration = self.session.iteration,
            "controller starting"
        );

        if self.session.state == State::Repairing {
            // partial writes of an interrupted repair step are redone
            let restored = self.sandbox.rollback_iteration()?;
            self.session.pending.clear();
            self.note(format!(
                "resumed during repair; rolled back {} file(s)",
                restored.len()
            ));
        }
        self.persist()?;

        while !self.session.state.is_terminal() {
            if self.shutdown_requested() {
                info!("shutdown requested, abandoning session");
                let next = self.cancel("cancellation requested")?;
                self.transition(next)?;
                break;
            }

            let next = match self.session.state {
                State::Init => self.init(),
                State::MeasuringBaseline => self.measure_baseline().await?,
                State::Deciding => self.decide(),
                State::Repairing => self.repair().await?,
                State::Reverifying => self.reverify().await?,
                State::Escalated => self.resolve_escalations().await?,
                terminal => terminal,
            };
            self.transition(next)?;
        }

        let outcome = ControllerOutcome {
            state: self.session.state,
            iterations: self.session.iteration,
            coverage_ratio: self.session.coverage.coverage_ratio(),
            failing_tests: self.session.failing_tests().count(),
        };
        info!(
            state = %outcome.state,
            iterations = outcome.iterations,
            coverage = outcome.coverage_ratio,
            "session finished"
        );
        Ok(outcome)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn transition(&mut self, next: State) -> Result<()> {
        let from = self.session.state;
        if from != next {
            self.session.state = next;
            self.session
                .record(AuditEvent::Transition { from, to: next });
            self.reporter.state_changed(from, next);
            debug!(%from, to = %next, "state transition");
        }
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        self.session.sandbox_root = Some(self.sandbox.root().to_path_buf());
        self.session.sandbox_journal = self.sandbox.journal().clone();
        self.store.save(&self.session)
    }

    fn note(&mut self, message: String) {
        self.session.record(AuditEvent::Note { message });
    }

    fn current_iteration(&self) -> u32 {
        self.session.iteration + 1
    }

    fn init(&mut self) -> State {
        let change_set = &self.session.change_set;
        info!(
            files = change_set.files().len(),
            lines = change_set.total_lines(),
            target = self.session.target_ratio,
            max_iterations = self.session.max_iterations,
            "session initialised"
        );
        if change_set.is_empty() {
            self.note("change set is empty; only test outcomes matter".to_string());
        }
        State::MeasuringBaseline
    }

    async fn run_tests(&self) -> Result<TestRun> {
        let runner = &self.runner;
        with_retries(self.settings.runner_retry, "test run", || runner.run(None)).await
    }

    fn apply_measurement(&mut self, run: TestRun) {
        let report = coverage::analyze(&self.session.change_set, &run.coverage);
        let failing = run.failing().count();
        self.session.record(AuditEvent::Measured {
            ratio: report.coverage_ratio(),
            covered: report.covered_lines(),
            total: report.total_lines(),
            failing,
        });
        self.reporter
            .measured(self.session.iteration, &report, failing);
        self.session.coverage = report;
        self.session.outcomes = run.outcomes;
        self.session.infra_retries = 0;
    }

    async fn measure_baseline(&mut self) -> Result<State> {
        let run = match self.run_tests().await {
            Ok(run) => run,
            Err(e) => return Ok(self.infrastructure_failure(State::MeasuringBaseline, &e)),
        };
        self.apply_measurement(run);

        let report = &self.session.coverage;
        if self.session.failing_tests().next().is_none()
            && report.covered_lines() == report.total_lines()
        {
            info!("baseline covers every changed line and all tests pass");
            return Ok(State::Succeeded);
        }
        Ok(State::Deciding)
    }

    fn infrastructure_failure(&mut self, resume: State, error: &Error) -> State {
        warn!(error = %error, resume = %resume, "adapter failed after retries");
        self.queue_escalation(Escalation {
            target: None,
            kind: EscalationKind::Infrastructure { resume },
            reason: error.to_string(),
        });
        State::Escalated
    }

    fn queue_escalation(&mut self, escalation: Escalation) {
        if let Some(key) = escalation.target.as_deref()
            && let Some(history) = self.session.targets.get_mut(key)
        {
            history.status = TargetStatus::Escalated;
        }
        info!(
            target_key = escalation.target.as_deref().unwrap_or("session"),
            reason = %escalation.reason,
            "queued escalation"
        );
        self.session.record(AuditEvent::Escalated {
            escalation: escalation.clone(),
        });
        self.session.escalations.push(escalation);
    }

    fn is_settled(&self, key: &str) -> bool {
        self.session.has_status(key, TargetStatus::Accepted)
            || self.session.has_status(key, TargetStatus::Abandoned)
    }

    fn goals_met(&self) -> bool {
        let session = &self.session;
        let tests_ok = session
            .failing_tests()
            .all(|o| session.has_status(&test_key(&o.id), TargetStatus::Accepted));
        if !tests_ok {
            return false;
        }
        let report = &session.coverage;
        report.coverage_ratio() >= session.target_ratio
            || report.uncovered_regions().iter().all(|region| {
                region
                    .lines
                    .iter()
                    .all(|&line| session.line_settled(&region.file, line, TargetStatus::Accepted))
            })
    }

    fn select_targets(&self) -> Vec<RepairTarget> {
        let session = &self.session;
        let mut targets = Vec::new();

        for outcome in session.failing_tests() {
            let key = test_key(&outcome.id);
            if self.is_settled(&key) {
                continue;
            }
            if !self.settings.auto_fix_broken_tests && !session.repair_authorized.contains(&key) {
                continue;
            }
            targets.push(RepairTarget::FailingTest {
                outcome: outcome.clone(),
            });
        }

        if session.coverage.coverage_ratio() < session.target_ratio {
            for region in session.coverage.uncovered_regions() {
                let open: Vec<u32> = region
                    .lines
                    .iter()
                    .copied()
                    .filter(|&line| {
                        !session.line_settled(&region.file, line, TargetStatus::Accepted)
                            && !session.line_settled(&region.file, line, TargetStatus::Abandoned)
                    })
                    .collect();
                if open.is_empty() {
                    continue;
                }
                targets.push(RepairTarget::CoverageGap {
                    region: UncoveredRegion {
                        file: region.file,
                        lines: open,
                    },
                });
            }
        }

        targets
    }

    /// Failing tests that auto-fix may not touch and the gate has not seen.
    fn blocked_tests(&self) -> Vec<TestOutcome> {
        if self.settings.auto_fix_broken_tests {
            return Vec::new();
        }
        self.session
            .failing_tests()
            .filter(|o| {
                let key = test_key(&o.id);
                !self.is_settled(&key)
                    && !self.session.repair_authorized.contains(&key)
                    && !self.session.policy_escalated.contains(&key)
            })
            .cloned()
            .collect()
    }

    fn decide(&mut self) -> State {
        if self.goals_met() {
            return State::Succeeded;
        }
        if self.session.iteration >= self.session.max_iterations {
            info!(
                iterations = self.session.iteration,
                "iteration budget spent with the goal unmet"
            );
            return State::Exhausted;
        }
        if !self.session.escalations.is_empty() {
            return State::Escalated;
        }

        let targets = self.select_targets();
        if targets.is_empty() {
            let blocked = self.blocked_tests();
            if blocked.is_empty() {
                self.note("no repairable targets remain; the goal stays unmet".to_string());
                return State::Abandoned;
            }
            for outcome in blocked {
                let target = RepairTarget::FailingTest { outcome };
                let key = target.key();
                self.session
                    .targets
                    .entry(key.clone())
                    .or_insert_with(|| TargetHistory::new(target));
                self.session.policy_escalated.insert(key.clone());
                self.queue_escalation(Escalation {
                    target: Some(key),
                    kind: EscalationKind::Policy,
                    reason: "test fails and auto-fix of broken tests is disabled".to_string(),
                });
            }
            return State::Escalated;
        }

        let mut keys = Vec::with_capacity(targets.len());
        for target in targets {
            let key = target.key();
            match self.session.targets.get_mut(&key) {
                // keep the latest diagnostic for the prompt
                Some(history) => history.target = target,
                None => {
                    self.session
                        .targets
                        .insert(key.clone(), TargetHistory::new(target));
                }
            }
            keys.push(key);
        }

        info!(
            iteration = self.current_iteration(),
            count = keys.len(),
            "selected repair targets"
        );
        self.session.record(AuditEvent::TargetsSelected {
            targets: keys.clone(),
        });
        self.reporter.targets_selected(&keys);
        self.session.iteration_targets = keys;
        self.sandbox.begin_iteration();
        State::Repairing
    }

    fn build_context(&self, target: &RepairTarget) -> RepairContext {
        let key = target.key();
        let mut paths: Vec<String> = match target {
            RepairTarget::CoverageGap { region } => vec![region.file.clone()],
            RepairTarget::FailingTest { .. } => self
                .session
                .change_set
                .files()
                .iter()
                .map(|f| f.path.clone())
                .collect(),
        };
        for action in self.session.actions_for(&key) {
            for file in &action.files {
                if !paths.contains(&file.path) {
                    paths.push(file.path.clone());
                }
            }
        }

        let mut budget = self.settings.max_context_bytes;
        let mut files = Vec::new();
        for path in paths {
            if budget == 0 {
                debug!(target_key = %key, "source context budget exhausted");
                break;
            }
            let content = match self.sandbox.read_file(&path) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    debug!(file = %path, error = %e, "skipping unreadable context file");
                    continue;
                }
            };
            let content = truncate_to(&content, budget);
            budget = budget.saturating_sub(content.len());
            files.push(SourceFile { path, content });
        }

        RepairContext {
            files,
            previous_attempts: self
                .session
                .targets
                .get(&key)
                .map(TargetHistory::describe_attempts)
                .unwrap_or_default(),
        }
    }

    /// Ask the agent about every target, up to `max_parallel_repairs` at a
    /// time. Replies come back in target order.
    async fn request_candidates(
        &self,
        targets: &[RepairTarget],
    ) -> Vec<Result<AgentReply>> {
        let limit = Arc::new(Semaphore::new(self.settings.max_parallel_repairs.max(1)));
        let mut set = JoinSet::new();
        for (index, target) in targets.iter().enumerate() {
            let agent = Arc::clone(&self.agent);
            let limit = Arc::clone(&limit);
            let policy = self.settings.agent_retry;
            let context = self.build_context(target);
            let target = target.clone();
            set.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let label = format!("agent call for {}", target.key());
                let reply = with_retries(policy, &label, || {
                    call_agent(agent.as_ref(), &target, &context)
                })
                .await;
                (index, reply)
            });
        }

        let mut replies: Vec<Option<Result<AgentReply>>> = targets.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, reply)) => replies[index] = Some(reply),
                Err(e) => warn!(error = %e, "agent task did not complete"),
            }
        }
        replies
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::Provider("agent task aborted".to_string()))))
            .collect()
    }

    async fn repair(&mut self) -> Result<State> {
        let targets: Vec<RepairTarget> = self
            .session
            .iteration_targets
            .iter()
            .filter_map(|key| self.session.targets.get(key))
            .map(|h| h.target.clone())
            .collect();

        let replies = self.request_candidates(&targets).await;

        for (target, reply) in targets.into_iter().zip(replies) {
            let key = target.key();
            let result = match reply {
                Ok(AgentReply::Candidate(candidate)) => {
                    self.apply_candidate(target, candidate).await?
                }
                Ok(AgentReply::Refusal(reason)) => AttemptResult::Refused { reason },
                Err(e) => {
                    warn!(target_key = %key, error = %e, "agent call failed");
                    AttemptResult::Failed {
                        error: e.to_string(),
                    }
                }
            };
            self.session.pending.push(PendingAttempt {
                target: key,
                result,
            });
            self.persist()?;
        }

        Ok(State::Reverifying)
    }

    fn record_action(&mut self, action: RepairAction) {
        self.session.record(AuditEvent::ActionRecorded {
            action_id: action.id,
            target: action.target_key(),
            provenance: action.provenance,
            supersedes: action.supersedes,
        });
        self.session.actions.push(action);
    }

    async fn apply_candidate(
        &mut self,
        target: RepairTarget,
        candidate: Candidate,
    ) -> Result<AttemptResult> {
        if self.settings.protect_changed_sources
            && let Some(file) = candidate
                .files
                .iter()
                .find(|f| self.session.change_set.lines_for(&f.path).is_some())
        {
            info!(file = %file.path, "candidate rewrites a changed source file; refused");
            return Ok(AttemptResult::Refused {
                reason: format!("candidate rewrites {}, which is under review", file.path),
            });
        }

        let proposed = RepairAction {
            id: self.session.next_action_id(),
            iteration: self.current_iteration(),
            origin: target,
            provenance: Provenance::LlmGenerated,
            summary: candidate.summary,
            files: candidate.files,
            supersedes: None,
        };
        self.record_action(proposed.clone());

        let provenance = if self.settings.approve_patches {
            self.persist()?;
            if !self.gate.approve(&proposed).await? {
                info!(action = proposed.id, "candidate rejected by operator");
                return Ok(AttemptResult::Rejected {
                    action_id: proposed.id,
                });
            }
            Provenance::HumanApproved
        } else {
            Provenance::AutoApplied
        };

        for file in &proposed.files {
            if let Err(e) = self.sandbox.write_file(&file.path, &file.content) {
                warn!(action = proposed.id, file = %file.path, error = %e, "failed to apply candidate");
                return Ok(AttemptResult::Failed {
                    error: e.to_string(),
                });
            }
        }

        let applied = proposed.superseded_by(self.session.next_action_id(), provenance);
        let action_id = applied.id;
        info!(
            action = action_id,
            target_key = %applied.target_key(),
            %provenance,
            files = applied.files.len(),
            "applied candidate"
        );
        self.record_action(applied);
        Ok(AttemptResult::Applied { action_id })
    }

    async fn reverify(&mut self) -> Result<State> {
        let applied = self
            .session
            .pending
            .iter()
            .any(|p| matches!(p.result, AttemptResult::Applied { .. }));

        let mut crash = None;
        if applied {
            match self.run_tests().await {
                Ok(run) => self.apply_measurement(run),
                Err(Error::Runner { exit_code, stderr }) => {
                    let restored = self.sandbox.rollback_iteration()?;
                    warn!(
                        exit_code,
                        files = restored.len(),
                        "test runner crashed on this iteration's changes; rolled back"
                    );
                    self.note(format!(
                        "test runner crashed with exit code {exit_code}; rolled back {}: {}",
                        restored.join(", "),
                        stderr.trim()
                    ));
                    crash = Some(format!("runner crashed: exit code {exit_code}"));
                }
                Err(e) => return Ok(self.infrastructure_failure(State::Reverifying, &e)),
            }
        } else {
            debug!("nothing applied this iteration; keeping the previous measurement");
        }

        self.session.iteration += 1;
        let pending = std::mem::take(&mut self.session.pending);
        for attempt in pending {
            self.judge(attempt, crash.as_deref());
        }
        self.session.iteration_targets.clear();

        if self.session.escalations.is_empty() {
            Ok(State::Deciding)
        } else {
            Ok(State::Escalated)
        }
    }

    /// How `target` fails in the current measurement; `None` once resolved.
    fn current_signature(&self, target: &RepairTarget) -> Option<String> {
        match target {
            RepairTarget::FailingTest { outcome } => self
                .session
                .outcomes
                .iter()
                .find(|o| o.id == outcome.id && o.is_failing())
                .map(TestOutcome::signature),
            RepairTarget::CoverageGap { region } => {
                let lines = self.session.coverage.files().get(&region.file);
                let still: Vec<u32> = region
                    .lines
                    .iter()
                    .copied()
                    .filter(|line| lines.and_then(|l| l.get(line)).is_some_and(|covered| !covered))
                    .collect();
                if still.is_empty() {
                    return None;
                }
                Some(
                    RepairTarget::CoverageGap {
                        region: UncoveredRegion {
                            file: region.file.clone(),
                            lines: still,
                        },
                    }
                    .signature(),
                )
            }
        }
    }

    fn judge(&mut self, pending: PendingAttempt, crash: Option<&str>) {
        let Some(target) = self
            .session
            .targets
            .get(&pending.target)
            .map(|h| h.target.clone())
        else {
            warn!(target_key = %pending.target, "attempt for unknown target dropped");
            return;
        };

        let signature = match crash {
            Some(sig) => Some(sig.to_string()),
            None => self.current_signature(&target),
        };
        let attempt = Attempt {
            iteration: self.session.iteration,
            result: pending.result,
            resolved: signature.is_none(),
            signature,
        };
        self.session.record(AuditEvent::AttemptRecorded {
            target: pending.target.clone(),
            attempt: attempt.clone(),
        });

        let Some(history) = self.session.targets.get_mut(&pending.target) else {
            return;
        };
        history.record(attempt);
        let streak = history.consecutive_unresolved;
        if history.status == TargetStatus::Resolved {
            info!(target_key = %pending.target, "target resolved");
            return;
        }
        if streak < self.settings.escalation_threshold {
            return;
        }

        let only_failures = history
            .attempts
            .iter()
            .rev()
            .take(streak as usize)
            .all(|a| matches!(a.result, AttemptResult::Failed { .. }));
        let last = history
            .attempts
            .last()
            .and_then(|a| a.signature.clone())
            .unwrap_or_default();
        let (kind, reason) = if only_failures {
            (
                EscalationKind::Infrastructure {
                    resume: State::Deciding,
                },
                format!("agent call failed on {streak} consecutive attempts"),
            )
        } else {
            (
                EscalationKind::Stuck,
                format!("unresolved after {streak} consecutive attempts ({last})"),
            )
        };
        self.queue_escalation(Escalation {
            target: Some(pending.target),
            kind,
            reason,
        });
    }

    fn set_status(&mut self, key: &str, status: TargetStatus) {
        if let Some(history) = self.session.targets.get_mut(key) {
            history.status = status;
            if status == TargetStatus::Open {
                history.consecutive_unresolved = 0;
            }
        }
    }

    async fn resolve_escalations(&mut self) -> Result<State> {
        while let Some(escalation) = self.session.escalations.first().cloned() {
            self.reporter.escalated(&escalation);
            self.persist()?;
            let decision = gate::escalate(&self.gate, &mut self.session, &escalation).await?;
            self.session.escalations.remove(0);

            match (decision.verdict, escalation.target.as_deref()) {
                (Verdict::Cancel, _) => return self.cancel("operator cancelled the session"),
                (Verdict::Retry, None) => {
                    if self.session.infra_retries >= self.settings.max_infra_retries {
                        warn!(
                            retries = self.session.infra_retries,
                            "infrastructure retries spent"
                        );
                        self.note(format!(
                            "infrastructure still failing after {} retries: {}",
                            self.session.infra_retries, escalation.reason
                        ));
                        return Ok(State::Exhausted);
                    }
                    self.session.infra_retries += 1;
                    let resume = match escalation.kind {
                        EscalationKind::Infrastructure { resume } => resume,
                        _ => State::Deciding,
                    };
                    return Ok(resume);
                }
                (Verdict::AcceptAsIs, None) => {
                    let before_baseline = escalation.kind
                        == (EscalationKind::Infrastructure {
                            resume: State::MeasuringBaseline,
                        });
                    if before_baseline || !self.session.has_measurement() {
                        self.note(
                            "nothing measured yet; accepting leaves no bar to meet".to_string(),
                        );
                        return Ok(State::Abandoned);
                    }
                    return Ok(State::Succeeded);
                }
                (Verdict::AbandonTarget, None) => return Ok(State::Abandoned),
                (Verdict::Retry, Some(key)) => {
                    if escalation.kind == EscalationKind::Policy {
                        self.session.repair_authorized.insert(key.to_string());
                    }
                    self.set_status(key, TargetStatus::Open);
                }
                (Verdict::AcceptAsIs, Some(key)) => self.set_status(key, TargetStatus::Accepted),
                (Verdict::AbandonTarget, Some(key)) => {
                    self.set_status(key, TargetStatus::Abandoned)
                }
            }
            self.persist()?;
        }
        Ok(State::Deciding)
    }

    /// Discard every sandbox change; the session ends `Abandoned`.
    fn cancel(&mut self, reason: &str) -> Result<State> {
        self.sandbox.discard()?;
        self.note(format!("{reason}; sandbox changes discarded"));
        info!(reason, "session cancelled");
        Ok(State::Abandoned)
    }
}

async fn call_agent<A: RepairAgent>(
    agent: &A,
    target: &RepairTarget,
    context: &RepairContext,
) -> Result<AgentReply> {
    match target {
        RepairTarget::FailingTest { outcome } => agent.repair(outcome, context).await,
        RepairTarget::CoverageGap { region } => agent.generate(region, context).await,
    }
}

/// Cut `content` to at most `max_bytes` (marker included) on a char boundary.
fn truncate_to(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    let mut end = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &content[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_to_keeps_short_content() {
        assert_eq!(truncate_to("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_to_marks_cut() {
        let content = "x".repeat(100);
        let out = truncate_to(&content, 40);
        assert!(out.len() <= 40);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncate_to_respects_char_boundaries() {
        let content = "é".repeat(30);
        let out = truncate_to(&content, 25);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn test_exit_codes() {
        let outcome = |state| ControllerOutcome {
            state,
            iterations: 1,
            coverage_ratio: 0.5,
            failing_tests: 0,
        };
        assert_eq!(outcome(State::Succeeded).exit_code(), 0);
        assert_eq!(outcome(State::Exhausted).exit_code(), 2);
        assert_eq!(outcome(State::Abandoned).exit_code(), 3);
    }

    #[test]
    fn test_settings_clamp_zero_values() {
        let cli = <crate::cli::Cli as clap::Parser>::parse_from(["covloop"]);
        let mut config = crate::config::merge(Default::default(), &cli).unwrap();
        config.escalation_threshold = 0;
        config.max_parallel_repairs = 0;
        let settings = ControllerSettings::from_config(&config);
        assert_eq!(settings.escalation_threshold, 1);
        assert_eq!(settings.max_parallel_repairs, 1);
        assert!(settings.agent_retry.timeout.is_some());
        assert!(settings.runner_retry.timeout.is_none());
        assert_eq!(settings.max_infra_retries, 1);
    }

    #[test]
    fn test_changed_sources_protected_only_without_test_prefixes() {
        let cli = <crate::cli::Cli as clap::Parser>::parse_from(["covloop"]);
        let mut config = crate::config::merge(Default::default(), &cli).unwrap();
        assert!(ControllerSettings::from_config(&config).protect_changed_sources);

        config.test_path_prefixes = vec!["tests".to_string()];
        assert!(!ControllerSettings::from_config(&config).protect_changed_sources);
    }
}
