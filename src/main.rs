use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use covloop::agent::LlmRepairAgent;
use covloop::cli::{Cli, CliCommand};
use covloop::config::Config;
use covloop::controller::{Controller, ControllerOutcome, ControllerSettings, measure};
use covloop::coverage::ChangeSet;
use covloop::diff::{DiffScopeProvider, GitDiffProvider};
use covloop::error::{Error, Result};
use covloop::gate::AnyGate;
use covloop::llm::AnyProvider;
use covloop::prompts::PromptEngine;
use covloop::retry::RetryPolicy;
use covloop::runner::CommandTestRunner;
use covloop::sandbox::{Sandbox, SandboxManager};
use covloop::session::{Session, new_session_id};
use covloop::state::SessionStore;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("covloop starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    info!(?config, "config loaded");

    let repo_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let result = match cli.command.clone().unwrap_or(CliCommand::Run) {
        CliCommand::Run => run_session(&config, &repo_root).await,
        CliCommand::Analyze { filter } => analyze(&config, &repo_root, filter.as_deref()).await,
        CliCommand::Resume { session } => resume_session(&config, &repo_root, &session).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(Error::Interrupted) => std::process::exit(130),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn resolve_dir(repo_root: &Path, dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

fn compute_change_set(config: &Config, repo_root: &Path) -> Result<(String, ChangeSet)> {
    let diff = GitDiffProvider::new(repo_root.to_path_buf(), config.include_extensions.clone());
    let base = match config.base_ref.clone() {
        Some(base) => base,
        None => diff.detect_base_ref()?,
    };
    let change_set = diff.changed_lines(&base, &config.head_ref)?;
    info!(
        base = %base,
        head = %config.head_ref,
        files = change_set.files().len(),
        lines = change_set.total_lines(),
        "change set computed"
    );
    Ok((base, change_set))
}

/// First Ctrl-C asks the controller to stop between states; a second one
/// exits immediately.
fn install_interrupt_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("[covloop] Interrupted; stopping after the current step (Ctrl-C again to abort)");
        let _ = tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    rx
}

async fn run_session(config: &Config, repo_root: &Path) -> Result<i32> {
    config.require_test_command()?;
    let (base, change_set) = compute_change_set(config, repo_root)?;

    let session = Session::new(
        new_session_id(),
        base,
        config.head_ref.clone(),
        change_set,
        config.target_ratio(),
        config.max_iterations,
    );
    info!(session = %session.id, "new session");

    let manager = SandboxManager::new(
        repo_root.to_path_buf(),
        resolve_dir(repo_root, &config.sandbox_dir),
    );
    let sandbox = manager.create(&session.id, &config.head_ref)?;
    drive(config, repo_root, &manager, session, sandbox).await
}

async fn resume_session(config: &Config, repo_root: &Path, session_id: &str) -> Result<i32> {
    let store = SessionStore::new(resolve_dir(repo_root, &config.state_dir), session_id);
    let session = store
        .load()
        .ok_or_else(|| Error::State(format!("no resumable session '{session_id}'")))?;

    if session.state.is_terminal() {
        eprintln!(
            "[covloop] Session {session_id} already finished: {}",
            session.state
        );
        return Ok(exit_code_for(&session));
    }

    config.require_test_command()?;
    let root = session
        .sandbox_root
        .clone()
        .ok_or_else(|| Error::Sandbox("session has no recorded sandbox".to_string()))?;
    if !root.exists() {
        return Err(Error::Sandbox(format!(
            "sandbox {} no longer exists",
            root.display()
        )));
    }
    let sandbox = Sandbox::with_journal(root, session.sandbox_journal.clone());
    info!(session = session_id, state = %session.state, "resuming session");

    let manager = SandboxManager::new(
        repo_root.to_path_buf(),
        resolve_dir(repo_root, &config.sandbox_dir),
    );
    drive(config, repo_root, &manager, session, sandbox).await
}

async fn drive(
    config: &Config,
    repo_root: &Path,
    manager: &SandboxManager,
    session: Session,
    sandbox: Sandbox,
) -> Result<i32> {
    let store = SessionStore::new(resolve_dir(repo_root, &config.state_dir), &session.id);
    let audit_file = store.audit_file();
    let session_id = session.id.clone();

    let runner = CommandTestRunner::new(&config.runner, sandbox.root().to_path_buf());
    let provider = AnyProvider::from_config(&config.llm)?;
    let agent = LlmRepairAgent::new(
        provider,
        PromptEngine::new(config.prompts_dir.clone()),
        config.test_path_prefixes.clone(),
    );
    let gate = AnyGate::from_decision(config.auto_decision);
    let shutdown = install_interrupt_handler();

    let mut controller = Controller::new(
        runner,
        agent,
        gate,
        sandbox,
        store,
        session,
        ControllerSettings::from_config(config),
    )
    .with_shutdown(shutdown.clone());

    let outcome = match controller.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!(
                "[covloop] Session {session_id} suspended; continue with `covloop resume --session {session_id}`"
            );
            eprintln!("[covloop] Session log: {}", audit_file.display());
            return Err(e);
        }
    };

    let (_, sandbox) = controller.into_parts();
    finish(config, repo_root, manager, &sandbox, &outcome)?;

    if outcome.exit_code() != 0 {
        eprintln!("[covloop] Session log: {}", audit_file.display());
    }
    if *shutdown.borrow() {
        return Err(Error::Interrupted);
    }
    Ok(outcome.exit_code())
}

fn finish(
    config: &Config,
    repo_root: &Path,
    manager: &SandboxManager,
    sandbox: &Sandbox,
    outcome: &ControllerOutcome,
) -> Result<()> {
    eprintln!(
        "[covloop] Session {}: {:.1}% of changed lines covered after {} iteration(s), {} failing test(s)",
        outcome.state,
        outcome.coverage_ratio * 100.0,
        outcome.iterations,
        outcome.failing_tests
    );

    if let Some(ref out) = config.patch_out {
        let patch = sandbox.export_patch()?;
        let path = resolve_dir(repo_root, out);
        std::fs::write(&path, &patch)?;
        info!(path = %path.display(), bytes = patch.len(), "wrote patch");
        eprintln!("[covloop] Patch: {}", path.display());
    }

    if config.keep_sandbox {
        eprintln!("[covloop] Sandbox kept at {}", sandbox.root().display());
    } else if let Err(e) = manager.remove(sandbox.root()) {
        warn!(error = %e, "sandbox left behind");
    }
    Ok(())
}

fn exit_code_for(session: &Session) -> i32 {
    ControllerOutcome {
        state: session.state,
        iterations: session.iteration,
        coverage_ratio: session.coverage.coverage_ratio(),
        failing_tests: session.failing_tests().count(),
    }
    .exit_code()
}

/// Phase 1 only: measure the change once in a throwaway sandbox.
async fn analyze(config: &Config, repo_root: &Path, filter: Option<&str>) -> Result<i32> {
    config.require_test_command()?;
    let (base, change_set) = compute_change_set(config, repo_root)?;

    let manager = SandboxManager::new(
        repo_root.to_path_buf(),
        resolve_dir(repo_root, &config.sandbox_dir),
    );
    let sandbox = manager.create(&format!("analyze-{}", new_session_id()), &config.head_ref)?;
    let runner = CommandTestRunner::new(&config.runner, sandbox.root().to_path_buf());
    let retry = RetryPolicy::new(config.runner.retries, config.runner.backoff_ms, None);
    let result = measure(&runner, &change_set, filter, retry).await;

    if !config.keep_sandbox
        && let Err(e) = manager.remove(sandbox.root())
    {
        warn!(error = %e, "sandbox left behind");
    }
    let measurement = result?;
    let report = &measurement.report;

    println!("Changed lines {base}...{}", config.head_ref);
    println!(
        "Coverage: {:.1}% ({}/{} changed lines), target {:.1}%",
        report.coverage_ratio() * 100.0,
        report.covered_lines(),
        report.total_lines(),
        config.target_coverage
    );
    let regions = report.uncovered_regions();
    if !regions.is_empty() {
        println!("Uncovered:");
        for region in &regions {
            println!(
                "  {}:{}-{}",
                region.file,
                region.first_line(),
                region.last_line()
            );
        }
    }
    let failing: Vec<_> = measurement
        .outcomes
        .iter()
        .filter(|o| o.is_failing())
        .collect();
    if !failing.is_empty() {
        println!("Failing tests:");
        for outcome in &failing {
            println!("  {} ({})", outcome.id, outcome.signature());
        }
    }

    let met = failing.is_empty() && report.coverage_ratio() >= config.target_ratio();
    Ok(if met { 0 } else { 2 })
}
