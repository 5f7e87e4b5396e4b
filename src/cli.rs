use clap::{Parser, Subcommand};

/// covloop: raise test coverage of a change with an LLM in the loop
#[derive(Parser, Debug, Clone)]
#[command(name = "covloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    /// Path to config file (default: .covloop.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Base ref of the change (default: auto-detect origin/main, origin/master, main, master)
    #[arg(long, global = true)]
    pub base: Option<String>,

    /// Head ref of the change (default: HEAD)
    #[arg(long, global = true)]
    pub head: Option<String>,

    /// Target coverage of changed lines, in percent
    #[arg(long, global = true)]
    pub target_coverage: Option<f64>,

    /// Maximum number of LLM repair iterations
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Only generate tests for coverage gaps; never repair failing tests
    #[arg(long, global = true)]
    pub no_auto_fix: bool,

    /// LLM provider (openai, anthropic, google, azure, ollama, groq, openrouter, command)
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Model name for the LLM provider
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Shell command that runs the test suite and writes coverage
    #[arg(long, global = true)]
    pub test_command: Option<String>,

    /// Answer escalations without a human (retry, accept, abandon)
    #[arg(long, global = true)]
    pub auto_decision: Option<String>,

    /// Number of repair targets sent to the LLM concurrently
    #[arg(long, global = true)]
    pub max_parallel_repairs: Option<usize>,

    /// Consecutive unresolved attempts before a target is escalated
    #[arg(long, global = true)]
    pub escalation_threshold: Option<u32>,

    /// Ask the decision gate to approve every generated patch
    #[arg(long, global = true)]
    pub approve_patches: bool,

    /// Keep the sandbox worktree after the session ends
    #[arg(long, global = true)]
    pub keep_sandbox: bool,

    /// Write the accepted changes as a git patch to this path
    #[arg(long, global = true)]
    pub patch_out: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Run the full measure → repair → re-measure loop (default)
    Run,

    /// Measure coverage of the change and report failing tests, without the LLM
    Analyze {
        /// Only run tests matching this selector
        #[arg(long)]
        filter: Option<String>,
    },

    /// Continue a persisted session, e.g. one suspended at an escalation prompt
    Resume {
        /// Session id printed when the session was suspended
        #[arg(long)]
        session: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let cli = Cli::parse_from(["covloop"]);
        assert!(cli.command.is_none());
        assert!(!cli.no_auto_fix);
        assert!(!cli.approve_patches);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "covloop",
            "run",
            "--base",
            "origin/develop",
            "--target-coverage",
            "90",
            "--max-iterations",
            "3",
            "--provider",
            "anthropic",
            "--model",
            "claude-sonnet",
            "--auto-decision",
            "abandon",
        ]);
        assert!(matches!(cli.command, Some(CliCommand::Run)));
        assert_eq!(cli.base.as_deref(), Some("origin/develop"));
        assert_eq!(cli.target_coverage, Some(90.0));
        assert_eq!(cli.max_iterations, Some(3));
        assert_eq!(cli.provider.as_deref(), Some("anthropic"));
        assert_eq!(cli.model.as_deref(), Some("claude-sonnet"));
        assert_eq!(cli.auto_decision.as_deref(), Some("abandon"));
    }

    #[test]
    fn test_parse_global_args_before_subcommand() {
        let cli = Cli::parse_from(["covloop", "--no-auto-fix", "--head", "feature", "analyze"]);
        assert!(cli.no_auto_fix);
        assert_eq!(cli.head.as_deref(), Some("feature"));
        assert!(matches!(cli.command, Some(CliCommand::Analyze { filter: None })));
    }

    #[test]
    fn test_parse_analyze_with_filter() {
        let cli = Cli::parse_from(["covloop", "analyze", "--filter", "parser::"]);
        match cli.command {
            Some(CliCommand::Analyze { filter }) => assert_eq!(filter.as_deref(), Some("parser::")),
            _ => panic!("expected Analyze subcommand"),
        }
    }

    #[test]
    fn test_parse_resume_requires_session() {
        assert!(Cli::try_parse_from(["covloop", "resume"]).is_err());
        let cli = Cli::parse_from(["covloop", "resume", "--session", "1700000000-42"]);
        match cli.command {
            Some(CliCommand::Resume { session }) => assert_eq!(session, "1700000000-42"),
            _ => panic!("expected Resume subcommand"),
        }
    }
}
