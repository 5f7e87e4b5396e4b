use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::cli::Cli;
use crate::coverage::CoverageFormat;
use crate::error::{Error, Result};
use crate::gate::AutoDecision;
use crate::llm::ProviderKind;

pub const DEFAULT_CONFIG_PATH: &str = ".covloop.toml";

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub target_coverage: Option<f64>,
    pub max_iterations: Option<u32>,
    pub auto_fix_broken_tests: Option<bool>,
    pub escalation_threshold: Option<u32>,
    pub max_parallel_repairs: Option<usize>,
    pub approve_patches: Option<bool>,
    pub auto_decision: Option<String>,
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
    pub include_extensions: Option<Vec<String>>,
    pub test_path_prefixes: Option<Vec<String>>,
    pub sandbox_dir: Option<String>,
    pub state_dir: Option<String>,
    pub max_context_bytes: Option<usize>,
    pub prompts_dir: Option<String>,
    pub runner: Option<RunnerFile>,
    pub llm: Option<LlmFile>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerFile {
    pub command: Option<String>,
    pub coverage_file: Option<String>,
    pub coverage_format: Option<String>,
    pub results_file: Option<String>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmFile {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<u64>,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub api_version: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub retries: Option<u32>,
    pub backoff_ms: Option<u64>,
}

/// Settings for the test runner adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub command: String,
    pub coverage_file: String,
    pub coverage_format: CoverageFormat,
    pub results_file: Option<String>,
    pub timeout: Option<u64>,
    pub retries: u32,
    pub backoff_ms: u64,
}

/// Settings for the LLM provider client. The API key is resolved once, in
/// [`Config::load`], and never printed.
#[derive(Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: u64,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("retries", &self.retries)
            .field("backoff_ms", &self.backoff_ms)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Stop condition, as a percentage of changed lines (0-100).
    pub target_coverage: f64,
    pub max_iterations: u32,
    pub auto_fix_broken_tests: bool,
    pub escalation_threshold: u32,
    pub max_parallel_repairs: usize,
    pub approve_patches: bool,
    pub auto_decision: Option<AutoDecision>,
    pub base_ref: Option<String>,
    pub head_ref: String,
    pub include_extensions: Vec<String>,
    pub test_path_prefixes: Vec<String>,
    pub sandbox_dir: String,
    pub state_dir: String,
    pub max_context_bytes: usize,
    /// Directory with template overrides (`system.md`, `repair.md`, `generate.md`).
    pub prompts_dir: Option<String>,
    pub keep_sandbox: bool,
    pub patch_out: Option<String>,
    pub runner: RunnerConfig,
    pub llm: LlmConfig,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config.as_deref() {
            Some(explicit) => {
                let path = Path::new(explicit);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let mut config = merge(file_config, cli)?;
        config.llm.api_key = resolve_api_key(&config.llm);
        Ok(config)
    }

    /// Target coverage as a ratio in [0, 1].
    pub fn target_ratio(&self) -> f64 {
        self.target_coverage / 100.0
    }

    /// The runner command is only needed once tests actually run.
    pub fn require_test_command(&self) -> Result<&str> {
        if self.runner.command.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "runner.command is required (set it in the config file or pass --test-command)"
                    .to_string(),
            ));
        }
        Ok(&self.runner.command)
    }
}

/// Read the API key from the configured variable, falling back to the
/// provider's conventional one.
fn resolve_api_key(llm: &LlmConfig) -> Option<String> {
    let var = llm
        .api_key_env
        .as_deref()
        .or_else(|| llm.provider.default_api_key_env())?;
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(target) = config.target_coverage {
        check_target(target)?;
    }
    if config.max_iterations == Some(0) {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }
    if config.escalation_threshold == Some(0) {
        return Err(Error::ConfigValidation(
            "escalation_threshold must be > 0".to_string(),
        ));
    }
    if config.max_parallel_repairs == Some(0) {
        return Err(Error::ConfigValidation(
            "max_parallel_repairs must be > 0".to_string(),
        ));
    }
    if let Some(ref decision) = config.auto_decision {
        decision.parse::<AutoDecision>()?;
    }
    if let Some(ref runner) = config.runner {
        if let Some(ref format) = runner.coverage_format {
            format.parse::<CoverageFormat>()?;
        }
        if runner.timeout == Some(0) {
            return Err(Error::ConfigValidation(
                "runner.timeout must be > 0".to_string(),
            ));
        }
    }
    if let Some(ref llm) = config.llm {
        if let Some(ref provider) = llm.provider {
            provider.parse::<ProviderKind>()?;
        }
        if let Some(temperature) = llm.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(Error::ConfigValidation(format!(
                "llm.temperature must be within 0.0..=2.0, got {temperature}"
            )));
        }
        if llm.timeout == Some(0) {
            return Err(Error::ConfigValidation(
                "llm.timeout must be > 0".to_string(),
            ));
        }
    }
    Ok(())
}

fn check_target(target: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&target) {
        return Err(Error::ConfigValidation(format!(
            "target_coverage must be a percentage within 0..=100, got {target}"
        )));
    }
    Ok(())
}

/// Combine file values with CLI overrides. CLI wins, then file, then defaults.
pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let runner_file = file.runner.unwrap_or_default();
    let llm_file = file.llm.unwrap_or_default();

    let target_coverage = cli.target_coverage.or(file.target_coverage).unwrap_or(80.0);
    check_target(target_coverage)?;

    let max_iterations = cli.max_iterations.or(file.max_iterations).unwrap_or(5);
    if max_iterations == 0 {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }

    let escalation_threshold = cli
        .escalation_threshold
        .or(file.escalation_threshold)
        .unwrap_or(2);
    if escalation_threshold == 0 {
        return Err(Error::ConfigValidation(
            "escalation_threshold must be > 0".to_string(),
        ));
    }

    let max_parallel_repairs = cli
        .max_parallel_repairs
        .or(file.max_parallel_repairs)
        .unwrap_or(1);
    if max_parallel_repairs == 0 {
        return Err(Error::ConfigValidation(
            "max_parallel_repairs must be > 0".to_string(),
        ));
    }

    let auto_decision = cli
        .auto_decision
        .clone()
        .or(file.auto_decision)
        .map(|d| d.parse::<AutoDecision>())
        .transpose()?;

    let provider = cli
        .provider
        .clone()
        .or(llm_file.provider)
        .map(|p| p.parse::<ProviderKind>())
        .transpose()?
        .unwrap_or(ProviderKind::OpenAi);

    let coverage_format = runner_file
        .coverage_format
        .map(|f| f.parse::<CoverageFormat>())
        .transpose()?
        .unwrap_or(CoverageFormat::Lcov);

    let model = cli
        .model
        .clone()
        .or(llm_file.model)
        .unwrap_or_else(|| provider.default_model().to_string());

    Ok(Config {
        target_coverage,
        max_iterations,
        auto_fix_broken_tests: !cli.no_auto_fix && file.auto_fix_broken_tests.unwrap_or(true),
        escalation_threshold,
        max_parallel_repairs,
        approve_patches: cli.approve_patches || file.approve_patches.unwrap_or(false),
        auto_decision,
        base_ref: cli.base.clone().or(file.base_ref),
        head_ref: cli
            .head
            .clone()
            .or(file.head_ref)
            .unwrap_or_else(|| "HEAD".to_string()),
        include_extensions: file.include_extensions.unwrap_or_default(),
        test_path_prefixes: file.test_path_prefixes.unwrap_or_default(),
        sandbox_dir: file
            .sandbox_dir
            .unwrap_or_else(|| "../covloop-sandboxes".to_string()),
        state_dir: file.state_dir.unwrap_or_else(|| ".covloop".to_string()),
        max_context_bytes: file.max_context_bytes.unwrap_or(60_000),
        prompts_dir: file.prompts_dir,
        keep_sandbox: cli.keep_sandbox,
        patch_out: cli.patch_out.clone(),
        runner: RunnerConfig {
            command: cli
                .test_command
                .clone()
                .or(runner_file.command)
                .unwrap_or_default(),
            coverage_file: runner_file
                .coverage_file
                .unwrap_or_else(|| "lcov.info".to_string()),
            coverage_format,
            results_file: runner_file.results_file,
            timeout: runner_file.timeout,
            retries: runner_file.retries.unwrap_or(2),
            backoff_ms: runner_file.backoff_ms.unwrap_or(500),
        },
        llm: LlmConfig {
            provider,
            model,
            temperature: llm_file.temperature.unwrap_or(0.7),
            max_tokens: llm_file.max_tokens.unwrap_or(4000),
            timeout: llm_file.timeout.unwrap_or(120),
            base_url: llm_file.base_url,
            api_key_env: llm_file.api_key_env,
            api_key: None,
            api_version: llm_file.api_version,
            command: llm_file.command,
            args: llm_file.args.unwrap_or_default(),
            retries: llm_file.retries.unwrap_or(2),
            backoff_ms: llm_file.backoff_ms.unwrap_or(500),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use serial_test::serial;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
target_coverage = 85.5
max_iterations = 4
auto_fix_broken_tests = false
auto_decision = "abandon"
include_extensions = [".rs"]

[runner]
command = "cargo llvm-cov --lcov --output-path lcov.info"
coverage_format = "lcov"
timeout = 600

[llm]
provider = "anthropic"
temperature = 0.2
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.target_coverage, Some(85.5));
        assert_eq!(config.max_iterations, Some(4));
        assert_eq!(config.auto_fix_broken_tests, Some(false));
        assert_eq!(config.runner.unwrap().timeout, Some(600));
        assert_eq!(config.llm.unwrap().provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_target_out_of_range() {
        let err = parse_config("target_coverage = 120.0").unwrap_err();
        assert!(err.to_string().contains("target_coverage"));
    }

    #[test]
    fn test_parse_zero_iterations() {
        let err = parse_config("max_iterations = 0").unwrap_err();
        assert!(err.to_string().contains("max_iterations must be > 0"));
    }

    #[test]
    fn test_parse_invalid_provider() {
        let err = parse_config("[llm]\nprovider = \"skynet\"").unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_parse_invalid_auto_decision() {
        let err = parse_config("auto_decision = \"shrug\"").unwrap_err();
        assert!(err.to_string().contains("unknown auto decision"));
    }

    #[test]
    fn test_parse_invalid_coverage_format() {
        let err = parse_config("[runner]\ncoverage_format = \"cobertura\"").unwrap_err();
        assert!(err.to_string().contains("unknown coverage format"));
    }

    #[test]
    fn test_parse_temperature_out_of_range() {
        let err = parse_config("[llm]\ntemperature = 3.5").unwrap_err();
        assert!(err.to_string().contains("llm.temperature"));
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_parse_unknown_nested_field() {
        let err = parse_config("[runner]\nshell = \"zsh\"").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_defaults_applied() {
        let cli = Cli::parse_from(["covloop"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(config.target_coverage, 80.0);
        assert_eq!(config.max_iterations, 5);
        assert!(config.auto_fix_broken_tests);
        assert_eq!(config.escalation_threshold, 2);
        assert_eq!(config.max_parallel_repairs, 1);
        assert!(config.auto_decision.is_none());
        assert_eq!(config.head_ref, "HEAD");
        assert!(config.base_ref.is_none());
        assert_eq!(config.runner.coverage_file, "lcov.info");
        assert_eq!(config.runner.coverage_format, CoverageFormat::Lcov);
        assert_eq!(config.runner.retries, 2);
        assert_eq!(config.llm.provider, ProviderKind::OpenAi);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.timeout, 120);
        assert!((config.target_ratio() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            target_coverage: Some(70.0),
            max_iterations: Some(8),
            auto_decision: Some("retry".to_string()),
            runner: Some(RunnerFile {
                command: Some("make coverage".to_string()),
                ..Default::default()
            }),
            llm: Some(LlmFile {
                provider: Some("ollama".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cli = Cli::parse_from([
            "covloop",
            "--target-coverage",
            "95",
            "--provider",
            "groq",
            "--no-auto-fix",
        ]);
        let config = merge(file, &cli).unwrap();
        assert_eq!(config.target_coverage, 95.0); // CLI wins
        assert_eq!(config.llm.provider, ProviderKind::Groq); // CLI wins
        assert_eq!(config.llm.model, "llama-3.1-70b-versatile"); // follows provider
        assert_eq!(config.max_iterations, 8); // file value kept
        assert_eq!(config.auto_decision, Some(AutoDecision::Retry)); // file value kept
        assert_eq!(config.runner.command, "make coverage");
        assert!(!config.auto_fix_broken_tests);
    }

    #[test]
    fn test_merge_rejects_cli_out_of_range() {
        let cli = Cli::parse_from(["covloop", "--target-coverage", "150"]);
        assert!(merge(ConfigFile::default(), &cli).is_err());

        let cli = Cli::parse_from(["covloop", "--max-iterations", "0"]);
        assert!(merge(ConfigFile::default(), &cli).is_err());
    }

    #[test]
    fn test_require_test_command() {
        let cli = Cli::parse_from(["covloop"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert!(config.require_test_command().is_err());

        let cli = Cli::parse_from(["covloop", "--test-command", "npm test -- --coverage"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(config.require_test_command().unwrap(), "npm test -- --coverage");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let cli = Cli::parse_from(["covloop"]);
        let mut config = merge(ConfigFile::default(), &cli).unwrap();
        config.llm.api_key = Some("sk-very-secret".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn test_resolve_api_key_prefers_configured_env() {
        unsafe {
            std::env::set_var("COVLOOP_TEST_KEY", "from-custom");
            std::env::set_var("OPENAI_API_KEY", "from-default");
        }
        let cli = Cli::parse_from(["covloop"]);
        let mut config = merge(ConfigFile::default(), &cli).unwrap();
        assert_eq!(resolve_api_key(&config.llm).as_deref(), Some("from-default"));

        config.llm.api_key_env = Some("COVLOOP_TEST_KEY".to_string());
        assert_eq!(resolve_api_key(&config.llm).as_deref(), Some("from-custom"));
        unsafe {
            std::env::remove_var("COVLOOP_TEST_KEY");
            std::env::remove_var("OPENAI_API_KEY");
        }
    }

    #[test]
    #[serial]
    fn test_resolve_api_key_none_for_keyless_provider() {
        let cli = Cli::parse_from(["covloop", "--provider", "ollama"]);
        let config = merge(ConfigFile::default(), &cli).unwrap();
        assert!(resolve_api_key(&config.llm).is_none());
    }
}
