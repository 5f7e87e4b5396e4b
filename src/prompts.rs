use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

const DEFAULT_SYSTEM: &str = include_str!("default_prompts/system.md");
const DEFAULT_REPAIR: &str = include_str!("default_prompts/repair.md");
const DEFAULT_GENERATE: &str = include_str!("default_prompts/generate.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Standing instructions sent as the provider's system context.
    System,
    Repair,
    Generate,
}

impl PromptKind {
    fn file_name(&self) -> &'static str {
        match self {
            PromptKind::System => "system.md",
            PromptKind::Repair => "repair.md",
            PromptKind::Generate => "generate.md",
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            PromptKind::System => DEFAULT_SYSTEM,
            PromptKind::Repair => DEFAULT_REPAIR,
            PromptKind::Generate => DEFAULT_GENERATE,
        }
    }
}

/// A source file shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairPromptVars {
    pub test_id: String,
    pub status: String,
    pub reason: String,
    pub diagnostic: String,
    pub files: Vec<SourceFile>,
    pub has_prefixes: bool,
    pub test_path_prefixes: Vec<String>,
    pub has_previous: bool,
    pub previous_attempts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratePromptVars {
    pub file: String,
    pub first_line: u32,
    pub last_line: u32,
    pub excerpt: String,
    pub files: Vec<SourceFile>,
    pub has_prefixes: bool,
    pub test_path_prefixes: Vec<String>,
    pub has_previous: bool,
    pub previous_attempts: Vec<String>,
}

/// Prompt templates: embedded defaults, overridable per file from a
/// directory. Templates use `upon` syntax.
pub struct PromptEngine {
    override_dir: Option<String>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<String>) -> Self {
        Self { override_dir }
    }

    pub fn load_template(&self, kind: PromptKind) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(kind.file_name());
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(kind.default_template().to_string())
    }

    /// The system template is plain text and is not rendered.
    pub fn system(&self) -> Result<String> {
        self.load_template(PromptKind::System)
    }

    pub fn render_repair(&self, vars: &RepairPromptVars) -> Result<String> {
        render(&self.load_template(PromptKind::Repair)?, vars)
    }

    pub fn render_generate(&self, vars: &GeneratePromptVars) -> Result<String> {
        render(&self.load_template(PromptKind::Generate)?, vars)
    }
}

/// Render an `upon` template. Unknown variables are errors.
pub fn render(template: &str, vars: &impl Serialize) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("invalid template: {e}")))?;
    compiled
        .render(&engine, vars)
        .to_string()
        .map_err(|e| Error::Prompt(format!("failed to render template: {e}")))
}
