//! Provider command builder.
//!
//! Maps a logical agent request onto the concrete argv/stdin of one external
//! coding-agent CLI. The mapping is pure: no environment lookups, no
//! filesystem access. Adding a provider means adding one variant and one
//! `*_command` function; callers only ever see [`ProviderCommand`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported external agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

/// Wire protocol family spoken on a provider's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `stream-json` records keyed by `type` (claude, and the gemini adapter).
    ClaudeStream,
    /// `codex exec --json` thread/turn/item records.
    CodexJson,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::Gemini];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Ambient context file the CLI reads from its working directory.
    pub fn context_file(self) -> &'static str {
        match self {
            Provider::Claude => "CLAUDE.md",
            Provider::Codex => "AGENTS.md",
            Provider::Gemini => "GEMINI.md",
        }
    }

    /// Only providers with a model-fallback chain accept `--model`.
    pub fn supports_model_override(self) -> bool {
        matches!(self, Provider::Gemini)
    }

    pub fn supports_continuation(self) -> bool {
        !matches!(self, Provider::Gemini)
    }

    pub fn protocol(self) -> Protocol {
        match self {
            Provider::Claude | Provider::Gemini => Protocol::ClaudeStream,
            Provider::Codex => Protocol::CodexJson,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| BuildError::UnknownProvider(s.trim().to_string()))
    }
}

/// Errors raised before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("unknown provider '{0}' (expected one of: claude, codex, gemini)")]
    UnknownProvider(String),
    #[error("provider {0} does not accept a model override")]
    ModelOverrideUnsupported(Provider),
    #[error("prompt must not be empty")]
    EmptyPrompt,
}

/// Requested stdout format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Line-delimited JSON records.
    #[default]
    Stream,
    /// Plain final text (used for one-shot summaries).
    Text,
}

/// Logical request, independent of any provider's flag grammar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Resume the provider's previous session in the working directory.
    pub continue_session: bool,
    pub model_override: Option<String>,
    /// Provider-native tool allowlist (e.g. `"Read,Edit,Bash"`).
    pub allowed_tools: Option<String>,
    /// Project directory the agent must be allowed to edit.
    pub work_dir: Option<PathBuf>,
    pub output: OutputMode,
}

/// Fully resolved process invocation. `argv[0]` is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCommand {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

impl ProviderCommand {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

/// Build the invocation for `provider`.
pub fn build(provider: Provider, request: &CommandRequest) -> Result<ProviderCommand, BuildError> {
    if request.prompt.trim().is_empty() {
        return Err(BuildError::EmptyPrompt);
    }
    if request.model_override.is_some() && !provider.supports_model_override() {
        return Err(BuildError::ModelOverrideUnsupported(provider));
    }
    Ok(match provider {
        Provider::Claude => claude_command(request),
        Provider::Codex => codex_command(request),
        Provider::Gemini => gemini_command(request),
    })
}

/// Resolve a provider by name, then build. Unknown names fail before anything runs.
pub fn build_named(name: &str, request: &CommandRequest) -> Result<ProviderCommand, BuildError> {
    build(name.parse()?, request)
}

fn claude_command(request: &CommandRequest) -> ProviderCommand {
    let mut argv = vec!["claude".to_string()];
    if request.continue_session {
        argv.push("--continue".to_string());
    }
    argv.push("-p".to_string());
    argv.push(request.prompt.clone());
    argv.push("--output-format".to_string());
    argv.push(
        match request.output {
            OutputMode::Stream => "stream-json",
            OutputMode::Text => "text",
        }
        .to_string(),
    );
    argv.push("--dangerously-skip-permissions".to_string());
    if let Some(tools) = &request.allowed_tools {
        argv.push("--allowedTools".to_string());
        argv.push(tools.clone());
    }
    if let Some(dir) = &request.work_dir {
        argv.push("--add-dir".to_string());
        argv.push(dir.display().to_string());
    }
    if let Some(system) = &request.system_prompt {
        argv.push("--append-system-prompt".to_string());
        argv.push(system.clone());
    }
    // stream-json requires --verbose in print mode
    if request.output == OutputMode::Stream {
        argv.push("--verbose".to_string());
    }
    ProviderCommand { argv, stdin: None }
}

fn codex_command(request: &CommandRequest) -> ProviderCommand {
    let mut argv = vec!["codex".to_string(), "exec".to_string()];
    if request.output == OutputMode::Stream {
        argv.push("--json".to_string());
    }
    argv.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    argv.push("--skip-git-repo-check".to_string());
    if let Some(dir) = &request.work_dir {
        argv.push("--add-dir".to_string());
        argv.push(dir.display().to_string());
    }
    if request.continue_session {
        argv.push("resume".to_string());
        argv.push("--last".to_string());
    }
    argv.push("-".to_string());

    // codex has no system prompt flag; it is prepended to the piped prompt
    let stdin = match &request.system_prompt {
        Some(system) => format!("{system}\n\n{}", request.prompt),
        None => request.prompt.clone(),
    };
    ProviderCommand {
        argv,
        stdin: Some(stdin),
    }
}

fn gemini_command(request: &CommandRequest) -> ProviderCommand {
    let mut argv = vec![
        "gemini".to_string(),
        "--prompt".to_string(),
        request.prompt.clone(),
    ];
    if let Some(system) = &request.system_prompt {
        argv.push("--system-prompt".to_string());
        argv.push(system.clone());
    }
    argv.push("--output-format".to_string());
    argv.push(
        match request.output {
            OutputMode::Stream => "stream-json",
            OutputMode::Text => "text",
        }
        .to_string(),
    );
    if let Some(tools) = &request.allowed_tools {
        argv.push("--allowed-tools".to_string());
        argv.push(tools.clone());
    }
    if let Some(model) = &request.model_override {
        argv.push("--model".to_string());
        argv.push(model.clone());
    }
    argv.push("--yolo".to_string());
    ProviderCommand { argv, stdin: None }
}
