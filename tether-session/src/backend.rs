//! Agent backends and their argument vectors.

use std::path::PathBuf;

use tether_api::{ConversationConfig, PermissionPolicy};
use tether_stream::EchoPolicy;

/// Read-oriented tools allowed under [`PermissionPolicy::Guarded`].
pub const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch"];

/// The agent CLI a conversation talks to.
#[derive(Debug, Clone)]
pub struct Backend {
    pub program: PathBuf,
    /// Arguments placed before the generated flags.
    pub leading_args: Vec<String>,
    pub echo: EchoPolicy,
    /// MCP tool that answers permission prompts under [`PermissionPolicy::Supervised`].
    pub permission_prompt_tool: Option<String>,
    /// Extra environment for the subprocess.
    pub env: Vec<(String, String)>,
}

impl Default for Backend {
    fn default() -> Self {
        Self::claude()
    }
}

impl Backend {
    /// The Claude Code CLI, found on `PATH`.
    pub fn claude() -> Self {
        Self::custom("claude")
    }

    pub fn custom(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            echo: EchoPolicy::Suppress,
            permission_prompt_tool: None,
            env: vec![
                ("NO_COLOR".to_string(), "1".to_string()),
                ("TERM".to_string(), "dumb".to_string()),
            ],
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_echo(mut self, echo: EchoPolicy) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_permission_prompt_tool(mut self, tool: impl Into<String>) -> Self {
        self.permission_prompt_tool = Some(tool.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }
}

/// Everything needed to start one subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Passed as the spawn's working directory, never on the command line.
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

/// Build the command line for sending `prompt` under `config`.
pub fn build_invocation(backend: &Backend, config: &ConversationConfig, prompt: &str) -> Invocation {
    let mut args = backend.leading_args.clone();

    // Non-interactive streaming
    args.extend(["-p".to_string(), prompt.to_string()]);
    args.extend(["--output-format".to_string(), "stream-json".to_string()]);
    args.push("--verbose".to_string());
    args.push("--include-partial-messages".to_string());

    if let Some(resume_id) = config.resume_id.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--resume".to_string(), resume_id.to_string()]);
    }

    if let Some(model) = config.model.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--model".to_string(), model.to_string()]);
    }

    match config.permission_policy {
        PermissionPolicy::Open => {
            args.extend(["--permission-mode".to_string(), "bypassPermissions".to_string()]);
        }
        PermissionPolicy::Guarded => {
            args.extend(["--allowedTools".to_string(), READ_ONLY_TOOLS.join(",")]);
        }
        PermissionPolicy::Supervised => {
            args.extend(["--permission-mode".to_string(), "default".to_string()]);
            if let Some(tool) = &backend.permission_prompt_tool {
                args.extend(["--permission-prompt-tool".to_string(), tool.clone()]);
            }
        }
        PermissionPolicy::Default => {}
    }

    if let Some(prompt) = config.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--append-system-prompt".to_string(), prompt.to_string()]);
    }

    Invocation {
        program: backend.program.clone(),
        args,
        cwd: config.working_directory.clone(),
        env: backend.env.clone(),
    }
}
