//! Command-line arguments.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_api::{ConversationConfig, ConversationId, PermissionPolicy};
use tether_session::Backend;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Talk to a coding agent from the terminal")]
#[command(version)]
pub struct Args {
    /// Working directory for the agent (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Model passed to the agent
    #[arg(short, long)]
    pub model: Option<String>,

    /// Permission policy: open, guarded, supervised or default
    #[arg(short, long, default_value = "default")]
    pub permission: PermissionPolicy,

    /// MCP tool that answers permission prompts in supervised mode
    #[arg(long)]
    pub permission_prompt_tool: Option<String>,

    /// Text appended to the agent's system prompt
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Resume an agent session by id
    #[arg(long)]
    pub resume: Option<String>,

    /// Conversation name; its last resume id is restored from the store
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// Agent executable
    #[arg(long, default_value = "claude")]
    pub claude_bin: PathBuf,

    /// Transcript database (defaults to <data dir>/tether/transcripts.db)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Don't record transcripts
    #[arg(long)]
    pub no_store: bool,

    /// List stored conversations and exit
    #[arg(long)]
    pub list: bool,

    /// Print the stored transcript of --conversation before starting
    #[arg(long)]
    pub history: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(data_dir.join("tether").join("transcripts.db"))
    }

    pub fn working_directory(&self) -> Result<PathBuf> {
        let path = match &self.cwd {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        if !path.is_dir() {
            anyhow::bail!("Path '{}' is not a directory", path.display());
        }
        Ok(path)
    }

    pub fn conversation_id(&self) -> ConversationId {
        match &self.conversation {
            Some(name) => ConversationId::from(name.as_str()),
            None => ConversationId::random(),
        }
    }

    /// Configuration for the first send; `stored_resume_id` is used unless
    /// `--resume` was given.
    pub fn conversation_config(
        &self,
        working_directory: PathBuf,
        stored_resume_id: Option<String>,
    ) -> ConversationConfig {
        let mut config =
            ConversationConfig::new(working_directory).with_permission_policy(self.permission);
        if let Some(resume_id) = self.resume.clone().or(stored_resume_id) {
            config = config.with_resume_id(resume_id);
        }
        if let Some(model) = &self.model {
            config = config.with_model(model);
        }
        if let Some(prompt) = &self.system_prompt {
            config = config.with_system_prompt(prompt);
        }
        config
    }

    pub fn backend(&self) -> Backend {
        let backend = Backend::custom(&self.claude_bin);
        match &self.permission_prompt_tool {
            Some(tool) => backend.with_permission_prompt_tool(tool),
            None => backend,
        }
    }
}
