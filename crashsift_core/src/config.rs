use crate::session::{InputDelivery, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Argument placeholder replaced by the current-input path when the target is launched.
pub const INPUT_PLACEHOLDER: &str = "@@";

/// Stack-frame depths above this are allowed but produce long, noisy keys.
const MAX_SENSIBLE_STACKFRAMES: u32 = 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Target command is empty")]
    EmptyCommand,
    #[error("Session timeout must be at least one second")]
    ZeroTimeout,
    #[error("Stack frame depth must be at least one")]
    ZeroStackFrames,
    #[error("Input and output directories can't be the same: {0:?}")]
    SameDirectories(PathBuf),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Vec<String>,
    #[serde(default = "default_cur_input_path")]
    pub cur_input_path: PathBuf,
}

pub fn default_cur_input_path() -> PathBuf {
    PathBuf::from("./.crashsift/cur_input")
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_stackframe_num")]
    pub stackframe_num: u32,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_snapshot_wait_ms")]
    pub snapshot_wait_ms: u64,
}

fn default_port() -> u16 {
    5555
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_stackframe_num() -> u32 {
    6
}

fn default_grace_ms() -> u64 {
    2000
}

fn default_snapshot_wait_ms() -> u64 {
    500
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            stackframe_num: default_stackframe_num(),
            grace_ms: default_grace_ms(),
            snapshot_wait_ms: default_snapshot_wait_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    #[serde(default = "default_debugger")]
    pub debugger: PathBuf,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

pub fn default_debugger() -> PathBuf {
    PathBuf::from("/usr/bin/gdb")
}

pub fn default_workspace() -> PathBuf {
    PathBuf::from("./.crashsift")
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            debugger: default_debugger(),
            workspace: default_workspace(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageConfig {
    #[serde(default)]
    pub debug: bool,
    pub target: TargetSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    pub corpus: CorpusSettings,
}

impl TriageConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Rejects settings that would make every session meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.command.is_empty() || self.target.command[0].is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.session.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.session.stackframe_num == 0 {
            return Err(ConfigError::ZeroStackFrames);
        }
        if self.session.stackframe_num > MAX_SENSIBLE_STACKFRAMES {
            log::warn!(
                "Dangerously large stack frame depth: {}",
                self.session.stackframe_num
            );
        }
        if same_path(&self.corpus.input_dir, &self.corpus.output_dir) {
            return Err(ConfigError::SameDirectories(self.corpus.input_dir.clone()));
        }
        Ok(())
    }

    /// Target argument vector with every `@@` replaced by the current-input path.
    pub fn resolved_command(&self) -> Vec<String> {
        let cur_input = self.target.cur_input_path.to_string_lossy();
        self.target
            .command
            .iter()
            .map(|arg| {
                if arg == INPUT_PLACEHOLDER {
                    cur_input.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    /// Without `@@` on the command line the current input goes to stdin.
    pub fn input_delivery(&self) -> InputDelivery {
        if self.target.command.iter().any(|arg| arg == INPUT_PLACEHOLDER) {
            InputDelivery::Argument
        } else {
            InputDelivery::Stdin(self.target.cur_input_path.clone())
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command: self.resolved_command(),
            port: self.session.port,
            deadline: Duration::from_secs(self.session.timeout_secs),
            stackframe_num: self.session.stackframe_num,
            grace: Duration::from_millis(self.session.grace_ms),
            snapshot_wait: Duration::from_millis(self.session.snapshot_wait_ms),
            input_delivery: self.input_delivery(),
        }
    }
}

/// Compares canonical forms when both paths exist, raw forms otherwise.
pub fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
