use crate::config::BackendSettings;
use crate::process::BackendProcess;
use crate::session::{InputDelivery, SessionConfig};
use crate::snapshot::SnapshotStore;
use log::debug;
use serde::Serialize;
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const COMMAND_FILE: &str = "cmd.gdb";
pub const HOOK_FILE: &str = "gdb_hook.py";
pub const HOOK_CONFIG_FILE: &str = "backend.json";

const HOOK_SCRIPT: &str = include_str!("../assets/gdb_hook.py");

/// Makes sanitizer-detected faults end in an abort the debugger can stop on.
pub const ASAN_OPTIONS_DEFAULT: &str =
    "abort_on_error=1:detect_leaks=0:symbolize=0:allocator_may_return_null=1";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to prepare backend workspace {path:?}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize backend settings: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("Failed to launch debugger {debugger:?}: {source}")]
    Launch {
        debugger: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Launches one debug backend per session.
pub trait Backend: Send {
    /// Starts the backend for `command`. The backend connects back on its own.
    fn launch(&mut self, command: &[String]) -> Result<Box<dyn BackendProcess>, BackendError>;
}

#[derive(Serialize, Debug)]
struct HookSettings<'a> {
    port: u16,
    stackframe_num: u32,
    snapshot_path: &'a Path,
}

/// Drives the target under gdb with the embedded hook script.
#[derive(Debug)]
pub struct GdbBackend {
    debugger: PathBuf,
    workspace: PathBuf,
    asan_options: String,
}

impl GdbBackend {
    /// Creates the workspace and installs the command file, hook script and
    /// hook settings into it.
    pub fn prepare(
        settings: &BackendSettings,
        session: &SessionConfig,
    ) -> Result<Self, BackendError> {
        let workspace = std::path::absolute(&settings.workspace).map_err(|source| {
            BackendError::Workspace {
                path: settings.workspace.clone(),
                source,
            }
        })?;
        fs::create_dir_all(&workspace).map_err(|source| BackendError::Workspace {
            path: workspace.clone(),
            source,
        })?;

        let backend = Self {
            debugger: settings.debugger.clone(),
            workspace,
            asan_options: asan_options(std::env::var("ASAN_OPTIONS").ok()),
        };

        let snapshot = backend.snapshot_store();
        let hook_settings = HookSettings {
            port: session.port,
            stackframe_num: session.stackframe_num,
            snapshot_path: snapshot.path(),
        };
        let config_path = backend.workspace.join(HOOK_CONFIG_FILE);
        backend.install(&config_path, &serde_json::to_string_pretty(&hook_settings)?)?;
        backend.install(
            &backend.workspace.join(HOOK_FILE),
            &render_hook(&config_path)?,
        )?;
        backend.install(
            &backend.workspace.join(COMMAND_FILE),
            &command_file(&backend.workspace.join(HOOK_FILE), &session.input_delivery),
        )?;
        debug!("[backend] workspace prepared at {:?}", backend.workspace);
        Ok(backend)
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The record the hook script writes into the workspace.
    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::in_workspace(&self.workspace)
    }

    fn install(&self, path: &Path, contents: &str) -> Result<(), BackendError> {
        fs::write(path, contents).map_err(|source| BackendError::Workspace {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Backend for GdbBackend {
    fn launch(&mut self, command: &[String]) -> Result<Box<dyn BackendProcess>, BackendError> {
        let mut cmd = Command::new(&self.debugger);
        cmd.arg("-q")
            .arg("-x")
            .arg(self.workspace.join(COMMAND_FILE))
            .arg("--args")
            .args(command)
            .env("ASAN_OPTIONS", &self.asan_options)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Keep operator Ctrl-C away from the debugger; teardown is explicit.
            .process_group(0);

        debug!("[backend] running {:?} with target {:?}", self.debugger, command);
        let child = cmd.spawn().map_err(|source| BackendError::Launch {
            debugger: self.debugger.clone(),
            source,
        })?;
        Ok(Box::new(child))
    }
}

/// An operator-provided `ASAN_OPTIONS` wins over the defaults.
fn asan_options(existing: Option<String>) -> String {
    match existing {
        Some(options) if !options.is_empty() => options,
        _ => ASAN_OPTIONS_DEFAULT.to_string(),
    }
}

fn command_file(hook: &Path, delivery: &InputDelivery) -> String {
    let run = match delivery {
        InputDelivery::Argument => "run".to_string(),
        InputDelivery::Stdin(path) => format!("run < {}", path.display()),
    };
    format!(
        "set confirm off\n\
         set pagination off\n\
         set auto-solib-add on\n\
         set disable-randomization on\n\
         source {}\n\
         {run}\n",
        hook.display()
    )
}

fn render_hook(config_path: &Path) -> Result<String, serde_json::Error> {
    // A JSON string literal is also a valid Python string literal.
    let literal = serde_json::to_string(config_path)?;
    Ok(format!("CONFIG_PATH = {literal}\n{HOOK_SCRIPT}"))
}
