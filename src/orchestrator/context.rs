//! Per-process toolchain context and the per-run accumulator.

use super::strategy::ToolchainStrategy;
use crate::error::RunError;
use crate::flowgraph::FlowGraphPhase;
use crate::loader::LoaderApp;
use crate::process::OutputLine;
use crate::symbol::SymbolTarget;
use rand::RngCore;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Everything a run needs from its surroundings. Built once, shared by every run.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub dotnet: PathBuf,
    /// Loader builds, temp files and flow-graph phases live under here.
    pub temp_root: PathBuf,
    pub tool_version: String,
    /// Receives tool output line by line while it runs.
    pub tool_output: Option<UnboundedSender<OutputLine>>,
    /// Receives one message per state transition.
    pub status: Option<UnboundedSender<String>>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            dotnet: PathBuf::from("dotnet"),
            temp_root: std::env::temp_dir().join("jitdasm"),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            tool_output: None,
            status: None,
        }
    }
}

impl Toolchain {
    pub fn loader(&self) -> LoaderApp {
        LoaderApp::new(&self.dotnet, &self.temp_root, &self.tool_version)
    }

    pub fn report_status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        if let Some(tx) = &self.status {
            let _ = tx.send(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Validating,
    ResolvingProjectConfig,
    Building,
    Executing,
    Postprocessing,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunState::Validating => "Validating...",
            RunState::ResolvingProjectConfig => "Resolving project configuration...",
            RunState::Building => "Building...",
            RunState::Executing => "Executing...",
            RunState::Postprocessing => "Processing output...",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
            RunState::Cancelled => "Cancelled",
        };
        f.write_str(text)
    }
}

/// Scratch files of one run. Removed when the run succeeds or is cancelled, kept for
/// inspection when it fails.
#[derive(Debug, Default)]
pub struct TempArtifacts {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new(temp_root: &Path) -> Self {
        Self {
            dir: temp_root.join("tmp"),
            paths: Vec::new(),
        }
    }

    /// A fresh, tracked path with the given extension. The file is not created.
    pub fn new_path(&mut self, extension: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        let name: String = id.iter().map(|b| format!("{b:02x}")).collect();
        let path = self.dir.join(format!("{name}.{extension}"));
        self.paths.push(path.clone());
        Ok(path)
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn remove_all(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!("failed to remove {}: {err}", path.display());
                }
            }
        }
    }

    pub fn retain(&mut self) {
        for path in self.paths.drain(..).filter(|p| p.exists()) {
            tracing::info!("kept temp file for inspection: {}", path.display());
        }
    }
}

/// Mutable state of one run. Never shared between runs.
#[derive(Debug)]
pub struct OrchestrationContext {
    pub cancel: CancellationToken,
    state: RunState,
    pub target: Option<SymbolTarget>,
    pub strategy: Option<ToolchainStrategy>,
    pub target_framework: String,
    /// Whether `-f <framework>` is passed to build and publish.
    pub pass_target_framework: bool,
    pub project_dir: PathBuf,
    pub output_dir: PathBuf,
    pub assembly_name: String,
    pub output: String,
    pub jit_dump_phases: Vec<String>,
    pub flowgraph_file: Option<PathBuf>,
    pub flowgraph_phases: Vec<FlowGraphPhase>,
    pub temp: TempArtifacts,
}

impl OrchestrationContext {
    pub fn new(cancel: CancellationToken, temp_root: &Path) -> Self {
        Self {
            cancel,
            state: RunState::Validating,
            target: None,
            strategy: None,
            target_framework: String::new(),
            pass_target_framework: true,
            project_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            assembly_name: String::new(),
            output: String::new(),
            jit_dump_phases: Vec::new(),
            flowgraph_file: None,
            flowgraph_phases: Vec::new(),
            temp: TempArtifacts::new(temp_root),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn checkpoint(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Move to `next` unless the run has been cancelled in the meantime.
    pub fn enter(&mut self, next: RunState, toolchain: &Toolchain) -> Result<(), RunError> {
        self.checkpoint()?;
        tracing::debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        toolchain.report_status(next.to_string());
        Ok(())
    }

    /// Record the terminal state; no further transitions happen.
    pub fn finish(&mut self, terminal: RunState) {
        debug_assert!(terminal.is_terminal());
        tracing::debug!("{:?} -> {:?}", self.state, terminal);
        self.state = terminal;
    }
}
