//! The loader app: a tiny .NET program that loads the user's assembly and forces the JIT
//! to compile the selected methods.
//!
//! It is built once per (tool version, target framework, SDK version) under the temp
//! directory and then copied next to the user's freshly built assembly.

use crate::error::RunError;
use crate::process::{self, OutputLine, ProcessInvocation};
use rand::RngCore;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const LOADER_NAME: &str = "JitDasmLoader";

const SOURCE_TEMPLATE: &str = include_str!("../templates/JitDasmLoader.cs");
const PROJECT_TEMPLATE: &str = include_str!("../templates/JitDasmLoader.csproj");

/// Where loader builds are cached and how to build them.
#[derive(Debug, Clone)]
pub struct LoaderApp {
    pub dotnet: PathBuf,
    pub cache_root: PathBuf,
    pub tool_version: String,
}

impl LoaderApp {
    pub fn new(dotnet: impl Into<PathBuf>, temp_root: &Path, tool_version: impl Into<String>) -> Self {
        Self {
            dotnet: dotnet.into(),
            cache_root: temp_root.join(LOADER_NAME),
            tool_version: tool_version.into(),
        }
    }

    pub fn dll_name() -> String {
        format!("{LOADER_NAME}.dll")
    }

    fn runtime_config_name() -> String {
        format!("{LOADER_NAME}.runtimeconfig.json")
    }

    /// `dotnet --version`, or a random token when it cannot be read so that a broken SDK
    /// never reuses a cached build.
    pub async fn sdk_version(&self, cancel: &CancellationToken) -> Result<String, RunError> {
        let invocation = ProcessInvocation::new(&self.dotnet)
            .arg("--version")
            .cancellation(cancel.clone());
        let result = process::run(&invocation, None).await;
        if result.cancelled {
            return Err(RunError::Cancelled);
        }
        tracing::debug!("dotnet --version: {} ({})", result.stdout, result.stderr);

        let version = result.stdout.trim();
        if version.starts_with(|c: char| c.is_ascii_digit()) {
            Ok(version.to_string())
        } else {
            let mut id = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut id);
            Ok(id.iter().map(|b| format!("{b:02x}")).collect())
        }
    }

    pub fn build_dir(&self, target_framework: &str, sdk_version: &str) -> PathBuf {
        self.cache_root
            .join(format!("{}_{target_framework}_{sdk_version}", self.tool_version))
    }

    /// Make sure `destination` holds a loader built for `target_framework`, building it if
    /// the cache has none.
    pub async fn install_into(
        &self,
        target_framework: &str,
        destination: &Path,
        cancel: &CancellationToken,
        sink: Option<&mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<(), RunError> {
        if !destination.is_dir() {
            return Err(RunError::tool(format!(
                "ERROR: destination directory was not found: {}",
                destination.display()
            )));
        }

        let dll_dest = destination.join(Self::dll_name());
        let json_dest = destination.join(Self::runtime_config_name());
        if dll_dest.exists() && json_dest.exists() {
            return Ok(());
        }

        let sdk_version = self.sdk_version(cancel).await?;
        let dir = self.build_dir(target_framework, &sdk_version);
        let out_dll = dir.join("out").join(Self::dll_name());
        let out_json = dir.join("out").join(Self::runtime_config_name());

        if !(out_dll.exists() && out_json.exists()) {
            self.build(&dir, target_framework, cancel, sink).await?;
            if !(out_dll.exists() && out_json.exists()) {
                return Err(RunError::tool(format!(
                    "ERROR: 'dotnet build' did not produce expected binaries ('{}' and '{}')",
                    out_dll.display(),
                    out_json.display()
                )));
            }
        } else {
            tracing::debug!("reusing loader build in {}", dir.display());
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        tokio::fs::copy(&out_dll, &dll_dest).await?;
        tokio::fs::copy(&out_json, &json_dest).await?;
        Ok(())
    }

    async fn build(
        &self,
        dir: &Path,
        target_framework: &str,
        cancel: &CancellationToken,
        sink: Option<&mpsc::UnboundedSender<OutputLine>>,
    ) -> Result<(), RunError> {
        tracing::info!("building {LOADER_NAME} for {target_framework} in {}", dir.display());
        tokio::fs::create_dir_all(dir).await?;

        let source = dir.join(format!("{LOADER_NAME}.cs"));
        if !source.exists() {
            tokio::fs::write(&source, SOURCE_TEMPLATE).await?;
        }
        let project = dir.join(format!("{LOADER_NAME}.csproj"));
        if !project.exists() {
            tokio::fs::write(&project, PROJECT_TEMPLATE.replace("%tfm%", target_framework)).await?;
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let invocation = ProcessInvocation::new(&self.dotnet)
            .args(["build", "-c", "Release", "-o", "out"])
            .current_dir(dir)
            .cancellation(cancel.clone());
        let result = process::run(&invocation, sink).await;
        if result.cancelled {
            return Err(RunError::Cancelled);
        }
        if !result.is_success() {
            return Err(RunError::tool(format!(
                "ERROR: failed to build {LOADER_NAME}:\n{}\n\n{}",
                result.stdout, result.stderr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_wired_up() {
        assert!(PROJECT_TEMPLATE.contains("%tfm%"));
        assert!(SOURCE_TEMPLATE.contains("PrepareMethod"));
    }

    #[test]
    fn cache_dir_is_keyed_by_versions() {
        let loader = LoaderApp::new("dotnet", Path::new("/tmp/jitdasm"), "0.3.0");
        assert_eq!(
            loader.build_dir("net8.0", "8.0.401"),
            PathBuf::from("/tmp/jitdasm/JitDasmLoader/0.3.0_net8.0_8.0.401")
        );
    }

    #[tokio::test]
    async fn missing_destination_is_reported() {
        let loader = LoaderApp::new("dotnet", Path::new("/tmp"), "0.3.0");
        let err = loader
            .install_into("net8.0", Path::new("/no/such/dir"), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("destination directory was not found"));
    }

    #[tokio::test]
    async fn installed_loader_is_left_alone() {
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("JitDasmLoader.dll"), b"dll").unwrap();
        std::fs::write(dest.path().join("JitDasmLoader.runtimeconfig.json"), b"{}").unwrap();

        // No dotnet is needed when the destination already has a loader.
        let loader = LoaderApp::new("/no/such/dotnet", Path::new("/tmp"), "0.3.0");
        loader
            .install_into("net8.0", dest.path(), &CancellationToken::new(), None)
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cached_build_is_copied() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let fake_dotnet = root.path().join("dotnet");
        std::fs::write(&fake_dotnet, "#!/bin/sh\necho 8.0.100\n").unwrap();
        std::fs::set_permissions(&fake_dotnet, std::fs::Permissions::from_mode(0o755)).unwrap();

        let loader = LoaderApp::new(&fake_dotnet, root.path(), "0.3.0");
        let out = loader.build_dir("net8.0", "8.0.100").join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("JitDasmLoader.dll"), b"dll").unwrap();
        std::fs::write(out.join("JitDasmLoader.runtimeconfig.json"), b"{}").unwrap();

        let dest = root.path().join("app");
        std::fs::create_dir_all(&dest).unwrap();
        loader
            .install_into("net8.0", &dest, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("JitDasmLoader.dll")).unwrap(), b"dll");
    }
}
