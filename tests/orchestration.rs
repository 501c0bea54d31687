//! End-to-end runs against a scripted stand-in for the `dotnet` host.
#![cfg(unix)]

use jitdasm::model::{RunOutcome, RunReport, RunRequest};
use jitdasm::orchestrator::{self, Toolchain, ToolchainStrategy};
use jitdasm::project::ProjectContext;
use jitdasm::settings::{Compiler, Configuration};
use jitdasm::symbol::{CodeSymbolDescriptor, MethodKind, SymbolMember};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FAKE_DOTNET: &str = r#"#!/bin/sh
out=""
prev=""
props=""
for a in "$@"; do
  [ "$prev" = "-o" ] && out="$a"
  case "$a" in /p:CustomBeforeDirectoryBuildProps=*) props="${a#*=}" ;; esac
  prev="$a"
done
echo "$*" >> "@LOG@"
case "$1" in
  --version)
    echo 8.0.100
    ;;
  build)
    if [ "$out" = "out" ]; then
      mkdir -p out
      : > out/JitDasmLoader.dll
      : > out/JitDasmLoader.runtimeconfig.json
    else
      mkdir -p "$out"
      : > "$out/App.dll"
      @BUILD@
    fi
    ;;
  publish)
    @PUBLISH@
    ;;
  JitDasmLoader.dll)
    @EXECUTE@
    ;;
esac
"#;

const LISTING: &str = r#"echo "; Assembly listing for method $DOTNET_JitDisasm"
    echo "; Tier0"
    echo "G_M1_IG01:"
    echo "       ret"
    echo "; Total bytes of code 1""#;

/// A scratch workspace: a project, a fake `dotnet` and a temp root.
struct Workspace {
    _dir: tempfile::TempDir,
    project_dir: PathBuf,
    temp_root: PathBuf,
    dotnet: PathBuf,
    log: PathBuf,
}

impl Workspace {
    fn new(build: &str, publish: &str, execute: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("app");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("App.csproj"),
            "<Project Sdk=\"Microsoft.NET.Sdk\"><PropertyGroup><TargetFramework>net8.0</TargetFramework></PropertyGroup></Project>",
        )
        .unwrap();

        let log = dir.path().join("dotnet.log");
        let dotnet = dir.path().join("dotnet");
        let script = FAKE_DOTNET
            .replace("@LOG@", &log.display().to_string())
            .replace("@BUILD@", build)
            .replace("@PUBLISH@", publish)
            .replace("@EXECUTE@", execute);
        std::fs::write(&dotnet, script).unwrap();
        std::fs::set_permissions(&dotnet, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            temp_root: dir.path().join("temp"),
            _dir: dir,
            project_dir,
            dotnet,
            log,
        }
    }

    fn toolchain(&self) -> Toolchain {
        Toolchain {
            dotnet: self.dotnet.clone(),
            temp_root: self.temp_root.clone(),
            ..Default::default()
        }
    }

    fn request(&self, config: Configuration) -> RunRequest {
        let symbol = CodeSymbolDescriptor::from_qualified_type(
            "MyApp.Program",
            SymbolMember::Method {
                name: "Main".into(),
                kind: MethodKind::Ordinary,
                is_generic: false,
            },
        );
        RunRequest {
            symbol,
            project: ProjectContext::load(&self.project_dir.join("App.csproj")).unwrap(),
            config: Configuration {
                output_folder_name: "jitdasm".into(),
                ..config
            },
        }
    }

    fn output_dir(&self) -> PathBuf {
        self.project_dir.join("bin").join("jitdasm")
    }

    fn log(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap_or_default()
    }

    async fn run(&self, config: Configuration) -> RunReport {
        orchestrator::run(&self.toolchain(), &self.request(config), CancellationToken::new()).await
    }
}

fn temp_files(temp_root: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(temp_root.join("tmp")) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn disassembles_through_the_loader() {
    let ws = Workspace::new(":", ":", LISTING);
    let report = ws.run(Configuration::default()).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded, "{}", report.output);
    assert!(matches!(report.strategy, Some(ToolchainStrategy::JitDisasm { .. })));
    assert_eq!(report.target_framework.as_deref(), Some("net8.0"));
    assert!(report.output.starts_with("; Method MyApp.Program:Main"));
    assert!(report.output.contains("; Total bytes of code: 1"));

    assert!(ws.output_dir().join("JitDasmLoader.dll").exists());
    let log = ws.log();
    assert!(log.contains("build -f net8.0 -c Release -o"));
    assert!(log.contains("JitDasmLoader.dll App.dll MyApp.Program Main false"));
    assert!(temp_files(&ws.temp_root).is_empty());
}

#[tokio::test]
async fn loader_is_not_rebuilt_for_a_second_run() {
    let ws = Workspace::new(":", ":", LISTING);
    assert!(ws.run(Configuration::default()).await.is_success());
    std::fs::remove_file(ws.output_dir().join("JitDasmLoader.dll")).unwrap();
    assert!(ws.run(Configuration::default()).await.is_success());

    let loader_builds = ws.log().lines().filter(|l| *l == "build -c Release -o out").count();
    assert_eq!(loader_builds, 1);
}

#[tokio::test]
async fn build_errors_fail_the_run_and_keep_temp_files() {
    let ws = Workspace::new(
        r#"echo "Program.cs(3,1): error CS1002: ; expected""#,
        ":",
        LISTING,
    );
    let report = ws.run(Configuration::default()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.output.contains("error CS1002"));
    assert!(!ws.log().contains("JitDasmLoader.dll App.dll"));
    let kept = temp_files(&ws.temp_root);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].extension().and_then(|e| e.to_str()), Some("props"));
}

#[tokio::test]
async fn stderr_from_the_loader_is_a_failure() {
    let ws = Workspace::new(":", ":", r#"echo partial; echo "Could not find type" 1>&2"#);
    let report = ws.run(Configuration::default()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.output, "partial\nERROR:\nCould not find type");
}

#[tokio::test]
async fn cancelling_a_slow_build() {
    let ws = Workspace::new("exec sleep 30", ":", LISTING);
    let cancel = CancellationToken::new();
    let toolchain = ws.toolchain();
    let request = ws.request(Configuration::default());

    let app_dll = ws.output_dir().join("App.dll");
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while !app_dll.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            cancel.cancel();
        })
    };

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator::run(&toolchain, &request, cancel),
    )
    .await
    .expect("cancelled run should return promptly");
    canceller.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.output, "The operation was canceled.");
    assert!(temp_files(&ws.temp_root).is_empty());
}

const FLOWGRAPH_DUMP: &str = r#"cat > "$DOTNET_JitDumpFgFile.dot" <<'EOF'
digraph FlowGraph {
  graph [label = "Main\nafter Pre-import"];
}
digraph FlowGraph {
  graph [label = "Main\nafter Importation"];
}
EOF
    echo "*************** Starting PHASE Pre-import"
    echo "*************** Starting PHASE Importation""#;

fn flowgraph_config(ws: &Workspace) -> Configuration {
    Configuration {
        jit_dump: true,
        flowgraph_enable: true,
        graphviz_dot_path: Some(ws.dotnet.clone()),
        ..Default::default()
    }
}

#[tokio::test]
async fn jit_dump_with_flow_graphs() {
    let ws = Workspace::new(":", ":", FLOWGRAPH_DUMP);
    let report = ws.run(flowgraph_config(&ws)).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded, "{}", report.output);
    assert!(matches!(report.strategy, Some(ToolchainStrategy::JitDump { .. })));
    assert_eq!(report.jit_dump_phases, ["Pre-import", "Importation"]);

    let names: Vec<&str> = report.flowgraph_phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["Pre-import", "Importation"]);
    for phase in &report.flowgraph_phases {
        assert!(phase.file_path.as_ref().unwrap().exists());
    }
    assert!(temp_files(&ws.temp_root).is_empty());
}

#[tokio::test]
async fn a_new_run_removes_the_previous_flow_graphs() {
    let ws = Workspace::new(":", ":", FLOWGRAPH_DUMP);
    let first = ws.run(flowgraph_config(&ws)).await;
    assert!(first.is_success(), "{}", first.output);
    let old_file = first.flowgraph_phases[0].file_path.clone().unwrap();
    assert!(old_file.exists());

    let second = ws.run(flowgraph_config(&ws)).await;
    assert!(second.is_success(), "{}", second.output);
    assert!(!old_file.parent().unwrap().exists());
    assert!(second.flowgraph_phases[0].file_path.as_ref().unwrap().exists());

    let dirs = std::fs::read_dir(ws.temp_root.join("flowgraphs")).unwrap().count();
    assert_eq!(dirs, 1);
}

#[tokio::test]
async fn native_aot_publish_reads_the_jit_stdout_file() {
    let publish = r#"jit=$(sed -n 's/.*jitstdoutfile=&quot;\([^&]*\)&quot;.*/\1/p' "$props")
    target=$(sed -n 's/.*jitdisasm=&quot;\([^&]*\)&quot;.*/\1/p' "$props")
    printf '; Assembly listing for method %s\nG_M1_IG01:\n       ret\n; Total bytes of code 3\n' "$target" > "$jit""#;
    let ws = Workspace::new(":", publish, ":");
    let config = Configuration {
        compiler: Compiler::NativeAot,
        ..Default::default()
    };
    let report = ws.run(config).await;

    assert_eq!(report.outcome, RunOutcome::Succeeded, "{}", report.output);
    assert!(matches!(report.strategy, Some(ToolchainStrategy::NativeAotDefault { .. })));
    assert!(report.output.starts_with("; Method MyApp.Program:Main"));
    assert!(report.output.contains("; Total bytes of code: 3"));
    assert!(ws.log().contains("/p:PublishAot=true"));
    assert!(!ws.output_dir().join("JitDasmLoader.dll").exists());
}

#[tokio::test]
async fn native_aot_without_output_explains_why() {
    let ws = Workspace::new(":", ":", ":");
    let config = Configuration {
        compiler: Compiler::NativeAot,
        ..Default::default()
    };
    let report = ws.run(config).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.output.starts_with("JitDisasm didn't produce any output"));
}

#[tokio::test]
async fn validation_stops_before_any_tool_runs() {
    let ws = Workspace::new(":", ":", LISTING);
    let config = Configuration {
        compiler: Compiler::NativeAot,
        use_pgo: true,
        ..Default::default()
    };
    let report = ws.run(config).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.output, "PGO has no effect on R2R'd/NativeAOT code.");
    assert!(report.strategy.is_none());
    assert!(ws.log().is_empty());
}
