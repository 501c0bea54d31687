//! Strategy selection and the environment/arguments each strategy runs with.

use super::validate::LocalArtifacts;
use crate::error::RunError;
use crate::loader::LoaderApp;
use crate::process::ProcessInvocation;
use crate::project::rid_os;
use crate::settings::{Compiler, Configuration};
use crate::symbol::SymbolTarget;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "DOTNET_";
const LEGACY_ENV_PREFIX: &str = "COMPlus_";
pub const CORE_LIBRARIES: &str = "CORE_LIBRARIES";
/// MSBuild constant defined for every build this tool makes.
pub const DEFINE_CONSTANT: &str = "JITDASM";

pub fn env_name(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

/// What the JIT is asked to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListingKind {
    Disasm,
    Dump,
    Inlinees,
}

impl ListingKind {
    pub fn from_config(config: &Configuration) -> Self {
        if config.jit_dump {
            ListingKind::Dump
        } else if config.print_inlinees {
            ListingKind::Inlinees
        } else {
            ListingKind::Disasm
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            ListingKind::Disasm => "JitDisasm",
            ListingKind::Dump => "JitDump",
            ListingKind::Inlinees => "JitPrintInlinedMethods",
        }
    }
}

/// Which runtime hosts JIT-mode executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum RuntimeFlavor {
    /// The installed shared framework, through `dotnet`.
    Installed,
    /// CoreRun from a checked local build, resolving the BCL from a runtime pack.
    CoreRun {
        checked_dir: PathBuf,
        runtime_pack: PathBuf,
    },
    /// A self-contained publish with the checked runtime copied over it.
    Overlay { checked_dir: PathBuf },
}

impl RuntimeFlavor {
    fn select(config: &Configuration, local: Option<&LocalArtifacts>) -> Self {
        let Some(local) = local.filter(|_| config.use_custom_runtime) else {
            return RuntimeFlavor::Installed;
        };
        match (&local.runtime_pack, config.use_publish_for_reload) {
            (_, true) => RuntimeFlavor::Overlay {
                checked_dir: local.checked_dir.clone(),
            },
            (Some(pack), false) => RuntimeFlavor::CoreRun {
                checked_dir: local.checked_dir.clone(),
                runtime_pack: pack.clone(),
            },
            (None, false) => RuntimeFlavor::Installed,
        }
    }
}

/// One way of getting a listing out of the compiler. Chosen once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy")]
pub enum ToolchainStrategy {
    JitDisasm {
        runtime: RuntimeFlavor,
    },
    JitDump {
        runtime: RuntimeFlavor,
    },
    PrintInlinees {
        runtime: RuntimeFlavor,
    },
    /// The loader runs with a custom JIT loaded as AltJit for the target only.
    AltJit {
        jit_name: String,
        listing: ListingKind,
        runtime: RuntimeFlavor,
    },
    /// The user's own app runs instead of the loader.
    RunApp {
        listing: ListingKind,
        runtime: RuntimeFlavor,
        alt_jit: Option<String>,
        disasm_override: Option<String>,
    },
    Crossgen2 {
        listing: ListingKind,
        repo: PathBuf,
        checked_dir: PathBuf,
        runtime_pack: Option<PathBuf>,
    },
    NativeAotCustom {
        listing: ListingKind,
        repo: PathBuf,
        aot_dir: PathBuf,
    },
    /// `dotnet publish /p:PublishAot=true` with the installed SDK; build and execute fused.
    NativeAotDefault {
        listing: ListingKind,
    },
}

impl ToolchainStrategy {
    /// Pick the strategy for a validated configuration.
    pub fn select(config: &Configuration, local: Option<&LocalArtifacts>) -> Result<Self, RunError> {
        let listing = ListingKind::from_config(config);
        let runtime = RuntimeFlavor::select(config, local);
        let missing_runtime =
            || RunError::validation("Path to a local dotnet/runtime repository is not set");

        let strategy = match config.compiler {
            Compiler::Crossgen2 => {
                let local = local.ok_or_else(missing_runtime)?;
                ToolchainStrategy::Crossgen2 {
                    listing,
                    repo: local.repo.clone(),
                    checked_dir: local.checked_dir.clone(),
                    runtime_pack: local.runtime_pack.clone(),
                }
            }
            Compiler::NativeAot if config.use_custom_runtime => {
                let local = local.ok_or_else(missing_runtime)?;
                let aot_dir = local.native_aot_dir.clone().ok_or_else(missing_runtime)?;
                ToolchainStrategy::NativeAotCustom {
                    listing,
                    repo: local.repo.clone(),
                    aot_dir,
                }
            }
            Compiler::NativeAot => ToolchainStrategy::NativeAotDefault { listing },
            Compiler::Jit => {
                let alt_jit = config
                    .alt_jit()
                    .filter(|_| config.use_custom_runtime)
                    .map(str::to_string);
                if config.run_app_mode {
                    ToolchainStrategy::RunApp {
                        listing,
                        runtime,
                        alt_jit,
                        disasm_override: config
                            .overridden_jit_disasm
                            .as_deref()
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string),
                    }
                } else if let Some(jit_name) = alt_jit {
                    ToolchainStrategy::AltJit {
                        jit_name,
                        listing,
                        runtime,
                    }
                } else {
                    match listing {
                        ListingKind::Disasm => ToolchainStrategy::JitDisasm { runtime },
                        ListingKind::Dump => ToolchainStrategy::JitDump { runtime },
                        ListingKind::Inlinees => ToolchainStrategy::PrintInlinees { runtime },
                    }
                }
            }
        };
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolchainStrategy::JitDisasm { .. } => "JitDisasm",
            ToolchainStrategy::JitDump { .. } => "JitDump",
            ToolchainStrategy::PrintInlinees { .. } => "PrintInlinees",
            ToolchainStrategy::AltJit { .. } => "AltJit",
            ToolchainStrategy::RunApp { .. } => "RunApp",
            ToolchainStrategy::Crossgen2 { .. } => "Crossgen2",
            ToolchainStrategy::NativeAotCustom { .. } => "NativeAotCustom",
            ToolchainStrategy::NativeAotDefault { .. } => "NativeAotDefault",
        }
    }

    pub fn listing(&self) -> ListingKind {
        match self {
            ToolchainStrategy::JitDisasm { .. } => ListingKind::Disasm,
            ToolchainStrategy::JitDump { .. } => ListingKind::Dump,
            ToolchainStrategy::PrintInlinees { .. } => ListingKind::Inlinees,
            ToolchainStrategy::AltJit { listing, .. }
            | ToolchainStrategy::RunApp { listing, .. }
            | ToolchainStrategy::Crossgen2 { listing, .. }
            | ToolchainStrategy::NativeAotCustom { listing, .. }
            | ToolchainStrategy::NativeAotDefault { listing } => *listing,
        }
    }

    fn runtime(&self) -> Option<&RuntimeFlavor> {
        match self {
            ToolchainStrategy::JitDisasm { runtime }
            | ToolchainStrategy::JitDump { runtime }
            | ToolchainStrategy::PrintInlinees { runtime }
            | ToolchainStrategy::AltJit { runtime, .. }
            | ToolchainStrategy::RunApp { runtime, .. } => Some(runtime),
            _ => None,
        }
    }

    /// The loader app is only needed when the JIT compiles on demand and the user's app
    /// is not the one being run.
    pub fn needs_loader(&self) -> bool {
        matches!(
            self,
            ToolchainStrategy::JitDisasm { .. }
                | ToolchainStrategy::JitDump { .. }
                | ToolchainStrategy::PrintInlinees { .. }
                | ToolchainStrategy::AltJit { .. }
        )
    }

    pub fn is_run_app(&self) -> bool {
        matches!(self, ToolchainStrategy::RunApp { .. })
    }

    /// Environment for the execute step, before any per-strategy translation.
    ///
    /// User variables override everything computed here except the flow-graph settings.
    pub fn execution_env(
        &self,
        config: &Configuration,
        target: &SymbolTarget,
        flowgraph_file: Option<&Path>,
    ) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let flag = |on: bool| String::from(if on { "1" } else { "0" });

        vars.insert(env_name(self.listing().env_var()), target.target.clone());

        let alt_jit = match self {
            ToolchainStrategy::AltJit { jit_name, .. } => Some(jit_name),
            ToolchainStrategy::RunApp { alt_jit, .. } => alt_jit.as_ref(),
            _ => None,
        };
        if let Some(jit_name) = alt_jit {
            vars.insert(env_name("AltJitName"), jit_name.clone());
            vars.insert(env_name("AltJit"), target.target.clone());
        }

        vars.insert(env_name("TieredPGO"), flag(config.use_pgo));
        vars.insert(env_name("JitDisasmDiffable"), flag(config.diffable));

        let runtime_pack = match (self, self.runtime()) {
            (_, Some(RuntimeFlavor::CoreRun { runtime_pack, .. })) => Some(runtime_pack),
            (ToolchainStrategy::Crossgen2 { runtime_pack, .. }, _) => runtime_pack.as_ref(),
            _ => None,
        };
        if let Some(pack) = runtime_pack {
            vars.insert(CORE_LIBRARIES.to_string(), pack.display().to_string());
        }

        vars.insert(env_name("TieredCompilation"), flag(config.use_tiered_jit));

        config.fill_with_user_vars(&mut vars);

        if let Some(file) = flowgraph_file {
            vars.insert(env_name("JitDumpFg"), target.target.clone());
            vars.insert(env_name("JitDumpFgDot"), "1".to_string());
            vars.insert(env_name("JitDumpFgPhase"), "*".to_string());
            vars.insert(env_name("JitDumpFgFile"), file.display().to_string());
        }

        if let ToolchainStrategy::RunApp {
            disasm_override: Some(filter),
            ..
        } = self
        {
            vars.insert(env_name("JitDisasm"), filter.clone());
        }
        vars
    }

    /// The execute-step command for every strategy except [`ToolchainStrategy::NativeAotDefault`],
    /// which runs as part of its publish.
    pub fn execute_invocation(
        &self,
        config: &Configuration,
        env: BTreeMap<String, String>,
        paths: &ExecutePaths,
    ) -> ProcessInvocation {
        let assembly = format!("{}.dll", paths.assembly_name);
        match self {
            ToolchainStrategy::Crossgen2 {
                repo,
                checked_dir,
                runtime_pack,
                ..
            } => {
                let mut args = vec![
                    checked_dir
                        .join("crossgen2")
                        .join("crossgen2.dll")
                        .display()
                        .to_string(),
                    "--out".to_string(),
                    "aot".to_string(),
                ];
                args.extend(codegen_args(&env));
                args.extend(split_user_args(&config.crossgen2_args));
                args.push(assembly);
                match runtime_pack {
                    Some(pack) if !config.use_publish_for_reload => {
                        args.push(reference(&pack.join("*.dll")));
                        // Runtime packs ship without corelib; take the checked one.
                        args.push(reference(&checked_dir.join("System.Private.CoreLib.dll")));
                    }
                    _ => args.push(reference(&paths.output_dir.join("*.dll"))),
                }
                ProcessInvocation::new(repo_dotnet(repo))
                    .args(args)
                    .envs(&crossgen_speedup_env())
            }
            ToolchainStrategy::NativeAotCustom { repo, aot_dir, .. } => {
                let repo_text = repo.display().to_string();
                let ilc_args = config
                    .ilc_args
                    .replace("%DOTNET_REPO%", repo_text.trim_end_matches(['/', '\\']));
                let mut args = vec![assembly];
                args.extend(codegen_args(&env));
                args.extend(split_user_args(&ilc_args));
                if config.use_publish_for_reload {
                    args.push(reference(&paths.output_dir.join("*.dll")));
                }
                let ilc = aot_dir
                    .join("ilc")
                    .join(format!("ilc{}", std::env::consts::EXE_SUFFIX));
                ProcessInvocation::new(ilc).args(args)
            }
            _ => {
                let executable = match self.runtime() {
                    Some(RuntimeFlavor::CoreRun { checked_dir, .. }) => {
                        checked_dir.join(format!("CoreRun{}", std::env::consts::EXE_SUFFIX))
                    }
                    _ => paths.dotnet.clone(),
                };
                let args = if self.is_run_app() {
                    vec![assembly]
                } else {
                    vec![
                        LoaderApp::dll_name(),
                        assembly,
                        paths.class_name.clone(),
                        paths.method_name.clone(),
                        config.use_unloadable_context.to_string(),
                    ]
                };
                ProcessInvocation::new(executable).args(args).envs(&env)
            }
        }
    }
}

/// Inputs of the execute step that come from the resolved project.
#[derive(Debug, Clone)]
pub struct ExecutePaths {
    pub dotnet: PathBuf,
    pub output_dir: PathBuf,
    pub assembly_name: String,
    pub class_name: String,
    pub method_name: String,
}

fn reference(path: &Path) -> String {
    format!("-r:{}", path.display())
}

fn repo_dotnet(repo: &Path) -> PathBuf {
    if cfg!(windows) {
        repo.join("dotnet.cmd")
    } else {
        repo.join("dotnet.sh")
    }
}

/// Extra compiler arguments typed by the user, one or more per line.
pub fn split_user_args(text: &str) -> Vec<String> {
    let joined = text.replace("\r\n", " ").replace('\n', " ");
    shlex::split(&joined).unwrap_or_else(|| joined.split_whitespace().map(str::to_string).collect())
}

/// JIT knobs given to an AOT compiler: `DOTNET_JitDisasm=X` -> `--codegenopt:jitdisasm=X`.
/// Variables without a runtime prefix (`CORE_LIBRARIES`) are dropped.
pub fn codegen_args(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .filter_map(|(key, value)| {
            let name = strip_runtime_prefix(key)?;
            Some(format!("--codegenopt:{}={value}", name.to_lowercase()))
        })
        .collect()
}

fn strip_runtime_prefix(key: &str) -> Option<&str> {
    [ENV_PREFIX, LEGACY_ENV_PREFIX].iter().find_map(|prefix| {
        key.get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| &key[prefix.len()..])
    })
}

/// crossgen2 itself runs faster with these; they do not change the code it produces.
pub fn crossgen_speedup_env() -> BTreeMap<String, String> {
    [
        ("TieredPGO", "0"),
        ("ReadyToRun", "1"),
        ("TC_QuickJitForLoops", "1"),
        ("TC_CallCountingDelayMs", "0"),
        ("TieredCompilation", "1"),
    ]
    .into_iter()
    .map(|(name, value)| (env_name(name), value.to_string()))
    .collect()
}

/// Env vars for `dotnet build`/`publish` that skip first-run work.
pub fn build_env(no_restore: bool) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::from([
        ("DOTNET_SKIP_FIRST_TIME_EXPERIENCE".to_string(), "1".to_string()),
        ("DOTNET_CLI_TELEMETRY_OPTOUT".to_string(), "1".to_string()),
    ]);
    if no_restore {
        vars.insert("DOTNET_MULTILEVEL_LOOKUP".to_string(), "0".to_string());
    }
    vars
}

/// A `Directory.Build.props`-style file that defines [`DEFINE_CONSTANT`] and, for the
/// NativeAOT publish, passes the JIT knobs to ILC as `<IlcArg>` items.
pub fn props_file(ilc_env: Option<&BTreeMap<String, String>>) -> String {
    let mut props = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<Project>\n  <PropertyGroup>\n    <DefineConstants>$(DefineConstants);{DEFINE_CONSTANT}</DefineConstants>\n  </PropertyGroup>\n"
    );
    if let Some(env) = ilc_env {
        props.push_str("  <ItemGroup>\n");
        for (key, value) in env {
            let Some(name) = strip_runtime_prefix(key) else {
                continue;
            };
            let item = format!("--codegenopt:{}=\"{value}\"", name.to_lowercase());
            props.push_str(&format!(
                "    <IlcArg Include=\"{}\" />\n",
                quick_xml::escape::escape(item.as_str())
            ));
        }
        props.push_str("  </ItemGroup>\n");
    }
    props.push_str("</Project>\n");
    props
}

/// Runtime identifier for publishes, e.g. `linux-x64`.
pub fn runtime_identifier(config: &Configuration) -> String {
    format!("{}-{}", rid_os(), config.arch)
}
