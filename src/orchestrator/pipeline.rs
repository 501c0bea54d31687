//! One orchestration run: validate, resolve the project, build, execute, post-process.

use super::context::{OrchestrationContext, RunState, Toolchain};
use super::post_process;
use super::strategy::{self, env_name, ExecutePaths, ToolchainStrategy};
use super::validate::{self, LocalArtifacts};
use crate::error::RunError;
use crate::flowgraph;
use crate::model::{utc_timestamp, RunOutcome, RunReport, RunRequest};
use crate::process::{self, ProcessInvocation, ProcessResult};
use crate::project::{select_configuration, ProjectContext};
use crate::settings::Configuration;
use crate::symbol::SymbolTarget;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Used when the project file does not say which framework it targets.
const FALLBACK_TARGET_FRAMEWORK: &str = "net7.0";

/// Run one request to completion. Never fails: every outcome ends up in the report.
pub async fn run(
    toolchain: &Toolchain,
    request: &RunRequest,
    cancel: CancellationToken,
) -> RunReport {
    let started = Instant::now();
    let mut ctx = OrchestrationContext::new(cancel, &toolchain.temp_root);
    flowgraph::clear_phase_dirs(&toolchain.temp_root);

    let outcome = match drive(toolchain, request, &mut ctx).await {
        Ok(()) => {
            ctx.finish(RunState::Done);
            ctx.temp.remove_all();
            RunOutcome::Succeeded
        }
        Err(RunError::Cancelled) => {
            ctx.finish(RunState::Cancelled);
            ctx.temp.remove_all();
            ctx.output = RunError::Cancelled.to_string();
            ctx.jit_dump_phases.clear();
            ctx.flowgraph_phases.clear();
            RunOutcome::Cancelled
        }
        Err(err) => {
            ctx.finish(RunState::Failed);
            tracing::warn!("run failed in {:?}: {err}", ctx.strategy.as_ref().map(ToolchainStrategy::name));
            ctx.temp.retain();
            ctx.output = err.to_string();
            RunOutcome::Failed
        }
    };

    RunReport {
        timestamp_utc: utc_timestamp(),
        outcome,
        target: ctx.target,
        strategy: ctx.strategy,
        target_framework: Some(ctx.target_framework).filter(|tfm| !tfm.is_empty()),
        output: ctx.output,
        previous_output: None,
        jit_dump_phases: ctx.jit_dump_phases,
        flowgraph_phases: ctx.flowgraph_phases,
        elapsed: started.elapsed(),
    }
}

async fn drive(
    toolchain: &Toolchain,
    request: &RunRequest,
    ctx: &mut OrchestrationContext,
) -> Result<(), RunError> {
    let config = &request.config;

    ctx.enter(RunState::Validating, toolchain)?;
    let validated = validate::validate(request.symbol.as_ref(), config)?;
    ctx.target = Some(validated.target.clone());

    ctx.enter(RunState::ResolvingProjectConfig, toolchain)?;
    resolve_project(&request.project, config, ctx)?;
    let strategy = ToolchainStrategy::select(config, validated.local.as_ref())?;
    tracing::info!("strategy: {}", strategy.name());
    ctx.strategy = Some(strategy.clone());

    let raw = if let ToolchainStrategy::NativeAotDefault { .. } = strategy {
        ctx.enter(RunState::Executing, toolchain)?;
        publish_native_aot(toolchain, config, &strategy, &validated.target, ctx).await?
    } else {
        ctx.enter(RunState::Building, toolchain)?;
        build(toolchain, request, &strategy, validated.local.as_ref(), ctx).await?;
        ctx.enter(RunState::Executing, toolchain)?;
        execute(toolchain, config, &strategy, &validated.target, ctx).await?
    };

    ctx.enter(RunState::Postprocessing, toolchain)?;
    post_process::process_run_output(toolchain, config, ctx, &raw)
}

/// Pick the configuration and framework, then work out where the build output goes.
fn resolve_project(
    project: &ProjectContext,
    config: &Configuration,
    ctx: &mut OrchestrationContext,
) -> Result<(), RunError> {
    let pinned = config.pinned_target_framework();
    let selected = select_configuration(&project.configurations, pinned);
    if let Some(selected) = selected {
        tracing::debug!(
            "project configuration: {} {:?}",
            selected.configuration,
            selected.target_framework
        );
    }

    ctx.target_framework = match pinned {
        // A pinned framework is taken as is.
        Some(pin) => pin.to_string(),
        None => {
            let tfm = selected
                .and_then(|c| c.target_framework.clone())
                .unwrap_or_else(|| {
                    tracing::warn!(
                        "cannot read the target framework of {}, assuming {FALLBACK_TARGET_FRAMEWORK}",
                        project.project_path.display()
                    );
                    FALLBACK_TARGET_FRAMEWORK.to_string()
                });
            validate::check_target_framework(&tfm, config)?;
            tfm
        }
    };
    ctx.pass_target_framework = !(config.dont_guess_target_framework && pinned.is_none());

    ctx.project_dir = project.project_dir();
    ctx.output_dir = output_dir(project, config);
    ctx.assembly_name = project.assembly_name.clone();
    Ok(())
}

/// `<OutputPath>/<folder>[_published]`, anchored at the project directory.
pub fn output_dir(project: &ProjectContext, config: &Configuration) -> PathBuf {
    let output_path = project
        .output_path
        .as_deref()
        .map(|p| PathBuf::from(p.to_string_lossy().replace('\\', std::path::MAIN_SEPARATOR_STR)))
        .unwrap_or_else(|| PathBuf::from("bin"));
    let mut folder = config.output_folder_name.clone();
    if config.use_publish_for_reload {
        folder.push_str("_published");
    }
    let dir = output_path.join(folder);
    if dir.is_absolute() {
        dir
    } else {
        project.project_dir().join(dir)
    }
}

fn framework_args(ctx: &OrchestrationContext) -> Vec<String> {
    if ctx.pass_target_framework {
        vec!["-f".to_string(), ctx.target_framework.clone()]
    } else {
        Vec::new()
    }
}

fn props_arg(props: &Path) -> String {
    format!("/p:CustomBeforeDirectoryBuildProps={}", props.display())
}

async fn run_tool(
    toolchain: &Toolchain,
    ctx: &OrchestrationContext,
    invocation: ProcessInvocation,
) -> Result<ProcessResult, RunError> {
    let invocation = invocation.cancellation(ctx.cancel.clone());
    let result = process::run(&invocation, toolchain.tool_output.as_ref()).await;
    if result.cancelled {
        return Err(RunError::Cancelled);
    }
    ctx.checkpoint()?;
    Ok(result)
}

/// Build errors arrive either on stderr or as `: error` lines in the build log.
fn check_build_output(result: ProcessResult) -> Result<(), RunError> {
    if !result.stderr.is_empty() {
        return Err(RunError::Tool(result.stderr));
    }
    if result.stdout.contains(": error") {
        return Err(RunError::Tool(result.stdout));
    }
    Ok(())
}

async fn build(
    toolchain: &Toolchain,
    request: &RunRequest,
    strategy: &ToolchainStrategy,
    local: Option<&LocalArtifacts>,
    ctx: &mut OrchestrationContext,
) -> Result<(), RunError> {
    let config = &request.config;
    let props = ctx.temp.new_path("props")?;
    tokio::fs::write(&props, strategy::props_file(None)).await?;
    let rid = strategy::runtime_identifier(config);
    let output_dir = ctx.output_dir.display().to_string();

    let (args, env) = if config.use_publish_for_reload {
        let mut args = vec!["publish".to_string()];
        args.extend(framework_args(ctx));
        args.extend([
            "-r".to_string(),
            rid.clone(),
            "-c".to_string(),
            "Release".to_string(),
            "-o".to_string(),
            output_dir,
            "--self-contained".to_string(),
            "true".to_string(),
            "/p:PublishTrimmed=false".to_string(),
            "/p:PublishSingleFile=false".to_string(),
            props_arg(&props),
            "/p:WarningLevel=0".to_string(),
            "/p:TreatWarningsAsErrors=false".to_string(),
            "-v:q".to_string(),
        ]);
        toolchain.report_status(format!("dotnet publish -r {rid} -c Release -o ..."));
        (args, BTreeMap::new())
    } else {
        let mut args = vec!["build".to_string()];
        args.extend(framework_args(ctx));
        args.extend([
            "-c".to_string(),
            "Release".to_string(),
            "-o".to_string(),
            output_dir,
            "--no-self-contained".to_string(),
            "/p:RuntimeIdentifier=".to_string(),
            "/p:RuntimeIdentifiers=".to_string(),
            "/p:WarningLevel=0".to_string(),
            props_arg(&props),
            "/p:TreatWarningsAsErrors=false".to_string(),
            request.project.project_path.display().to_string(),
        ]);
        if config.use_no_restore {
            args.extend(["--no-restore", "--no-dependencies", "--nologo"].map(String::from));
        }
        toolchain.report_status("dotnet build -c Release -o ...");
        (args, strategy::build_env(config.use_no_restore))
    };

    let invocation = ProcessInvocation::new(&toolchain.dotnet)
        .args(args)
        .envs(&env)
        .current_dir(&ctx.project_dir);
    check_build_output(run_tool(toolchain, ctx, invocation).await?)?;

    if let (Some(local), true) = (local, config.use_publish_for_reload) {
        if !ctx.output_dir.is_dir() {
            return Err(RunError::tool(format!(
                "Something went wrong, {} doesn't exist after 'dotnet publish -r {rid} -c Release' step",
                ctx.output_dir.display()
            )));
        }
        toolchain.report_status("Copying files from locally built CoreCLR");
        let (from, to) = (local.checked_dir.clone(), ctx.output_dir.clone());
        let copied = tokio::task::spawn_blocking(move || copy_dir_recursive(&from, &to))
            .await
            .map_err(std::io::Error::other)??;
        tracing::debug!("copied {copied} runtime files over the publish output");
        ctx.checkpoint()?;
    }

    if strategy.needs_loader() {
        toolchain
            .loader()
            .install_into(
                &ctx.target_framework,
                &ctx.output_dir,
                &ctx.cancel,
                toolchain.tool_output.as_ref(),
            )
            .await?;
    }
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn execute(
    toolchain: &Toolchain,
    config: &Configuration,
    strategy: &ToolchainStrategy,
    target: &SymbolTarget,
    ctx: &mut OrchestrationContext,
) -> Result<String, RunError> {
    if config.flowgraph_enable {
        ctx.flowgraph_file = Some(ctx.temp.new_path("fg")?);
    }
    let env = strategy.execution_env(config, target, ctx.flowgraph_file.as_deref());

    let paths = ExecutePaths {
        dotnet: toolchain.dotnet.clone(),
        output_dir: ctx.output_dir.clone(),
        assembly_name: ctx.assembly_name.clone(),
        class_name: target.class_name.clone(),
        method_name: target.method_name.clone(),
    };
    let invocation = strategy
        .execute_invocation(config, env, &paths)
        .current_dir(&ctx.output_dir);
    toolchain.report_status(match strategy {
        ToolchainStrategy::Crossgen2 { .. } => "Executing crossgen2...",
        ToolchainStrategy::NativeAotCustom { .. } => {
            "Executing ILC... Make sure your method is not inlined and is reachable as NativeAOT runs IL Link."
        }
        ToolchainStrategy::RunApp { .. } => "Running the app...",
        _ => "Executing the loader...",
    });

    let result = run_tool(toolchain, ctx, invocation).await?;
    if !result.stderr.is_empty() {
        return Err(RunError::tool(format!(
            "{}\nERROR:\n{}",
            result.stdout, result.stderr
        )));
    }
    Ok(result.stdout)
}

/// Build and compile in one `dotnet publish /p:PublishAot=true`. ILC cannot print to our
/// stdout, so the JIT writes its listing to a file.
async fn publish_native_aot(
    toolchain: &Toolchain,
    config: &Configuration,
    strategy: &ToolchainStrategy,
    target: &SymbolTarget,
    ctx: &mut OrchestrationContext,
) -> Result<String, RunError> {
    let jit_stdout = ctx.temp.new_path("asm")?;
    let mut env = strategy.execution_env(config, target, None);
    env.insert(env_name("JitStdOutFile"), jit_stdout.display().to_string());

    let props = ctx.temp.new_path("props")?;
    tokio::fs::write(&props, strategy::props_file(Some(&env))).await?;

    let mut args = vec!["publish".to_string()];
    args.extend(framework_args(ctx));
    args.extend([
        "-r".to_string(),
        strategy::runtime_identifier(config),
        "-c".to_string(),
        "Release".to_string(),
        "/p:PublishAot=true".to_string(),
        props_arg(&props),
        "/p:WarningLevel=0".to_string(),
        "/p:TreatWarningsAsErrors=false".to_string(),
        "-v:q".to_string(),
    ]);
    toolchain.report_status("Compiling for NativeAOT (.NET 8.0+ is required) ...");

    let invocation = ProcessInvocation::new(&toolchain.dotnet)
        .args(args)
        .current_dir(&ctx.project_dir);
    let result = run_tool(toolchain, ctx, invocation).await?;
    let log = result.stdout.clone();
    check_build_output(result)?;

    if !jit_stdout.exists() {
        return Err(RunError::tool(format!(
            "JitDisasm didn't produce any output :(. Make sure your method is not inlined by the code generator\n\
             (it's a good idea to mark it as [MethodImpl(MethodImplOptions.NoInlining)]) and is reachable from Main() as\n\
             NativeAOT may delete unused methods. Also, JitDisasm doesn't work well for Main() in NativeAOT mode.\n\n\n{log}"
        )));
    }
    Ok(tokio::fs::read_to_string(&jit_stdout).await?)
}
