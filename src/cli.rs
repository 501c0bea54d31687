use anyhow::{Context, Result};
use clap::Parser;
use jitdasm::flowgraph::FlowGraphRenderer;
use jitdasm::model::{RunOutcome, RunReport, RunRequest};
use jitdasm::orchestrator::{post_process, run_session, SessionCommand, SessionEvent, Toolchain};
use jitdasm::process::OutputLine;
use jitdasm::project::ProjectContext;
use jitdasm::settings::{self, Compiler, Configuration};
use jitdasm::symbol::{CodeSymbolDescriptor, MethodKind, SymbolMember};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Read stdin lines on a plain thread; a blocked read must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "jitdasm",
    version,
    about = "Disassemble a single .NET method or type with the JIT, crossgen2 or NativeAOT"
)]
#[command(group(
    clap::ArgGroup::new("member").args(["method", "ctor", "local_function", "property"])
))]
pub struct Cli {
    /// Project file (*.csproj) that contains the symbol
    #[arg(long, short = 'p')]
    pub project: PathBuf,

    /// Namespace-qualified type name; nested types use `+` (MyApp.Outer+Inner), generic
    /// types their arity (MyApp.Box`1). Without a member the whole type is compiled.
    #[arg(long = "type", short = 't', value_name = "TYPE")]
    pub type_name: Option<String>,

    /// Method name
    #[arg(long, short = 'm')]
    pub method: Option<String>,

    /// Select the constructors of the type
    #[arg(long)]
    pub ctor: bool,

    /// Local function name (as written in source)
    #[arg(long)]
    pub local_function: Option<String>,

    /// Property name; both accessors are compiled
    #[arg(long)]
    pub property: Option<String>,

    /// The selected method is generic
    #[arg(long, requires = "method")]
    pub generic_method: bool,

    /// Configuration file (defaults to <config dir>/jitdasm/config.json when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path of the dotnet host
    #[arg(long)]
    pub dotnet: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub compiler: Option<Compiler>,

    /// Target architecture (x64, arm64, ...)
    #[arg(long)]
    pub arch: Option<String>,

    /// Emit a full JIT dump instead of the disassembly (needs a checked runtime)
    #[arg(long)]
    pub jit_dump: bool,

    /// Print the inlining tree instead of the disassembly
    #[arg(long)]
    pub print_inlinees: bool,

    /// Run the project's own entry point instead of the loader app
    #[arg(long)]
    pub run_app: bool,

    /// JitDisasm filter to use with --run-app instead of the selected symbol
    #[arg(long, requires = "run_app")]
    pub jit_disasm: Option<String>,

    /// Dump per-phase flow graphs (implies a JIT dump)
    #[arg(long)]
    pub flowgraph: bool,

    /// Path of graphviz `dot`, used for --flowgraph and --render-flowgraphs
    #[arg(long)]
    pub dot: Option<PathBuf>,

    /// Render every flow-graph phase to PNG after the run
    #[arg(long, requires = "flowgraph")]
    pub render_flowgraphs: bool,

    /// Keep the JIT's own comments in the listing
    #[arg(long)]
    pub show_asm_comments: bool,

    #[arg(long)]
    pub tiered: bool,

    #[arg(long)]
    pub pgo: bool,

    /// Ask the JIT for a diffable listing
    #[arg(long)]
    pub diffable: bool,

    /// Root of a locally built dotnet/runtime repository
    #[arg(long, value_name = "REPO")]
    pub runtime: Option<PathBuf>,

    /// JIT library of the local runtime to load as AltJit
    #[arg(long)]
    pub custom_jit: Option<String>,

    /// Reload through `dotnet publish` instead of `dotnet build`
    #[arg(long)]
    pub publish: bool,

    /// Load the assembly into an unloadable context
    #[arg(long)]
    pub unloadable: bool,

    /// Skip restore during the build
    #[arg(long)]
    pub no_restore: bool,

    /// Target framework to build for instead of the one picked from the project
    #[arg(long, short = 'f')]
    pub framework: Option<String>,

    /// Do not pass a target framework to build/publish unless --framework is given
    #[arg(long)]
    pub dont_guess_framework: bool,

    /// Extra crossgen2 arguments
    #[arg(long, allow_hyphen_values = true)]
    pub crossgen2_args: Option<String>,

    /// Extra ilc arguments
    #[arg(long, allow_hyphen_values = true)]
    pub ilc_args: Option<String>,

    /// Extra environment variable for the compiler; repeatable
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Cancel a run that takes longer than this (e.g. 90s, 5m)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,

    /// Keep the session open and read commands from stdin
    #[arg(long, short = 'i')]
    pub interactive: bool,

    /// Echo build and compiler output to stderr while it runs
    #[arg(long)]
    pub stream_tool_output: bool,

    /// More log output (-v, -vv, -vvv); RUST_LOG takes precedence
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// The symbol named on the command line. An unparsable type name yields `None`, which the
/// run reports as an unrecognized symbol.
pub fn symbol_from_args(args: &Cli) -> Option<CodeSymbolDescriptor> {
    let qualified = args.type_name.as_deref()?;
    let member = if let Some(name) = &args.method {
        SymbolMember::Method {
            name: name.clone(),
            kind: MethodKind::Ordinary,
            is_generic: args.generic_method,
        }
    } else if args.ctor {
        SymbolMember::Method {
            name: ".ctor".to_string(),
            kind: MethodKind::Constructor,
            is_generic: false,
        }
    } else if let Some(name) = &args.local_function {
        SymbolMember::Method {
            name: name.clone(),
            kind: MethodKind::LocalFunction,
            is_generic: false,
        }
    } else if let Some(name) = &args.property {
        SymbolMember::Property { name: name.clone() }
    } else {
        SymbolMember::Type
    };
    CodeSymbolDescriptor::from_qualified_type(qualified, member)
}

/// Flags win over the configuration file. Switches only ever turn things on.
pub fn apply_overrides(args: &Cli, config: &mut Configuration) {
    if let Some(compiler) = args.compiler {
        config.compiler = compiler;
    }
    if let Some(arch) = &args.arch {
        config.arch = arch.clone();
    }
    if let Some(repo) = &args.runtime {
        config.use_custom_runtime = true;
        config.path_to_local_runtime = Some(repo.clone());
    }
    if let Some(jit) = &args.custom_jit {
        config.custom_jit = Some(jit.clone());
    }
    if let Some(filter) = &args.jit_disasm {
        config.overridden_jit_disasm = Some(filter.clone());
    }
    if let Some(dot) = &args.dot {
        config.graphviz_dot_path = Some(dot.clone());
    }
    if let Some(tfm) = &args.framework {
        config.overridden_target_framework = Some(tfm.clone());
    }
    if let Some(extra) = &args.crossgen2_args {
        config.crossgen2_args = extra.clone();
    }
    if let Some(extra) = &args.ilc_args {
        config.ilc_args = extra.clone();
    }
    if let Some(timeout) = args.timeout {
        config.timeout = Some(timeout.into());
    }

    config.jit_dump |= args.jit_dump || args.flowgraph;
    config.print_inlinees |= args.print_inlinees;
    config.run_app_mode |= args.run_app;
    config.flowgraph_enable |= args.flowgraph;
    config.show_asm_comments |= args.show_asm_comments;
    config.use_tiered_jit |= args.tiered;
    config.use_pgo |= args.pgo;
    config.diffable |= args.diffable;
    config.use_publish_for_reload |= args.publish;
    config.use_unloadable_context |= args.unloadable;
    config.use_no_restore |= args.no_restore;
    config.dont_guess_target_framework |= args.dont_guess_framework;

    for var in &args.env {
        if !config.custom_env_vars.is_empty() && !config.custom_env_vars.ends_with('\n') {
            config.custom_env_vars.push('\n');
        }
        config.custom_env_vars.push_str(var);
    }
}

/// Read the configuration and the project from disk. Called again for every rerun so edits
/// in between are picked up.
pub fn build_request(args: &Cli) -> Result<RunRequest> {
    let mut config = settings::load_configuration(args.config.as_deref())
        .context("failed to load configuration")?;
    apply_overrides(args, &mut config);
    let project = ProjectContext::load(&args.project)
        .with_context(|| format!("failed to read project {}", args.project.display()))?;
    Ok(RunRequest {
        symbol: symbol_from_args(args),
        project,
        config,
    })
}

const HELP: &str = "commands: [r]erun (or empty line), [c]ancel, [d]iff with previous, [q]uit";

pub async fn run(args: Cli) -> Result<RunOutcome> {
    let request = build_request(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<String>();
    let (tool_tx, mut tool_rx) = mpsc::unbounded_channel::<OutputLine>();
    let toolchain = Arc::new(Toolchain {
        dotnet: args.dotnet.clone().unwrap_or_else(|| PathBuf::from("dotnet")),
        status: Some(status_tx),
        tool_output: args.stream_tool_output.then_some(tool_tx),
        ..Default::default()
    });
    tracing::debug!("temp root: {}", toolchain.temp_root.display());

    // Forwarders end once the toolchain (and with it the senders) is dropped.
    let status_forward = {
        let out = out_tx.clone();
        let quiet = args.json;
        tokio::spawn(async move {
            while let Some(message) = status_rx.recv().await {
                if !quiet {
                    let _ = out.send(OutputLine::Stderr(format!("» {message}")));
                }
            }
        })
    };
    let tool_forward = {
        let out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = tool_rx.recv().await {
                let text = match line {
                    OutputLine::Stdout(text) | OutputLine::Stderr(text) => text,
                };
                let _ = out.send(OutputLine::Stderr(text));
            }
        })
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SessionCommand>();
    let session = tokio::spawn(run_session(Arc::clone(&toolchain), event_tx, cmd_rx));

    let mut stdin_rx = args.interactive.then(spawn_stdin_reader);
    let mut last: Option<RunReport> = None;
    let mut timeout = request.config.timeout;
    let mut renderer = flowgraph_renderer(&request.config);
    let mut deadline = timeout.map(|t| Instant::now() + t);
    let mut running = true;
    let mut listen_ctrl_c = true;
    let _ = cmd_tx.send(SessionCommand::Run(Box::new(request)));

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(SessionEvent::Status(message)) if !args.json => {
                    let _ = out_tx.send(OutputLine::Stderr(format!("» {message}")));
                }
                Some(SessionEvent::Completed(report)) => {
                    running = false;
                    deadline = None;
                    print_report(&args, &out_tx, &report)?;
                    if args.render_flowgraphs && report.is_success() {
                        render_flowgraphs(&report, &renderer, &out_tx).await;
                    }
                    last = Some(*report);
                    if args.interactive {
                        let _ = out_tx.send(OutputLine::Stderr(HELP.to_string()));
                    } else {
                        let _ = cmd_tx.send(SessionCommand::Quit);
                    }
                }
                Some(SessionEvent::Status(_)) => {}
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                if let Some(limit) = timeout {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "Timed out after {}",
                        humantime::format_duration(limit)
                    )));
                }
                let _ = cmd_tx.send(SessionCommand::Cancel);
            }
            signal = tokio::signal::ctrl_c(), if listen_ctrl_c => {
                if let Err(e) = signal {
                    tracing::warn!("failed to listen for Ctrl+C: {e}");
                    listen_ctrl_c = false;
                    continue;
                }
                // First Ctrl+C cancels the run, a second one (or one while idle) quits.
                if running {
                    running = false;
                    let _ = cmd_tx.send(SessionCommand::Cancel);
                } else {
                    let _ = cmd_tx.send(SessionCommand::Quit);
                }
            }
            line = next_line(&mut stdin_rx), if stdin_rx.is_some() => {
                let Some(line) = line else {
                    stdin_rx = None;
                    let _ = cmd_tx.send(SessionCommand::Quit);
                    continue;
                };
                match line.trim() {
                    "" | "r" => match build_request(&args) {
                        Ok(request) => {
                            timeout = request.config.timeout;
                            renderer = flowgraph_renderer(&request.config);
                            deadline = timeout.map(|t| Instant::now() + t);
                            running = true;
                            let _ = cmd_tx.send(SessionCommand::Run(Box::new(request)));
                        }
                        Err(e) => {
                            let _ = out_tx.send(OutputLine::Stderr(format!("{e:#}")));
                        }
                    },
                    "c" => {
                        let _ = cmd_tx.send(SessionCommand::Cancel);
                    }
                    "d" => {
                        let message = match &last {
                            Some(report) => write_diff(&toolchain, report),
                            None => "Nothing to diff yet".to_string(),
                        };
                        let _ = out_tx.send(OutputLine::Stderr(message));
                    }
                    "q" => {
                        stdin_rx = None;
                        let _ = cmd_tx.send(SessionCommand::Quit);
                    }
                    _ => {
                        let _ = out_tx.send(OutputLine::Stderr(HELP.to_string()));
                    }
                }
            }
        }
    }

    session.await.context("session task failed")?;
    drop(toolchain);
    let _ = status_forward.await;
    let _ = tool_forward.await;
    drop(out_tx);
    let _ = out_handle.await;

    Ok(last.map(|r| r.outcome).unwrap_or(RunOutcome::Cancelled))
}

async fn next_line(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

fn print_report(
    args: &Cli,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    report: &RunReport,
) -> Result<()> {
    if args.json {
        let out = serde_json::to_string_pretty(report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        return Ok(());
    }

    if report.is_success() {
        let _ = out_tx.send(OutputLine::Stdout(report.output.trim_end().to_string()));
    } else {
        let _ = out_tx.send(OutputLine::Stderr(report.output.trim_end().to_string()));
    }
    if !report.jit_dump_phases.is_empty() {
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "{} JIT phases: {}",
            report.jit_dump_phases.len(),
            report.jit_dump_phases.join(", ")
        )));
    }
    for phase in &report.flowgraph_phases {
        let location = phase
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "{:>3}. {:<40} {location}",
            phase.ordinal,
            phase.name
        )));
    }
    let _ = out_tx.send(OutputLine::Stderr(report.summary()));
    Ok(())
}

/// Renders with the same `dot` that validation checked: `--dot` or the configuration file.
fn flowgraph_renderer(config: &Configuration) -> FlowGraphRenderer {
    let dot = config
        .graphviz_dot_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("dot"));
    FlowGraphRenderer::new(dot)
}

async fn render_flowgraphs(
    report: &RunReport,
    renderer: &FlowGraphRenderer,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let results = renderer.render_all(&report.flowgraph_phases, &cancel).await;
    watcher.abort();
    for (phase, result) in report.flowgraph_phases.iter().zip(results) {
        let line = match result {
            Ok(image) => format!("rendered {} -> {}", phase.identifier(), image.display()),
            Err(e) => format!("failed to render {}: {e}", phase.identifier()),
        };
        let _ = out_tx.send(OutputLine::Stderr(line));
    }
}

fn write_diff(toolchain: &Toolchain, report: &RunReport) -> String {
    let Some(previous) = report.previous_output.as_deref() else {
        return "No previous output to diff against".to_string();
    };
    match post_process::write_diff_files(&toolchain.temp_root.join("diff"), previous, &report.output) {
        Ok((before, after)) => format!("diff {} {}", before.display(), after.display()),
        Err(e) => format!("failed to write diff files: {e}"),
    }
}
