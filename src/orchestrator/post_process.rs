//! Post-run processing utilities.
//!
//! Turns execute-step output into what the user sees: prettified listings, JIT-dump phase
//! headings, per-phase flow graphs, and files for diffing two runs.

use super::context::{OrchestrationContext, Toolchain};
use super::strategy::{ListingKind, ToolchainStrategy};
use crate::error::RunError;
use crate::flowgraph;
use crate::prettifier::{self, PrettifyMode};
use crate::settings::Configuration;
use std::path::{Path, PathBuf};

const PHASE_HEADING: &str = "*************** Starting PHASE ";

/// Prettify a disassembly listing; dumps and inlinee trees are passed through untouched.
pub fn render_listing(strategy: &ToolchainStrategy, config: &Configuration, raw: &str) -> String {
    if strategy.listing() != ListingKind::Disasm {
        return raw.to_string();
    }
    let mode = if strategy.is_run_app() {
        PrettifyMode::RunApp
    } else {
        PrettifyMode::Listing
    };
    prettifier::prettify(raw, !config.show_asm_comments, mode)
}

/// Phase headings of a JIT dump, in order, without the banner prefix.
pub fn jit_dump_phases(dump: &str) -> Vec<String> {
    dump.lines()
        .filter_map(|line| line.trim_start().strip_prefix(PHASE_HEADING))
        .map(|phase| phase.trim().to_string())
        .filter(|phase| !phase.is_empty())
        .collect()
}

/// Finish a run's output: listing, dump phases and (when requested) flow graphs.
pub fn process_run_output(
    toolchain: &Toolchain,
    config: &Configuration,
    ctx: &mut OrchestrationContext,
    raw: &str,
) -> Result<(), RunError> {
    let Some(strategy) = ctx.strategy.as_ref() else {
        return Err(RunError::tool("no strategy was selected for this run"));
    };
    ctx.output = render_listing(strategy, config, raw);
    if strategy.listing() == ListingKind::Dump {
        ctx.jit_dump_phases = jit_dump_phases(raw);
    }

    if let Some(base) = ctx.flowgraph_file.clone() {
        ctx.checkpoint()?;
        let dot_file = dot_file_for(&base);
        ctx.temp.track(dot_file.clone());
        let dump = read_flowgraph_dump(&dot_file)?;
        let dir = flowgraph::new_phase_dir(&toolchain.temp_root);
        ctx.flowgraph_phases = flowgraph::split_and_persist(&dump, &dir)?;
        tracing::info!(
            "{} flow graph phases written to {}",
            ctx.flowgraph_phases.len(),
            dir.display()
        );
    }
    Ok(())
}

/// The JIT appends `.dot` to `JitDumpFgFile`.
pub fn dot_file_for(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".dot");
    PathBuf::from(name)
}

fn read_flowgraph_dump(dot_file: &Path) -> Result<String, RunError> {
    if !dot_file.exists() {
        return Err(RunError::tool(format!(
            "Oops, JitDumpFgFile ('{}') doesn't exist :(\nInvalid Phase name?",
            dot_file.display()
        )));
    }
    let dump = std::fs::read_to_string(dot_file)?;
    if dump.is_empty() {
        return Err(RunError::tool(format!(
            "Oops, JitDumpFgFile ('{}') file is empty :(\nInvalid Phase name?",
            dot_file.display()
        )));
    }
    Ok(dump)
}

/// Write the previous and current outputs side by side for an external diff tool.
pub fn write_diff_files(
    dir: &Path,
    previous: &str,
    current: &str,
) -> std::io::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let before = dir.join("previous.asm");
    let after = dir.join("current.asm");
    std::fs::write(&before, previous)?;
    std::fs::write(&after, current)?;
    Ok((before, after))
}
