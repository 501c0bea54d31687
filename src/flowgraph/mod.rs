//! Per-phase flow graphs from a `JitDumpFg` dump.
//!
//! With `JitDumpFgPhase=*` the JIT appends one DOT graph per compilation phase to a single
//! file. [`split`] cuts it back into phases; [`split_and_persist`] also writes each one to
//! `<dir>/<absolute ordinal>. <phase>.dot` so it can be rendered on demand.

mod render;

pub use render::{default_render_capacity, FlowGraphRenderer, RenderError};

use rand::RngCore;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const GRAPH_SEPARATOR: &str = "digraph FlowGraph {";
const LABEL_START: &str = "graph [label = ";
const LABEL_END: &str = "\"];";
const PHASE_PREFIX: &str = " after ";
/// First phase of every tier; tier-0 and tier-1 dumps end up in the same file.
pub const INITIAL_PHASE: &str = "Pre-import";
const PHASE_DIRS: &str = "flowgraphs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowGraphPhase {
    /// Position within the current compilation tier, starting at 1.
    pub ordinal: u32,
    /// Position within the whole dump, starting at 1.
    pub absolute_ordinal: u32,
    pub name: String,
    #[serde(skip)]
    pub graph_text: String,
    pub file_path: Option<PathBuf>,
}

impl FlowGraphPhase {
    pub fn identifier(&self) -> String {
        format!("{}. {}", self.absolute_ordinal, self.name)
    }

    pub fn is_initial_phase(&self) -> bool {
        self.name.contains(INITIAL_PHASE)
    }
}

/// Split a dump into phases. Fragments whose label cannot be read are skipped.
pub fn split(dump: &str) -> Vec<FlowGraphPhase> {
    let mut phases = Vec::new();
    let mut ordinal = 0u32;
    let mut absolute_ordinal = 0u32;

    for fragment in dump.split(GRAPH_SEPARATOR).filter(|f| !f.is_empty()) {
        let Some(name) = phase_name(fragment) else {
            tracing::debug!(
                "skipping flow graph without a readable phase label: {:?}",
                fragment.chars().take(80).collect::<String>()
            );
            continue;
        };

        if name == INITIAL_PHASE {
            ordinal = 0;
        }
        ordinal += 1;
        absolute_ordinal += 1;

        phases.push(FlowGraphPhase {
            ordinal,
            absolute_ordinal,
            name: sanitize_file_name(&name),
            graph_text: format!("{GRAPH_SEPARATOR}\n{fragment}"),
            file_path: None,
        });
    }
    phases
}

/// `graph [label = "Flowgraph for method X\nafter Pre-import"];` -> `Pre-import`
fn phase_name(fragment: &str) -> Option<String> {
    let start = fragment.find(LABEL_START)? + LABEL_START.len();
    let label = &fragment[start..];
    let label = &label[..label.find(LABEL_END)?];
    let label = label.replace("\\n", " ");
    let name = &label[label.rfind(PHASE_PREFIX)? + PHASE_PREFIX.len()..];
    Some(name.trim().to_string())
}

/// Replace characters that are not allowed in file names on any supported OS.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

pub fn split_and_persist(dump: &str, dir: &Path) -> std::io::Result<Vec<FlowGraphPhase>> {
    persist(split(dump), dir)
}

/// Write every phase into `dir` as `<identifier>.dot`. Phases that fail to write are skipped.
pub fn persist(phases: Vec<FlowGraphPhase>, dir: &Path) -> std::io::Result<Vec<FlowGraphPhase>> {
    std::fs::create_dir_all(dir)?;
    let mut persisted = Vec::new();
    for mut phase in phases {
        let path = dir.join(format!("{}.dot", phase.identifier()));
        match std::fs::write(&path, &phase.graph_text) {
            Ok(()) => {
                phase.file_path = Some(path);
                persisted.push(phase);
            }
            Err(err) => tracing::warn!("failed to write {}: {err}", path.display()),
        }
    }
    Ok(persisted)
}

/// A fresh, uniquely named directory path under `root` for one run's graphs.
pub fn new_phase_dir(root: &Path) -> PathBuf {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    let name: String = id.iter().map(|b| format!("{b:02x}")).collect();
    root.join(PHASE_DIRS).join(name)
}

/// Remove the graphs left under `root` by earlier runs.
pub fn clear_phase_dirs(root: &Path) {
    let dir = root.join(PHASE_DIRS);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => tracing::debug!("removed old flow graphs in {}", dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("failed to remove {}: {err}", dir.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(phase: &str) -> String {
        format!(
            "{GRAPH_SEPARATOR}\n    graph [label = \"Flowgraph for method Program:Foo()\\nafter {phase}\"];\n    BB01 -> BB02;\n}}\n"
        )
    }

    #[test]
    fn ordinals_reset_at_each_tier() {
        let dump: String = ["Pre-import", "Importation", "Morph - Global", "Pre-import", "Importation"]
            .iter()
            .map(|p| graph(p))
            .collect();
        let phases = split(&dump);

        let ordinals: Vec<(u32, u32)> = phases.iter().map(|p| (p.ordinal, p.absolute_ordinal)).collect();
        assert_eq!(ordinals, [(1, 1), (2, 2), (3, 3), (1, 4), (2, 5)]);
        assert_eq!(phases[2].name, "Morph - Global");
        assert!(phases[3].is_initial_phase());
    }

    #[test]
    fn isolated_graph_text_is_a_complete_graph() {
        let phases = split(&graph("Importation"));
        assert_eq!(phases.len(), 1);
        assert!(phases[0].graph_text.starts_with("digraph FlowGraph {\n"));
        assert!(phases[0].graph_text.contains("BB01 -> BB02;"));
        assert_eq!(phases[0].identifier(), "1. Importation");
    }

    #[test]
    fn malformed_fragments_are_skipped() {
        let dump = format!(
            "{}{GRAPH_SEPARATOR}\n  no label here\n}}\n{}",
            graph("Pre-import"),
            graph("Importation")
        );
        let phases = split(&dump);
        let names: Vec<&str> = phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Pre-import", "Importation"]);
        assert_eq!(phases[1].absolute_ordinal, 2);
    }

    #[test]
    fn uses_last_after_in_label() {
        let phases = split(&graph("Do 'after' things after Morph/Struct <x>"));
        assert_eq!(phases[0].name, "Morph_Struct _x_");
    }

    #[test]
    fn empty_dump_yields_nothing() {
        assert!(split("").is_empty());
        assert!(split("garbage without graphs").is_empty());
    }

    #[test]
    fn persists_one_file_per_phase() {
        let dir = tempfile::tempdir().unwrap();
        let dump: String = ["Pre-import", "Importation"].iter().map(|p| graph(p)).collect();
        let phases = split_and_persist(&dump, dir.path()).unwrap();

        assert_eq!(phases.len(), 2);
        let second = phases[1].file_path.as_ref().unwrap();
        assert_eq!(second.file_name().unwrap(), "2. Importation.dot");
        let text = std::fs::read_to_string(second).unwrap();
        assert_eq!(text, phases[1].graph_text);
    }

    #[test]
    fn phase_dirs_are_unique() {
        let root = Path::new("/tmp/jitdasm");
        assert_ne!(new_phase_dir(root), new_phase_dir(root));
    }

    #[test]
    fn clearing_removes_earlier_runs() {
        let root = tempfile::tempdir().unwrap();
        let old = new_phase_dir(root.path());
        split_and_persist(&graph("Importation"), &old).unwrap();
        std::fs::write(root.path().join("keep.txt"), "x").unwrap();

        clear_phase_dirs(root.path());
        assert!(!old.exists());
        assert!(root.path().join("keep.txt").exists());

        // Nothing to remove is fine.
        clear_phase_dirs(root.path());
    }
}
