use crate::flowgraph::FlowGraphPhase;
use crate::orchestrator::ToolchainStrategy;
use crate::project::ProjectContext;
use crate::settings::Configuration;
use crate::symbol::{CodeSymbolDescriptor, SymbolTarget};
use serde::Serialize;
use std::time::Duration;

/// Everything one run is computed from.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub symbol: Option<CodeSymbolDescriptor>,
    pub project: ProjectContext,
    pub config: Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// The output bundle of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub timestamp_utc: String,
    pub outcome: RunOutcome,
    pub target: Option<SymbolTarget>,
    pub strategy: Option<ToolchainStrategy>,
    pub target_framework: Option<String>,
    /// Listing on success, the user-facing message otherwise.
    pub output: String,
    /// Output of the previous run in the same session, for diffing.
    pub previous_output: Option<String>,
    /// `*************** Starting PHASE ...` headings of a JIT dump.
    pub jit_dump_phases: Vec<String>,
    pub flowgraph_phases: Vec<FlowGraphPhase>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// One-line summary for status bars and stderr.
    pub fn summary(&self) -> String {
        let what = self
            .target
            .as_ref()
            .map(|t| t.target.as_str())
            .unwrap_or("<no symbol>");
        let how = self.strategy.as_ref().map(ToolchainStrategy::name).unwrap_or("-");
        let outcome = match self.outcome {
            RunOutcome::Succeeded => "done",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        format!(
            "{what} [{how}] {outcome} in {:.1}s",
            self.elapsed.as_secs_f64()
        )
    }
}

pub fn utc_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            timestamp_utc: utc_timestamp(),
            outcome,
            target: Some(SymbolTarget {
                target: "Program:Main".into(),
                class_name: "Program".into(),
                method_name: "Main".into(),
            }),
            strategy: None,
            target_framework: Some("net8.0".into()),
            output: "; Method Program:Main()".into(),
            previous_output: None,
            jit_dump_phases: Vec::new(),
            flowgraph_phases: Vec::new(),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn summary_line() {
        assert_eq!(
            report(RunOutcome::Cancelled).summary(),
            "Program:Main [-] cancelled in 1.5s"
        );
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(report(RunOutcome::Succeeded)).unwrap();
        assert_eq!(json["outcome"], "succeeded");
        assert_eq!(json["elapsed"], "1s 500ms");
        assert_eq!(json["target"]["class_name"], "Program");
        assert!(json["timestamp_utc"].as_str().unwrap().ends_with('Z'));
    }
}
