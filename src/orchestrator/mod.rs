//! Toolchain orchestration.
//!
//! A run goes `Validating -> ResolvingProjectConfig -> Building -> Executing ->
//! Postprocessing` and ends `Done`, `Failed` or `Cancelled`. The session controller
//! serializes runs and carries the previous output from one run to the next.

mod context;
mod controller;
mod pipeline;
pub mod post_process;
pub mod strategy;
pub mod validate;

pub use context::{OrchestrationContext, RunState, TempArtifacts, Toolchain};
pub use controller::{run_session, SessionCommand, SessionEvent};
pub use pipeline::{output_dir, run};
pub use strategy::{ListingKind, RuntimeFlavor, ToolchainStrategy};
