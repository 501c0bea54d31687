//! Drive the .NET JIT and AOT compilers to disassemble one code symbol, then condense the
//! listing for reading.
//!
//! The binary in `main.rs` is a thin front end; everything it does goes through
//! [`orchestrator::run_session`].

pub mod error;
pub mod flowgraph;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod prettifier;
pub mod process;
pub mod project;
pub mod settings;
pub mod symbol;
