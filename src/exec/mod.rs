//! Execution backend — the black box that compiles and runs user code.
//!
//! DESIGN
//! ======
//! The session router only sees the [`ExecutionBackend`] trait: hand it a
//! request, get back a live [`ExecutionHandle`] with an event stream, a stdin
//! sender, and a cancel switch. [`process::ProcessBackend`] is the bundled
//! implementation that shells out to local toolchains; tests substitute a
//! scripted backend.

pub mod process;
pub mod types;

pub use process::ProcessBackend;
pub use types::{ExecError, ExecEvent, ExecRequest, ExecutionBackend, OutputStream};
