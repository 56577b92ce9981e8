//! # supervisor
//!
//! Runs long installer commands as named steps:
//! - Steps can be skipped or selected by name ([`StepPolicy`])
//! - stdout and stderr are multiplexed on one thread with `poll(2)`
//! - Output lines are stripped of ANSI colors and logged at their embedded
//!   level when they carry one ([`classify`](classify::classify))
//! - Interactive confirmation prompts are answered with `y`
//! - A failed step ends the program
//!
//! ## Example
//!
//! ```no_run
//! use supervisor::{StepPolicy, Supervisor};
//!
//! let mut sup = Supervisor::new(StepPolicy::all()).with_path_marker(".python");
//! let command: Vec<String> = ["dnf", "install", "-y", "satellite"]
//!     .iter()
//!     .map(ToString::to_string)
//!     .collect();
//! sup.run_step(&command, "pkg-install", Some("Is this ok"))
//!     .expect("failed to start step");
//! ```

#![warn(clippy::all)]

pub mod classify;
pub mod error;
pub mod policy;
pub mod supervisor;

pub use classify::{LogLine, Stream};
pub use error::{Error, Result};
pub use policy::StepPolicy;
pub use supervisor::{
    LineSink, LogSink, ProcessExit, ProcessRun, RunState, STEP_TARGET, Supervisor, Terminator,
};
