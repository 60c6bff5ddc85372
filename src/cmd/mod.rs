//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module  | Commands handled                  |
//! |---------|-----------------------------------|
//! | `run`   | `Start`, `Resume`, `Supervise`    |
//! | `state` | `Status`, `Steps`, `Reset`        |

pub mod run;
pub mod state;

pub use run::{cmd_resume, cmd_start, cmd_supervise};
pub use state::{cmd_reset, cmd_status, cmd_steps};
