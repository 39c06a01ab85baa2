//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `stages` | `Stages`         |

pub mod run;
pub mod stages;

pub use run::cmd_run;
pub use stages::cmd_stages;
