//! Supervise a second copy of the running program and catch its panics.
//!
//! [`wrap`] re-executes the current binary with the same arguments, passes
//! stdin/stdout straight through, and watches the child's stderr for a panic
//! report. Ordinary stderr is forwarded as it arrives. When the child exits
//! with a non-zero status after printing a panic report, the report is handed
//! to the configured handler instead of being printed.
//!
//! ```no_run
//! # async fn run() -> Result<(), faultwrap::WrapError> {
//! let status = faultwrap::basic_wrap(|report| {
//!     eprintln!("child crashed:\n{}", String::from_utf8_lossy(&report));
//! })
//! .await?;
//!
//! if let faultwrap::WrapStatus::Parent(code) = status {
//!     std::process::exit(code);
//! }
//! // We are the supervised child: run the real program.
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod scanner;
pub mod signals;
pub mod stream;
pub mod supervisor;
pub mod wrap;

pub use config::{load_settings, DetectorConfig, GuardConfig, RelayConfig, WrapSettings};
pub use error::WrapError;
pub use guard::IdentityGuard;
pub use wrap::{
    basic_wrap, supervise, wrap, wrap_blocking, Handler, WrapConfig, WrapStatus, CHILD_STATUS,
};
