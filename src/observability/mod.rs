//! Observability for sessions
//!
//! Structured logging setup and the span macros used by the session task and
//! the CLI.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{cli_span, session_span};
