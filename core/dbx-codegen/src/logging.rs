//! Logging utilities for DBX code generation
//!
//! Generation and execution emit `tracing` events under the `dbx_codegen`
//! target: operator produce/consume, mapping stack traffic, the chosen
//! paradigm, pool reuse. A subscriber is only installed with the `logging`
//! feature; without it every initializer is a no-op.

/// Target every event of this crate is logged under.
pub const TARGET: &str = "dbx_codegen";

/// Filter directive for `level` scoped to [`TARGET`].
///
/// ```rust
/// assert_eq!(dbx_codegen::logging::directive("debug"), "dbx_codegen=debug");
/// ```
pub fn directive(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        format!("{TARGET}=info")
    } else {
        format!("{TARGET}={}", level.to_ascii_lowercase())
    }
}

/// Initialize logging at `info`, or from `RUST_LOG` when set.
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Initialize logging with `level` for the code generator's events.
///
/// A second call is ignored.
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}

/// Route `trace` events through the test writer, so
/// `cargo test --features logging -- --nocapture` shows the produce/consume
/// recursion of a failing case.
#[cfg(feature = "logging")]
pub fn init_test() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::new(directive("trace")))
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_is_scoped_to_crate() {
        assert_eq!(directive("TRACE"), "dbx_codegen=trace");
        assert_eq!(directive("  "), "dbx_codegen=info");
    }

    #[test]
    fn test_target_matches_crate_module_path() {
        assert_eq!(TARGET, env!("CARGO_CRATE_NAME"));
        assert!(module_path!().starts_with(TARGET));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_test();
        init_test();
    }
}
