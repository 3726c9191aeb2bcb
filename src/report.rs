//! Observer hooks for incremental-build remarks.
//!
//! The driver decides how remarks reach the user (stderr, a TUI, nothing).
//! All callbacks may be invoked from any thread.

use std::path::Path;

/// Receives the remarks the incremental machinery emits while planning and
/// scheduling.
pub trait Reporter: Send + Sync {
    /// A general remark, optionally about one input.
    fn report(&self, message: &str, input: Option<&Path>);

    /// Dependency nodes were invalidated because of an external dependency.
    fn report_invalidated(&self, nodes: &[String], external_dependency: &str, reason: &str);

    /// Incremental compilation is being disabled for this invocation.
    fn report_disabling(&self, reason: &str);
}

/// Forwards every remark to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, message: &str, input: Option<&Path>) {
        match input {
            Some(input) => debug!("{message}: {}", input.display()),
            None => debug!("{message}"),
        }
    }

    fn report_invalidated(&self, nodes: &[String], external_dependency: &str, reason: &str) {
        debug!(
            "invalidated {} node(s) because {external_dependency} {reason}: {nodes:?}",
            nodes.len()
        );
    }

    fn report_disabling(&self, reason: &str) {
        warn!("Incremental compilation has been disabled, because {reason}");
    }
}

/// Swallows all remarks. Useful when the driver was not asked for
/// incremental diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _message: &str, _input: Option<&Path>) {}
    fn report_invalidated(&self, _nodes: &[String], _external_dependency: &str, _reason: &str) {}
    fn report_disabling(&self, _reason: &str) {}
}
