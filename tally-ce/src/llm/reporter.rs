//! Fire-and-forget error reporting

/// External error/analytics collaborator
///
/// Implementations must not block or fail the caller.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, message: &str);
}

/// Reporter that forwards to the tracing pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &str, message: &str) {
        tracing::error!(context = context, "{}", message);
    }
}
