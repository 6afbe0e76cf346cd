#[macro_use]
extern crate slog_scope;

mod logging;
mod metrics;

pub use logging::{init_logging, reset_logging};
pub use metrics::{metrics_from_opts, MetricError, Metrics};

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

/// Errors that can describe themselves to an external error reporter.
pub trait ReportableError {
    fn error_backtrace(&self) -> String;
    fn is_reportable(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

/// Types that implement this trait can represent internal errors.
pub trait InternalError {
    /// Constructs an internal error with the given error message.
    fn internal_error(message: String) -> Self;
}
