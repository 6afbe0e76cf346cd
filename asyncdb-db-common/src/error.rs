use std::fmt;

use asyncdb_common::{impl_fmt_display, InternalError, ReportableError};
use backtrace::Backtrace;
use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

/// An error crossing the worker boundary or raised by the dispatch layer.
/// The embedded message is what a failed future carries to the caller.
#[derive(Debug)]
pub struct DbError {
    kind: DbErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
enum DbErrorKind {
    #[error("no workers available")]
    NoWorkers,

    #[error("Invalid bridge configuration: {}", _0)]
    InvalidConfig(String),

    #[error("Worker Load Fail: {}", _0)]
    WorkerLoad(String),

    #[error("Specified source does not exist: {}", _0)]
    SourceNotFound(String),

    #[error("record not found")]
    RecordNotFound,

    #[error("{}", _0)]
    Query(String),

    #[error("Database deadlock detected")]
    Deadlock,

    #[error("{}", _0)]
    Timeout(String),

    #[error("{}", _0)]
    InvalidParam(String),

    #[error("Unexpected error: {}", _0)]
    Internal(String),
}

impl DbError {
    pub fn no_workers() -> Self {
        DbErrorKind::NoWorkers.into()
    }

    pub fn invalid_config(msg: String) -> Self {
        DbErrorKind::InvalidConfig(msg).into()
    }

    pub fn worker_load(msg: String) -> Self {
        DbErrorKind::WorkerLoad(msg).into()
    }

    pub fn source_not_found(name: &str) -> Self {
        DbErrorKind::SourceNotFound(name.to_owned()).into()
    }

    pub fn record_not_found() -> Self {
        DbErrorKind::RecordNotFound.into()
    }

    pub fn query(msg: String) -> Self {
        DbErrorKind::Query(msg).into()
    }

    pub fn deadlock() -> Self {
        DbErrorKind::Deadlock.into()
    }

    pub fn timeout(msg: String) -> Self {
        DbErrorKind::Timeout(msg).into()
    }

    pub fn invalid_param(msg: String) -> Self {
        DbErrorKind::InvalidParam(msg).into()
    }

    pub fn internal(msg: String) -> Self {
        DbErrorKind::Internal(msg).into()
    }
}

pub trait DbErrorIntrospect {
    fn is_record_not_found(&self) -> bool;
    fn is_source_not_found(&self) -> bool;
    fn is_deadlock(&self) -> bool;
    fn is_timeout(&self) -> bool;
    fn is_worker_load(&self) -> bool;
}

impl DbErrorIntrospect for DbError {
    fn is_record_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::RecordNotFound)
    }

    fn is_source_not_found(&self) -> bool {
        matches!(self.kind, DbErrorKind::SourceNotFound(_))
    }

    fn is_deadlock(&self) -> bool {
        matches!(self.kind, DbErrorKind::Deadlock)
    }

    fn is_timeout(&self) -> bool {
        matches!(self.kind, DbErrorKind::Timeout(_))
    }

    fn is_worker_load(&self) -> bool {
        matches!(self.kind, DbErrorKind::WorkerLoad(_))
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_reportable(&self) -> bool {
        !matches!(
            self.kind,
            DbErrorKind::RecordNotFound | DbErrorKind::SourceNotFound(_)
        )
    }

    fn metric_label(&self) -> Option<String> {
        match self.kind {
            DbErrorKind::Deadlock => Some("bridge.deadlock".to_owned()),
            DbErrorKind::Timeout(_) => Some("bridge.timeout".to_owned()),
            DbErrorKind::NoWorkers => Some("bridge.no_workers".to_owned()),
            _ => None,
        }
    }
}

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbError::internal(message)
    }
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(inner: serde_json::Error) -> Self {
        DbError::internal(inner.to_string())
    }
}

impl_fmt_display!(DbError, DbErrorKind);
