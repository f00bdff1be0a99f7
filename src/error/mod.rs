use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

mod sync;

pub use sync::{SyncError, SyncResult};

/// Error shape handed to the UI and printed by the CLI.
///
/// `code` is stable and machine readable (`SYNC/NETWORK`, `IO/NotFound`, ...);
/// `message` is safe to show as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

impl AppError {
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// First code in the cause chain that is not [`AppError::UNKNOWN_CODE`].
    ///
    /// Context added with `anyhow::Context` wraps typed errors in unknown-coded
    /// layers; this digs the typed code back out.
    pub fn root_code(&self) -> &str {
        let mut current = self;
        loop {
            if current.code != Self::UNKNOWN_CODE {
                return &current.code;
            }
            match current.cause.as_deref() {
                Some(cause) => current = cause,
                None => return &self.code,
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(sync) = err.downcast_ref::<SyncError>() {
                return sync.clone().into();
            }
            if let Some(io) = err.downcast_ref::<IoError>() {
                return from_io(io);
            }
            if let Some(sqlx) = err.downcast_ref::<SqlxError>() {
                return from_sqlx(sqlx);
            }
            if let Some(json) = err.downcast_ref::<SerdeJsonError>() {
                return from_json(json);
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

fn from_io(error: &IoError) -> AppError {
    let mut app_error = AppError::new(format!("IO/{:?}", error.kind()), error.to_string());
    if let Some(os_code) = error.raw_os_error() {
        app_error = app_error.with_context("os_code", os_code.to_string());
    }
    app_error
}

fn from_json(error: &SerdeJsonError) -> AppError {
    let code = if error.is_syntax() || error.is_eof() {
        "JSON/SYNTAX"
    } else if error.is_data() {
        "JSON/DATA"
    } else {
        "JSON/ERROR"
    };
    let mut app_error = AppError::new(code, error.to_string());
    if error.line() > 0 {
        app_error = app_error.with_contexts([
            ("line", error.line().to_string()),
            ("column", error.column().to_string()),
        ]);
    }
    app_error
}

/// Storage failures all surface as an unavailable cache; the sqlx detail
/// rides along in `context` for the log.
fn from_sqlx(error: &SqlxError) -> AppError {
    let detail = match error {
        SqlxError::PoolClosed => "pool_closed".to_string(),
        SqlxError::PoolTimedOut => "pool_timeout".to_string(),
        SqlxError::Database(db) => db
            .code()
            .map(|code| format!("sqlite_{code}"))
            .unwrap_or_else(|| "database".to_string()),
        SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => "decode".to_string(),
        SqlxError::Io(_) => "io".to_string(),
        _ => "other".to_string(),
    };
    AppError::from(SyncError::CacheUnavailable(error.to_string())).with_context("sqlx", detail)
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        from_io(&error)
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        from_json(&error)
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        from_sqlx(&error)
    }
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        let app_error = AppError::new(error.code(), error.to_string());
        match error {
            SyncError::VersionConflict {
                task_id,
                expected,
                actual,
            } => app_error.with_contexts([
                ("task_id", task_id),
                ("expected_version", expected.to_string()),
                ("server_version", actual.to_string()),
            ]),
            SyncError::QueueCorruption { local_id, .. } => {
                app_error.with_context("local_id", local_id)
            }
            SyncError::NetworkFailure(_) => app_error.with_context("retryable", "true"),
            _ => app_error,
        }
    }
}
