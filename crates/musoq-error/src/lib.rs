use thiserror::Error;

/// Primary error type for every stage of the Musoq pipeline.
///
/// Compile-time variants (lexing through lowering) abort before any row is
/// read. Runtime variants abort the in-flight execution. `Cancelled` is its
/// own outcome and is never reported as a failure by [`MusoqError::is_failure`].
#[derive(Error, Debug)]
pub enum MusoqError {
    // === Front-end ===
    /// Malformed token.
    #[error("{line}:{col}: lex error: {detail}")]
    Lex {
        detail: String,
        offset: usize,
        len: usize,
        line: u32,
        col: u32,
    },

    /// Grammar violation.
    #[error("{line}:{col}: expected {expected}, found {found}")]
    Parse {
        expected: String,
        found: String,
        offset: usize,
        line: u32,
        col: u32,
    },

    // === Name resolution ===
    /// No schema registered under the name used after `#`.
    #[error("schema not found: #{name}")]
    SchemaNotFound { name: String },

    /// The schema exists but does not expose the table.
    #[error("table not found: #{schema}.{name}")]
    TableNotFound { schema: String, name: String },

    /// Unknown alias, CTE or derived source.
    #[error("source not found: {name}")]
    SourceNotFound { name: String },

    /// Column does not exist in any visible source.
    #[error("column not found: {name} (available: {})", .available.join(", "))]
    ColumnNotFound { name: String, available: Vec<String> },

    /// Column exists in more than one source and was not qualified.
    #[error("ambiguous column {name}: candidates {}", .candidates.join(", "))]
    AmbiguousColumn {
        name: String,
        candidates: Vec<String>,
    },

    /// No overload accepts the argument types.
    #[error("method not found: {name}({})", .arg_types.join(", "))]
    MethodNotFound {
        name: String,
        arg_types: Vec<String>,
    },

    /// More than one overload is equally applicable.
    #[error("ambiguous call {name}({}): candidates {}", .arg_types.join(", "), .candidates.join("; "))]
    AmbiguousMethod {
        name: String,
        arg_types: Vec<String>,
        candidates: Vec<String>,
    },

    // === Typing ===
    /// Operator or assignment type incompatibility.
    #[error("type mismatch in {context}: expected {expected}, found {actual}")]
    TypeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// Set-operation branches disagree in arity or column types.
    #[error("{operator} type mismatch: {detail}")]
    SetOperationTypeMismatch { operator: String, detail: String },

    /// Structurally invalid query (misplaced aggregate, duplicate alias, ...).
    #[error("semantic error: {detail}")]
    Semantic { detail: String },

    // === Lowering ===
    /// Lowering to an executable plan failed. `plan` carries the partial
    /// intermediate representation for diagnostics.
    #[error("compilation failed: {detail}")]
    Compilation { detail: String, plan: String },

    // === Execution ===
    /// Predicate, projection or aggregate evaluation failed.
    #[error("runtime evaluation failed in `{expression}`{}: {detail}", fmt_row(.row))]
    RuntimeEvaluation {
        detail: String,
        expression: String,
        row: Option<u64>,
    },

    /// A row source reported a failure.
    #[error("row source {source_name} failed: {detail}")]
    SourceFailure { source_name: String, detail: String },

    /// Execution stopped by a cancellation token.
    #[error("query cancelled")]
    Cancelled,

    // === Ambient ===
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_row(row: &Option<u64>) -> String {
    row.map_or_else(String::new, |r| format!(" at row {r}"))
}

/// Stable numeric codes for [`MusoqError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Token-level failure.
    Lex = 1,
    /// Grammar failure.
    Parse = 2,
    /// Schema, table or source lookup failure.
    NotFound = 3,
    /// Column lookup failure.
    Column = 4,
    /// Method lookup failure.
    Method = 5,
    /// Type checking failure.
    Mismatch = 6,
    /// Structural query error.
    Semantic = 7,
    /// Lowering failure.
    Compilation = 8,
    /// Evaluation failure while rows flow.
    Runtime = 9,
    /// Cooperative cancellation.
    Interrupt = 10,
    /// Configuration rejected.
    Config = 11,
    /// Engine bug.
    Internal = 12,
    /// I/O failure.
    IoErr = 13,
}

impl MusoqError {
    /// Get the numeric error code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Lex { .. } => ErrorCode::Lex,
            Self::Parse { .. } => ErrorCode::Parse,
            Self::SchemaNotFound { .. }
            | Self::TableNotFound { .. }
            | Self::SourceNotFound { .. } => ErrorCode::NotFound,
            Self::ColumnNotFound { .. } | Self::AmbiguousColumn { .. } => ErrorCode::Column,
            Self::MethodNotFound { .. } | Self::AmbiguousMethod { .. } => ErrorCode::Method,
            Self::TypeMismatch { .. } | Self::SetOperationTypeMismatch { .. } => {
                ErrorCode::Mismatch
            }
            Self::Semantic { .. } => ErrorCode::Semantic,
            Self::Compilation { .. } => ErrorCode::Compilation,
            Self::RuntimeEvaluation { .. } | Self::SourceFailure { .. } => ErrorCode::Runtime,
            Self::Cancelled => ErrorCode::Interrupt,
            Self::InvalidConfig(_) => ErrorCode::Config,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Io(_) => ErrorCode::IoErr,
        }
    }

    /// Whether the error was raised before execution started.
    #[must_use]
    pub const fn is_compile_time(&self) -> bool {
        matches!(
            self.error_code(),
            ErrorCode::Lex
                | ErrorCode::Parse
                | ErrorCode::NotFound
                | ErrorCode::Column
                | ErrorCode::Method
                | ErrorCode::Mismatch
                | ErrorCode::Semantic
                | ErrorCode::Compilation
        )
    }

    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Everything except cancellation counts as a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !self.is_cancellation()
    }

    pub fn type_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn semantic(detail: impl Into<String>) -> Self {
        Self::Semantic {
            detail: detail.into(),
        }
    }

    pub fn runtime(detail: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::RuntimeEvaluation {
            detail: detail.into(),
            expression: expression.into(),
            row: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attach a row ordinal to a runtime error that does not carry one yet.
    #[must_use]
    pub fn at_row(self, row_index: u64) -> Self {
        match self {
            Self::RuntimeEvaluation {
                detail,
                expression,
                row: None,
            } => Self::RuntimeEvaluation {
                detail,
                expression,
                row: Some(row_index),
            },
            other => other,
        }
    }
}

/// Result type alias using `MusoqError`.
pub type Result<T> = std::result::Result<T, MusoqError>;
