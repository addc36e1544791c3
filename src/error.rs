//! # Error Handling for Codec Evaluation
//!
//! Every failure in a rate-accuracy sweep falls into one of a small number of
//! categories, and each category has a fixed blast radius:
//!
//! | Category | Scope | Effect on the sweep |
//! |----------|-------|---------------------|
//! | `Config` | sweep | abort before any work starts |
//! | `Dataset` | sweep | abort (dataset root or annotations unusable) |
//! | `Codec`, `CodecTimeout` | sample | sample skipped for this operating point |
//! | `Inference` | sample | sample skipped for this operating point |
//! | `CacheConflict` | sample | warning only, resolved by the conflict policy |
//! | `Metric` | operating point | entry persisted as invalid, sweep continues |
//! | `Cancelled` | sweep | abort, partially written result stays valid |
//!
//! The scope is exposed through [`EvalError::scope`] so the orchestrator never
//! has to pattern-match on individual variants to decide what to do.
//!
//! ## Usage
//!
//! ```rust
//! use vcm_eval::error::{EvalError, ErrorScope};
//!
//! let error = EvalError::codec("vtm-12.0", "encode", "exit status 1")
//!     .with_sample("000000397133")
//!     .with_operating_point("qp32")
//!     .with_recovery_suggestion("inspect the captured encoder stderr");
//!
//! assert_eq!(error.scope(), ErrorScope::Sample);
//! ```

use std::{collections::BTreeMap, error::Error as StdError, fmt, path::PathBuf, time::SystemTime};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, e.g. a resolved cache conflict
    Warning,
    /// Per-sample or per-operating-point failure
    Error,
    /// Aborts the sweep
    Fatal,
}

/// How far an error propagates through a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only the current sample is affected; it is recorded and skipped.
    Sample,
    /// The current operating point is marked invalid; the sweep moves on.
    OperatingPoint,
    /// The sweep cannot continue.
    Sweep,
}

/// Metadata about when and where an error occurred.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// When the error occurred
    pub timestamp: SystemTime,
    /// The operation being performed when the error occurred
    pub operation: Option<String>,
    /// Additional context about the error
    pub context: Option<String>,
    /// Suggested recovery action
    pub recovery_suggestion: Option<String>,
    /// Sample identity, when the error belongs to one sample
    pub sample_id: Option<String>,
    /// Operating point label, when known
    pub operating_point: Option<String>,
    /// Error severity level
    pub severity: ErrorSeverity,
    /// Additional metadata as key-value pairs
    pub metadata: BTreeMap<String, String>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            operation: None,
            context: None,
            recovery_suggestion: None,
            sample_id: None,
            operating_point: None,
            severity: ErrorSeverity::Error,
            metadata: BTreeMap::new(),
        }
    }
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self::default()
    }

    fn with_severity(severity: ErrorSeverity) -> Self {
        Self {
            severity,
            ..Self::default()
        }
    }
}

/// Base error type for the evaluation pipeline
#[derive(Debug)]
pub enum EvalError {
    /// Missing dataset root, unknown codec, malformed override, ...
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// Dataset could not be opened or a sample could not be read
    Dataset {
        path: Option<PathBuf>,
        reason: String,
        context: ErrorContext,
    },
    /// Encoder/decoder failure: non-zero exit, malformed artifact, model error
    Codec {
        codec: String,
        stage: String,
        reason: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
        context: ErrorContext,
    },
    /// External codec subprocess exceeded its time budget
    CodecTimeout {
        codec: String,
        stage: String,
        timeout_ms: u64,
        context: ErrorContext,
    },
    /// A cache path existed when a fresh encode was about to write to it
    CacheConflict {
        path: PathBuf,
        resolution: String,
        context: ErrorContext,
    },
    /// Cache entry unreadable or unwritable
    Cache {
        path: PathBuf,
        reason: String,
        context: ErrorContext,
    },
    /// Vision model failed on a reconstructed sample
    Inference {
        model: String,
        reason: String,
        context: ErrorContext,
    },
    /// Aggregate metric could not be computed for an operating point
    Metric {
        evaluator: String,
        reason: String,
        context: ErrorContext,
    },
    /// I/O errors
    Io {
        operation: String,
        path: Option<PathBuf>,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// External library errors
    External {
        library: String,
        source: Box<dyn StdError + Send + Sync>,
        context: ErrorContext,
    },
    /// The sweep was cancelled (signal or caller request)
    Cancelled {
        during: String,
        context: ErrorContext,
    },
}

impl EvalError {
    /// Create a configuration error
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a dataset error
    pub fn dataset(path: Option<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Dataset {
            path,
            reason: reason.into(),
            context: ErrorContext::with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Create a codec error
    pub fn codec(
        codec: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Codec {
            codec: codec.into(),
            stage: stage.into(),
            reason: reason.into(),
            exit_code: None,
            stderr: None,
            context: ErrorContext::new(),
        }
    }

    /// Create a codec error for a subprocess that exited unsuccessfully
    pub fn codec_exit(
        codec: impl Into<String>,
        stage: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        let stderr = stderr.into();
        Self::Codec {
            codec: codec.into(),
            stage: stage.into(),
            reason: match exit_code {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            },
            exit_code,
            stderr: (!stderr.is_empty()).then_some(stderr),
            context: ErrorContext::new(),
        }
    }

    /// Create a codec timeout error
    pub fn codec_timeout(codec: impl Into<String>, stage: impl Into<String>, timeout_ms: u64) -> Self {
        Self::CodecTimeout {
            codec: codec.into(),
            stage: stage.into(),
            timeout_ms,
            context: ErrorContext::new(),
        }
    }

    /// Create a cache conflict warning
    pub fn cache_conflict(path: impl Into<PathBuf>, resolution: impl Into<String>) -> Self {
        Self::CacheConflict {
            path: path.into(),
            resolution: resolution.into(),
            context: ErrorContext::with_severity(ErrorSeverity::Warning),
        }
    }

    /// Create a cache error
    pub fn cache(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Cache {
            path: path.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an inference error
    pub fn inference(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Inference {
            model: model.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a metric computation error
    pub fn metric(evaluator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metric {
            evaluator: evaluator.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: None,
            source,
            context: ErrorContext::new(),
        }
    }

    /// Create an I/O error tied to a path
    pub fn io_at(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: Some(path.into()),
            source,
            context: ErrorContext::new(),
        }
    }

    /// Create an external library error
    pub fn external(
        library: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            library: library.into(),
            source: Box::new(source),
            context: ErrorContext::new(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(during: impl Into<String>) -> Self {
        Self::Cancelled {
            during: during.into(),
            context: ErrorContext::with_severity(ErrorSeverity::Fatal),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    /// Add operation context
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context_mut().operation = Some(operation.into());
        self
    }

    /// Attach the sample this error belongs to
    pub fn with_sample(mut self, sample_id: impl Into<String>) -> Self {
        self.context_mut().sample_id = Some(sample_id.into());
        self
    }

    /// Attach the operating point this error belongs to
    pub fn with_operating_point(mut self, label: impl Into<String>) -> Self {
        self.context_mut().operating_point = Some(label.into());
        self
    }

    /// Add recovery suggestion
    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context_mut().recovery_suggestion = Some(suggestion.into());
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().metadata.insert(key.into(), value.into());
        self
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::Dataset { context, .. } => context,
            Self::Codec { context, .. } => context,
            Self::CodecTimeout { context, .. } => context,
            Self::CacheConflict { context, .. } => context,
            Self::Cache { context, .. } => context,
            Self::Inference { context, .. } => context,
            Self::Metric { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::External { context, .. } => context,
            Self::Cancelled { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::Dataset { context, .. } => context,
            Self::Codec { context, .. } => context,
            Self::CodecTimeout { context, .. } => context,
            Self::CacheConflict { context, .. } => context,
            Self::Cache { context, .. } => context,
            Self::Inference { context, .. } => context,
            Self::Metric { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::External { context, .. } => context,
            Self::Cancelled { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Dataset { .. } => "dataset",
            Self::Codec { .. } => "codec",
            Self::CodecTimeout { .. } => "codec_timeout",
            Self::CacheConflict { .. } => "cache_conflict",
            Self::Cache { .. } => "cache",
            Self::Inference { .. } => "inference",
            Self::Metric { .. } => "metric",
            Self::Io { .. } => "io",
            Self::External { .. } => "external",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// How far this error propagates through a sweep.
    pub fn scope(&self) -> ErrorScope {
        match self {
            Self::Codec { .. }
            | Self::CodecTimeout { .. }
            | Self::CacheConflict { .. }
            | Self::Cache { .. }
            | Self::Inference { .. }
            | Self::Io { .. }
            | Self::External { .. } => ErrorScope::Sample,
            Self::Metric { .. } => ErrorScope::OperatingPoint,
            Self::Config { .. } | Self::Dataset { .. } | Self::Cancelled { .. } => {
                ErrorScope::Sweep
            }
        }
    }

    /// Severity recorded in the context.
    pub fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }

    /// Recovery suggestion, when one was attached.
    pub fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Config {
                field,
                value,
                reason,
                ..
            } => write!(
                f,
                "Configuration error in '{}': {} (value: {})",
                field, reason, value
            ),
            EvalError::Dataset { path, reason, .. } => match path {
                Some(path) => write!(f, "Dataset error at '{}': {}", path.display(), reason),
                None => write!(f, "Dataset error: {}", reason),
            },
            EvalError::Codec {
                codec,
                stage,
                reason,
                ..
            } => write!(f, "Codec {} failed during {}: {}", codec, stage, reason),
            EvalError::CodecTimeout {
                codec,
                stage,
                timeout_ms,
                ..
            } => write!(
                f,
                "Codec {} timed out during {} after {}ms",
                codec, stage, timeout_ms
            ),
            EvalError::CacheConflict {
                path, resolution, ..
            } => write!(
                f,
                "Cache path '{}' already exists: {}",
                path.display(),
                resolution
            ),
            EvalError::Cache { path, reason, .. } => {
                write!(f, "Cache entry '{}' unusable: {}", path.display(), reason)
            }
            EvalError::Inference { model, reason, .. } => {
                write!(f, "Inference with {} failed: {}", model, reason)
            }
            EvalError::Metric {
                evaluator, reason, ..
            } => write!(f, "Metric computation with {} failed: {}", evaluator, reason),
            EvalError::Io {
                operation,
                path,
                source,
                ..
            } => match path {
                Some(path) => write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                ),
                None => write!(f, "I/O error during {}: {}", operation, source),
            },
            EvalError::External {
                library, source, ..
            } => write!(f, "External library error in {}: {}", library, source),
            EvalError::Cancelled { during, .. } => write!(f, "Cancelled during {}", during),
        }?;
        let ctx = self.context();
        if let Some(sample) = &ctx.sample_id {
            write!(f, " [sample {}]", sample)?;
        }
        if let Some(op) = &ctx.operating_point {
            write!(f, " [{}]", op)?;
        }
        Ok(())
    }
}

impl StdError for EvalError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::External { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias using our custom error type
pub type EvalResult<T> = Result<T, EvalError>;

/// Error classification utilities
pub mod classify {
    use super::*;

    /// Errors that stop the whole sweep
    pub fn is_fatal(error: &EvalError) -> bool {
        error.scope() == ErrorScope::Sweep || error.severity() == ErrorSeverity::Fatal
    }

    /// Errors that only cost one sample at one operating point
    pub fn is_per_sample(error: &EvalError) -> bool {
        error.scope() == ErrorScope::Sample && !is_fatal(error)
    }

    /// Codec failures whose captured stderr is worth surfacing
    pub fn has_diagnostics(error: &EvalError) -> bool {
        matches!(error, EvalError::Codec { stderr: Some(_), .. })
    }
}

impl From<std::io::Error> for EvalError {
    fn from(error: std::io::Error) -> Self {
        Self::io("unknown", error)
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(error: serde_json::Error) -> Self {
        Self::external("serde_json", error)
    }
}

impl From<image::ImageError> for EvalError {
    fn from(error: image::ImageError) -> Self {
        Self::external("image", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_fatal() {
        let error = EvalError::config("codec.kind", "jpeg", "unknown codec");
        assert_eq!(error.category(), "config");
        assert!(classify::is_fatal(&error));
        assert!(!classify::is_per_sample(&error));
    }

    #[test]
    fn test_codec_error_is_per_sample() {
        let error = EvalError::codec_exit("vtm", "encode", Some(1), "bad cfg")
            .with_sample("img-1")
            .with_operating_point("qp37");
        assert_eq!(error.scope(), ErrorScope::Sample);
        assert!(classify::is_per_sample(&error));
        assert!(classify::has_diagnostics(&error));
        let text = error.to_string();
        assert!(text.contains("img-1"));
        assert!(text.contains("qp37"));
        assert!(text.contains("status 1"));
    }

    #[test]
    fn test_timeout_and_metric_scopes() {
        assert_eq!(
            EvalError::codec_timeout("vtm", "decode", 500).scope(),
            ErrorScope::Sample
        );
        assert_eq!(
            EvalError::metric("coco-map", "empty").scope(),
            ErrorScope::OperatingPoint
        );
    }

    #[test]
    fn test_cache_conflict_is_warning() {
        let error = EvalError::cache_conflict("/tmp/x.vcmb", "reused existing artifact");
        assert_eq!(error.severity(), ErrorSeverity::Warning);
        assert!(!classify::is_fatal(&error));
    }

    #[test]
    fn test_io_source_chain() {
        let error = EvalError::io_at(
            "read",
            "/nope",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(error.source().is_some());
        assert_eq!(
            error
                .with_recovery_suggestion("check the path")
                .recovery_suggestion(),
            Some("check the path")
        );
    }
}
