//! Error types for engicalc.

use miette::{Diagnostic, NamedSource, SourceOffset, SourceSpan};
use std::path::PathBuf;

/// Main error type for engicalc operations
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum EngicalcError {
    /// Evaluator call failed
    #[error(transparent)]
    #[diagnostic_source]
    Evaluator(#[from] EvaluatorError),

    /// Configuration could not be loaded
    #[error(transparent)]
    #[diagnostic_source]
    Config(#[from] ConfigError),

    /// Document frontmatter is not valid YAML
    #[error(transparent)]
    #[diagnostic_source]
    Frontmatter(#[from] FrontmatterError),

    /// IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures talking to the calculation evaluator.
///
/// These never reach the renderer: the scheduler turns them into a failed
/// execution state.
#[derive(thiserror::Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum EvaluatorError {
    #[error("evaluator unreachable: {0}")]
    #[diagnostic(
        code(engicalc::evaluator::transport),
        help("check that the calculation service is running and the endpoint is correct")
    )]
    Transport(#[from] reqwest::Error),

    #[error("evaluator responded with status {status}")]
    #[diagnostic(code(engicalc::evaluator::status))]
    Status {
        status: u16,
        #[help]
        detail: Option<String>,
    },

    #[error("evaluator returned a malformed response: {0}")]
    #[diagnostic(code(engicalc::evaluator::malformed))]
    Malformed(String),

    #[error("evaluator did not answer within {0:?}")]
    #[diagnostic(code(engicalc::evaluator::timeout))]
    Timeout(std::time::Duration),

    #[error("invalid evaluator endpoint {endpoint:?}: {reason}")]
    #[diagnostic(code(engicalc::evaluator::endpoint))]
    Endpoint { endpoint: String, reason: String },
}

/// Errors loading a [`crate::Config`].
#[derive(thiserror::Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("could not read config file {}", path.display())]
    #[diagnostic(code(engicalc::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format for {}", path.display())]
    #[diagnostic(code(engicalc::config::format), help("use a .toml or .json file"))]
    UnsupportedFormat { path: PathBuf },

    #[error(transparent)]
    #[diagnostic(code(engicalc::config::toml))]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    #[diagnostic(code(engicalc::config::json))]
    Json(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {var}")]
    #[diagnostic(code(engicalc::config::env))]
    Env { var: &'static str, value: String },
}

/// YAML frontmatter parse error with source location.
#[derive(thiserror::Error, Debug, Diagnostic)]
#[error("invalid frontmatter: {message}")]
#[diagnostic(code(engicalc::frontmatter))]
pub struct FrontmatterError {
    message: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("here")]
    err_location: SourceSpan,
    #[help]
    advice: Option<String>,
}

impl FrontmatterError {
    /// Build an error pointing at a 1-based line/column of the frontmatter source.
    pub fn new(
        filename: &str,
        source: &str,
        message: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        let offset = SourceOffset::from_location(source, line, column);
        Self {
            message: message.into(),
            src: NamedSource::new(filename, source.to_owned()),
            err_location: SourceSpan::new(offset, 0),
            advice: None,
        }
    }

    pub fn with_advice(mut self, advice: impl Into<String>) -> Self {
        self.advice = Some(advice.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn location(&self) -> SourceSpan {
        self.err_location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_error_points_into_source() {
        let src = "project: a\nbroken: [\n";
        let err = FrontmatterError::new("doc.md", src, "unclosed sequence", 2, 9);
        // Line 2 starts after "project: a\n" (11 bytes), column 9 is 8 bytes in.
        assert_eq!(err.location().offset(), 19);
        assert_eq!(err.message(), "unclosed sequence");
        assert!(err.to_string().contains("unclosed sequence"));
    }

    #[test]
    fn evaluator_status_has_code() {
        let err = EvaluatorError::Status {
            status: 500,
            detail: Some("boom".into()),
        };
        assert_eq!(err.to_string(), "evaluator responded with status 500");
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("engicalc::evaluator::status"));
    }

    #[test]
    fn wrapped_errors_keep_their_message() {
        let err = EngicalcError::from(EvaluatorError::Timeout(std::time::Duration::from_secs(30)));
        assert_eq!(err.to_string(), "evaluator did not answer within 30s");
        let err = EngicalcError::from(ConfigError::Env {
            var: "ENGICALC_TIMEOUT_SECS",
            value: "soon".into(),
        });
        assert!(err.to_string().contains("ENGICALC_TIMEOUT_SECS"));
    }
}
