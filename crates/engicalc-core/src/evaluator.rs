//! Wire types and client for the external calculation service.
//!
//! The service is opaque: it receives code, runs it, and answers with a
//! structured result per block. The scheduler only ever talks to it through
//! the [`Evaluator`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use url::Url;

use crate::config::EvaluatorConfig;
use crate::error::EvaluatorError;

/// Message shown when the evaluator could not produce a result at all.
pub const EXECUTION_FAILED_MESSAGE: &str = "Failed to execute calculation";

/// A single block sent to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SmolStr>,
    pub code: String,
    pub language: SmolStr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub blocks: Vec<CalculationBlock>,
    /// Variables shared between blocks. Always sent empty by the scheduler.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl CalculationRequest {
    /// A request for one block with an empty context.
    pub fn single(code: impl Into<String>, language: impl Into<SmolStr>) -> Self {
        Self {
            blocks: vec![CalculationBlock {
                id: None,
                code: code.into(),
                language: language.into(),
            }],
            context: Map::new(),
        }
    }
}

/// Result of executing one calculation block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub success: bool,
    /// LaTeX rendering of the calculation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latex: Option<String>,
    /// Named variables after execution, in the order the evaluator sent them.
    #[serde(
        default,
        rename = "result",
        alias = "variables",
        skip_serializing_if = "Option::is_none"
    )]
    pub variables: Option<Map<String, Value>>,
    /// Captured standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub execution_time: f64,
}

impl CalculationResult {
    /// Synthetic result for calls that never produced an evaluator answer.
    pub fn execution_failed() -> Self {
        Self {
            success: false,
            latex: None,
            variables: None,
            output: None,
            error: Some(EXECUTION_FAILED_MESSAGE.to_owned()),
            execution_time: 0.0,
        }
    }

    /// Variables as `(name, display value)` pairs.
    ///
    /// A value that is an object with a string `formatted` field shows that
    /// string; anything else shows as compact JSON.
    pub fn formatted_variables(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .flatten()
            .map(|(name, value)| (name.clone(), format_variable(value)))
            .collect()
    }
}

pub fn format_variable(value: &Value) -> String {
    match value.get("formatted") {
        Some(Value::String(formatted)) => formatted.clone(),
        Some(other) if value.is_object() => other.to_string(),
        _ => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResponse {
    pub results: Vec<CalculationResult>,
    #[serde(default)]
    pub final_context: Map<String, Value>,
}

/// Outcome of a syntax check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// The external calculation engine.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Execute the blocks of `request` and return one result per block.
    async fn execute(
        &self,
        request: CalculationRequest,
    ) -> Result<CalculationResponse, EvaluatorError>;
}

#[async_trait]
impl<T: Evaluator + ?Sized> Evaluator for std::sync::Arc<T> {
    async fn execute(
        &self,
        request: CalculationRequest,
    ) -> Result<CalculationResponse, EvaluatorError> {
        (**self).execute(request).await
    }
}

/// [`Evaluator`] backed by the calculation service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpEvaluator {
    client: reqwest::Client,
    base: Url,
}

impl HttpEvaluator {
    pub fn new(endpoint: &str) -> Result<Self, EvaluatorError> {
        let mut base = Url::parse(endpoint).map_err(|e| EvaluatorError::Endpoint {
            endpoint: endpoint.to_owned(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(EvaluatorError::Endpoint {
                endpoint: endpoint.to_owned(),
                reason: "not a base URL".to_owned(),
            });
        }
        // Url::join drops the last segment unless the path ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    pub fn from_config(config: &EvaluatorConfig) -> Result<Self, EvaluatorError> {
        Self::new(&config.endpoint)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, EvaluatorError> {
        self.base.join(path).map_err(|e| EvaluatorError::Endpoint {
            endpoint: self.base.to_string(),
            reason: e.to_string(),
        })
    }

    /// Check code for syntax errors without running it.
    pub async fn validate(&self, code: &str) -> Result<ValidationResult, EvaluatorError> {
        let url = self.url("calculation/validate")?;
        let response = self.client.post(url).query(&[("code", code)]).send().await?;
        decode(response).await
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn execute(
        &self,
        request: CalculationRequest,
    ) -> Result<CalculationResponse, EvaluatorError> {
        let url = self.url("calculation/execute")?;
        tracing::debug!(
            target: "engicalc::evaluator",
            %url,
            blocks = request.blocks.len(),
            "sending calculation request"
        );
        let response = self.client.post(url).json(&request).send().await?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, EvaluatorError> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.ok().filter(|t| !t.is_empty());
        return Err(EvaluatorError::Status {
            status: status.as_u16(),
            detail,
        });
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| EvaluatorError::Malformed(e.to_string()))
}
