//! engicalc-core: the live calculation pipeline behind the EngiCalc preview.
//!
//! This crate provides:
//! - `extract_segments` - splits Markdown into prose, code and calculation segments
//! - `assign_identities` - stable `BlockId`s for calculation blocks across re-parses
//! - `ExecutionScheduler` - keyed, superseding async calls to an `Evaluator`
//! - `render_segments` / `write_html` - display nodes and their HTML presentation
//! - `DocumentSession` and `LivePreview` - the host-facing state and render loop

pub mod config;
pub mod error;
pub mod evaluator;
pub mod extract;
pub mod html;
pub mod identity;
pub mod math;
pub mod preview;
pub mod render;
pub mod scheduler;
pub mod session;
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use config::{Config, EvaluatorConfig, ExtractorConfig, MarkerPlacement};
pub use error::{ConfigError, EngicalcError, EvaluatorError, FrontmatterError};
pub use evaluator::{
    CalculationBlock, CalculationRequest, CalculationResponse, CalculationResult, Evaluator,
    HttpEvaluator, ValidationResult,
};
pub use extract::{Segment, SegmentKind, extract_segments};
pub use html::{write_html, write_page};
pub use identity::{BlockId, IdentityPolicy, IdentifiedBlock, assign_identities, hash_source};
pub use preview::{LivePreview, PreparedDocument, run_preview};
pub use render::{CalculationNode, CalculationStatus, DisplayNode, render_segments};
pub use scheduler::{ExecutionScheduler, ExecutionState};
pub use session::{Document, DocumentMetadata, DocumentSession, SessionState};
pub use smol_str::SmolStr;
