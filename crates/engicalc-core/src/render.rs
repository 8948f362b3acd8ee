//! Merging extracted segments with execution states into display nodes.
//!
//! Rendering is a pure function of `(segments, blocks, states)`: the same
//! inputs always give the same nodes, so hosts can re-render on every edit and
//! every state transition without bookkeeping of their own.

use std::collections::HashMap;

use pulldown_cmark::{CowStr, Event, Parser};
use smol_str::SmolStr;

use crate::evaluator::{CalculationResult, EXECUTION_FAILED_MESSAGE};
use crate::extract::{Segment, SegmentKind, markdown_options};
use crate::identity::{BlockId, IdentifiedBlock};
use crate::math::{MathMode, render_math};
use crate::scheduler::ExecutionState;

/// One displayable unit, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayNode {
    /// Markdown prose, already rendered to HTML.
    Prose { html: String },
    /// A fenced block shown verbatim.
    Code {
        language: Option<SmolStr>,
        code: String,
    },
    Calculation(CalculationNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalculationNode {
    pub id: BlockId,
    pub language: SmolStr,
    /// Code with the marker stripped.
    pub code: String,
    pub status: CalculationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalculationStatus {
    /// Not requested yet.
    Idle,
    Executing,
    Completed {
        /// LaTeX source of the symbolic rendering.
        latex: Option<String>,
        output: Option<String>,
        /// `(name, formatted value)` pairs.
        variables: Vec<(String, String)>,
        /// Seconds.
        execution_time: f64,
    },
    /// The calculation code itself failed; message comes from the evaluator.
    Error { message: String },
    /// No result could be obtained from the evaluator.
    Failed { message: String },
}

impl CalculationStatus {
    pub fn from_state(state: &ExecutionState) -> Self {
        match state {
            ExecutionState::Idle => Self::Idle,
            ExecutionState::Pending => Self::Executing,
            ExecutionState::Succeeded(result) if result.success => completed(result),
            ExecutionState::Succeeded(result) => Self::Error {
                message: result.error.clone().unwrap_or_default(),
            },
            ExecutionState::Failed(result) => Self::Failed {
                message: result
                    .error
                    .clone()
                    .unwrap_or_else(|| EXECUTION_FAILED_MESSAGE.to_owned()),
            },
        }
    }
}

fn completed(result: &CalculationResult) -> CalculationStatus {
    let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
    CalculationStatus::Completed {
        latex: non_empty(&result.latex),
        output: non_empty(&result.output),
        variables: result.formatted_variables(),
        execution_time: result.execution_time,
    }
}

/// Build one display node per segment.
///
/// `blocks` are the identified calculation blocks of `segments`; blocks
/// without an entry in `states` render as [`CalculationStatus::Idle`].
pub fn render_segments(
    segments: &[Segment],
    blocks: &[IdentifiedBlock],
    states: &HashMap<BlockId, ExecutionState>,
) -> Vec<DisplayNode> {
    let by_segment: HashMap<usize, &IdentifiedBlock> =
        blocks.iter().map(|b| (b.segment_index, b)).collect();

    segments
        .iter()
        .enumerate()
        .map(|(idx, segment)| match segment.kind {
            SegmentKind::Prose => DisplayNode::Prose {
                html: render_prose(&segment.content),
            },
            SegmentKind::Calculation => match by_segment.get(&idx) {
                Some(block) => {
                    let status = states
                        .get(&block.id)
                        .map(CalculationStatus::from_state)
                        .unwrap_or(CalculationStatus::Idle);
                    DisplayNode::Calculation(CalculationNode {
                        id: block.id.clone(),
                        language: block.language.clone(),
                        code: block.code.clone(),
                        status,
                    })
                }
                None => code_node(segment),
            },
            SegmentKind::Code => code_node(segment),
        })
        .collect()
}

fn code_node(segment: &Segment) -> DisplayNode {
    DisplayNode::Code {
        language: segment.language.clone(),
        code: segment.content.clone(),
    }
}

/// Render Markdown prose to HTML, turning `$…$` and `$$…$$` into MathML.
///
/// Raw HTML in the document is shown as text, never passed through.
pub fn render_prose(markdown: &str) -> String {
    let parser = Parser::new_ext(markdown, markdown_options()).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        Event::InlineMath(latex) => {
            Event::InlineHtml(CowStr::from(render_math(&latex, MathMode::Inline).into_html()))
        }
        Event::DisplayMath(latex) => {
            Event::InlineHtml(CowStr::from(render_math(&latex, MathMode::Display).into_html()))
        }
        other => other,
    });
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}
