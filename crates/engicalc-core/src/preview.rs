//! The edit → extract → execute → render loop.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::error::EngicalcError;
use crate::evaluator::{Evaluator, HttpEvaluator};
use crate::extract::{Segment, extract_segments};
use crate::identity::{BlockId, IdentifiedBlock, assign_identities};
use crate::render::{DisplayNode, render_segments};
use crate::scheduler::ExecutionScheduler;
use crate::session::SessionState;

/// Segments and identities of one version of the text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedDocument {
    pub segments: Vec<Segment>,
    pub blocks: Vec<IdentifiedBlock>,
}

/// Renders document text and keeps calculation results in sync with it.
#[derive(Debug, Clone)]
pub struct LivePreview {
    scheduler: ExecutionScheduler,
    config: Arc<Config>,
}

impl LivePreview {
    pub fn new(evaluator: Arc<dyn Evaluator>, config: Config) -> Self {
        let scheduler = ExecutionScheduler::new(evaluator).with_timeout(config.evaluator.timeout());
        Self {
            scheduler,
            config: Arc::new(config),
        }
    }

    /// A preview talking to the HTTP calculation service named in `config`.
    pub fn from_config(config: Config) -> Result<Self, EngicalcError> {
        let evaluator = HttpEvaluator::from_config(&config.evaluator)?;
        tracing::info!(
            target: "engicalc::preview",
            endpoint = %evaluator.base(),
            "using calculation service"
        );
        Ok(Self::new(Arc::new(evaluator), config))
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extract and identify blocks, drop state for blocks that are gone, and
    /// make sure every remaining block has an execution.
    pub fn prepare(&self, text: &str) -> PreparedDocument {
        let segments = extract_segments(text, &self.config.extractor);
        let blocks = assign_identities(&segments, self.config.identity);

        let live: HashSet<BlockId> = blocks.iter().map(|b| b.id.clone()).collect();
        self.scheduler.retain(&live);
        for block in &blocks {
            self.scheduler.ensure(&block.id, &block.code, &block.language);
        }

        tracing::trace!(
            target: "engicalc::preview",
            segments = segments.len(),
            blocks = blocks.len(),
            "prepared document"
        );
        PreparedDocument { segments, blocks }
    }

    /// Display nodes for `doc` with the latest execution states.
    pub fn render_prepared(&self, doc: &PreparedDocument) -> Vec<DisplayNode> {
        render_segments(&doc.segments, &doc.blocks, &self.scheduler.snapshot())
    }

    /// Display nodes for `text`, starting executions as needed.
    ///
    /// Call again on every edit and every scheduler notification; unchanged
    /// blocks are never re-executed.
    pub fn render(&self, text: &str) -> Vec<DisplayNode> {
        let doc = self.prepare(text);
        self.render_prepared(&doc)
    }
}

/// Feed `sink` a fresh rendering whenever the session content or any execution
/// state changes. Returns once the session's sender is dropped.
///
/// A session without a document renders as no nodes.
pub async fn run_preview(
    mut session: watch::Receiver<SessionState>,
    preview: LivePreview,
    mut sink: impl FnMut(Vec<DisplayNode>),
) {
    let mut revisions = preview.scheduler().subscribe();
    let mut content = session.borrow_and_update().content().map(str::to_owned);
    let mut doc = content.as_deref().map(|text| preview.prepare(text));
    let _ = revisions.borrow_and_update();

    loop {
        sink(
            doc.as_ref()
                .map(|doc| preview.render_prepared(doc))
                .unwrap_or_default(),
        );

        tokio::select! {
            changed = session.changed() => {
                if changed.is_err() {
                    tracing::debug!(
                        target: "engicalc::preview",
                        "session closed, stopping preview"
                    );
                    return;
                }
                let next = session.borrow_and_update().content().map(str::to_owned);
                if next != content {
                    content = next;
                    doc = content.as_deref().map(|text| preview.prepare(text));
                }
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
                let _ = revisions.borrow_and_update();
            }
        }
    }
}
