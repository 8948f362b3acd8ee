//! Block extraction: splitting document text into prose, code and calculation segments.
//!
//! Only fenced code blocks at the top level of the document split the text.
//! Fences nested in lists or block quotes stay part of the surrounding prose.

use std::ops::Range;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use smol_str::{SmolStr, ToSmolStr};

use crate::config::{ExtractorConfig, MarkerPlacement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Markdown text between fenced blocks.
    Prose,
    /// A fenced block that is shown, not executed.
    Code,
    /// A fenced block in an executable language carrying the calculation marker.
    Calculation,
}

/// A maximal run of document text with a single kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Fence language (first word of the info string), if any.
    pub language: Option<SmolStr>,
    /// Prose source, code body, or calculation code with the marker stripped.
    pub content: String,
    /// Source byte range in the document.
    pub byte_range: Range<usize>,
}

impl Segment {
    pub fn is_calculation(&self) -> bool {
        self.kind == SegmentKind::Calculation
    }

    fn prose(text: &str, byte_range: Range<usize>) -> Self {
        Self {
            kind: SegmentKind::Prose,
            language: None,
            content: text[byte_range.clone()].to_owned(),
            byte_range,
        }
    }
}

/// Fenced block being buffered while walking parser events.
#[derive(Debug, Default)]
struct FenceContext {
    /// (language, body) being buffered
    buffer: Option<(Option<SmolStr>, String)>,
    byte_range: Range<usize>,
}

/// Parser options shared by extraction and prose rendering.
pub fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_MATH
}

/// Split `text` into ordered segments.
///
/// Never fails: a fence that is not closed runs to the end of the document
/// and is reported as plain [`SegmentKind::Code`].
pub fn extract_segments(text: &str, config: &ExtractorConfig) -> Vec<Segment> {
    let parser = Parser::new_ext(text, markdown_options()).into_offset_iter();

    let mut segments = Vec::new();
    let mut fence = FenceContext::default();
    let mut depth = 0usize;
    let mut prose_start = 0usize;

    for (event, range) in parser {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) if depth == 0 => {
                if range.start > prose_start {
                    push_prose(&mut segments, text, prose_start..range.start);
                }
                let lang = info.split_whitespace().next().unwrap_or("");
                let lang_opt = if lang.is_empty() {
                    None
                } else {
                    Some(lang.to_smolstr())
                };
                fence.buffer = Some((lang_opt, String::new()));
                fence.byte_range = range;
                depth += 1;
            }
            Event::Start(_) => depth += 1,
            Event::End(TagEnd::CodeBlock) if depth == 1 && fence.buffer.is_some() => {
                depth -= 1;
                let byte_range = std::mem::take(&mut fence.byte_range);
                if let Some((language, body)) = fence.buffer.take() {
                    prose_start = byte_range.end;
                    segments.push(classify_fence(text, language, body, byte_range, config));
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(t) => {
                if let Some((_, ref mut body)) = fence.buffer {
                    body.push_str(&t);
                }
            }
            _ => {}
        }
    }

    if prose_start < text.len() {
        push_prose(&mut segments, text, prose_start..text.len());
    }

    tracing::trace!(
        target: "engicalc::extract",
        segments = segments.len(),
        calculations = segments.iter().filter(|s| s.is_calculation()).count(),
        "extracted segments"
    );

    segments
}

fn push_prose(segments: &mut Vec<Segment>, text: &str, range: Range<usize>) {
    if text[range.clone()].trim().is_empty() {
        return;
    }
    segments.push(Segment::prose(text, range));
}

fn classify_fence(
    text: &str,
    language: Option<SmolStr>,
    mut body: String,
    byte_range: Range<usize>,
    config: &ExtractorConfig,
) -> Segment {
    if body.ends_with('\n') {
        body.pop();
    }

    let executable = language
        .as_deref()
        .is_some_and(|lang| config.is_executable_language(lang));

    if executable {
        if !is_closed_fence(&text[byte_range.clone()]) {
            tracing::debug!(
                target: "engicalc::extract",
                start = byte_range.start,
                "unterminated calculation fence, treating as plain code"
            );
        } else if let Some(code) = strip_marker(&body, &config.marker, config.marker_placement) {
            return Segment {
                kind: SegmentKind::Calculation,
                language,
                content: code,
                byte_range,
            };
        }
    }

    Segment {
        kind: SegmentKind::Code,
        language,
        content: body,
        byte_range,
    }
}

/// Check whether the raw source of a fenced block ends with a closing fence.
fn is_closed_fence(raw: &str) -> bool {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let Some(opening) = lines.next() else {
        return false;
    };
    let opening = opening.trim_start();
    let Some(fence_char) = opening.chars().next().filter(|c| *c == '`' || *c == '~') else {
        return false;
    };
    let fence_len = opening.chars().take_while(|c| *c == fence_char).count();

    match lines.last() {
        // A closing fence may be indented by at most three spaces.
        Some(closing) if closing.len() - closing.trim_start_matches(' ').len() <= 3 => {
            let closing = closing.trim();
            closing.chars().count() >= fence_len && closing.chars().all(|c| c == fence_char)
        }
        _ => false,
    }
}

/// Remove the marker line from a block body, if the marker is present.
fn strip_marker(body: &str, marker: &str, placement: MarkerPlacement) -> Option<String> {
    let lines: Vec<&str> = body.split('\n').collect();
    let marker_idx = match placement {
        MarkerPlacement::FirstLine => {
            let idx = lines.iter().position(|l| !l.trim().is_empty())?;
            (lines[idx].trim() == marker).then_some(idx)?
        }
        MarkerPlacement::Anywhere => lines.iter().position(|l| l.trim() == marker)?,
    };

    let code = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != marker_idx)
        .map(|(_, l)| *l)
        .skip_while(|l| l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(segments: &[Segment]) -> Vec<SegmentKind> {
        segments.iter().map(|s| s.kind).collect()
    }

    fn extract(text: &str) -> Vec<Segment> {
        extract_segments(text, &ExtractorConfig::default())
    }

    #[test]
    fn single_calculation_block() {
        let segments = extract("```python\n%%calc\nx = 2 + 2\n```\n");
        assert_eq!(kinds(&segments), vec![SegmentKind::Calculation]);
        assert_eq!(segments[0].content, "x = 2 + 2");
        assert_eq!(segments[0].language.as_deref(), Some("python"));
        assert_eq!(segments[0].byte_range.start, 0);
    }

    #[test]
    fn prose_around_blocks() {
        let text = "# Beam\n\nIntro text.\n\n```python\n%%calc\nL = 5\n```\n\nMiddle.\n\n```rust\nfn main() {}\n```\n\nEnd.\n";
        let segments = extract(text);
        assert_eq!(
            kinds(&segments),
            vec![
                SegmentKind::Prose,
                SegmentKind::Calculation,
                SegmentKind::Prose,
                SegmentKind::Code,
                SegmentKind::Prose,
            ]
        );
        assert!(segments[0].content.starts_with("# Beam"));
        assert_eq!(segments[1].content, "L = 5");
        assert_eq!(segments[3].content, "fn main() {}");
        assert_eq!(segments[3].language.as_deref(), Some("rust"));
        assert_eq!(segments[4].content.trim(), "End.");
    }

    #[test]
    fn segments_are_ordered_and_disjoint() {
        let text = "a\n\n```python\n%%calc\nx = 1\n```\n\nb\n\n```python\n%%calc\ny = 2\n```\n";
        let segments = extract(text);
        for pair in segments.windows(2) {
            assert!(pair[0].byte_range.end <= pair[1].byte_range.start);
        }
    }

    #[test]
    fn python_without_marker_is_code() {
        let segments = extract("```python\nprint('hi')\n```\n");
        assert_eq!(kinds(&segments), vec![SegmentKind::Code]);
        assert_eq!(segments[0].content, "print('hi')");
    }

    #[test]
    fn marker_in_other_language_is_code() {
        let segments = extract("```text\n%%calc\nx = 1\n```\n");
        assert_eq!(kinds(&segments), vec![SegmentKind::Code]);
        assert_eq!(segments[0].content, "%%calc\nx = 1");
    }

    #[test]
    fn marker_must_be_first_non_blank_line() {
        let first = extract("```python\n\n  %%calc  \nx = 1\n```\n");
        assert_eq!(kinds(&first), vec![SegmentKind::Calculation]);
        assert_eq!(first[0].content, "x = 1");

        let late = extract("```python\nx = 1\n%%calc\n```\n");
        assert_eq!(kinds(&late), vec![SegmentKind::Code]);
    }

    #[test]
    fn marker_anywhere_when_configured() {
        let config = ExtractorConfig {
            marker_placement: MarkerPlacement::Anywhere,
            ..Default::default()
        };
        let segments = extract_segments("```python\n# setup\n%%calc\nx = 1\n```\n", &config);
        assert_eq!(kinds(&segments), vec![SegmentKind::Calculation]);
        assert_eq!(segments[0].content, "# setup\nx = 1");
    }

    #[test]
    fn unterminated_fence_is_plain_code() {
        let text = "Intro\n\n```python\n%%calc\nx = 1\n";
        let segments = extract(text);
        assert_eq!(kinds(&segments), vec![SegmentKind::Prose, SegmentKind::Code]);
        assert_eq!(segments[1].byte_range.end, text.len());

        // Four spaces make the would-be closing fence part of the code.
        let text = "```python\n%%calc\nx = 1\n    ```\n";
        let segments = extract(text);
        assert_eq!(kinds(&segments), vec![SegmentKind::Code]);
        assert_eq!(segments[0].content, "%%calc\nx = 1\n    ```");
    }

    #[test]
    fn closing_fence_may_be_indented_up_to_three_spaces() {
        let segments = extract("```python\n%%calc\nx = 1\n   ```\n");
        assert_eq!(kinds(&segments), vec![SegmentKind::Calculation]);
        assert_eq!(segments[0].content, "x = 1");
    }

    #[test]
    fn tilde_fences() {
        let segments = extract("~~~python\n%%calc\nx = 1\n~~~\n");
        assert_eq!(kinds(&segments), vec![SegmentKind::Calculation]);
    }

    #[test]
    fn nested_fence_stays_in_prose() {
        let text = "- item\n\n  ```python\n  %%calc\n  x = 1\n  ```\n";
        let segments = extract(text);
        assert_eq!(kinds(&segments), vec![SegmentKind::Prose]);
        assert_eq!(segments[0].content, text);
    }

    #[test]
    fn prose_only_document() {
        let text = "# Title\n\nJust words, $x^2$ and a [link](https://example.com).\n";
        let segments = extract(text);
        assert_eq!(kinds(&segments), vec![SegmentKind::Prose]);
        assert_eq!(segments[0].content, text);
        assert_eq!(segments[0].byte_range, 0..text.len());
    }

    #[test]
    fn empty_document() {
        assert!(extract("").is_empty());
        assert!(extract("\n\n  \n").is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let text = "x\n\n```python\n%%calc\na = 1\n```\n\n```python\n%%calc\nb = 2\n```\n";
        assert_eq!(extract(text), extract(text));
    }

    #[test]
    fn closed_fence_detection() {
        assert!(is_closed_fence("```python\nx\n```\n"));
        assert!(is_closed_fence("````python\nx\n`````"));
        assert!(!is_closed_fence("````python\nx\n```\n"));
        assert!(!is_closed_fence("```python\nx\n"));
        assert!(!is_closed_fence("```python"));
        assert!(is_closed_fence("~~~\nx\n~~~\n"));
    }
}
