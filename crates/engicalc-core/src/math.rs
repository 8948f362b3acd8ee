//! LaTeX to MathML, for evaluator output and prose math alike.
//!
//! The source is parsed into typed events and re-emitted, so it never reaches
//! the page as raw markup. Source that does not parse is shown escaped.

use pulldown_cmark_escape::escape_html;
use pulldown_latex::config::{DisplayMode, RenderConfig};
use pulldown_latex::mathml::push_mathml;
use pulldown_latex::{Parser, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathMode {
    Inline,
    Display,
}

impl MathMode {
    fn class(self) -> &'static str {
        match self {
            MathMode::Inline => "math-inline",
            MathMode::Display => "math-display",
        }
    }

    fn display_mode(self) -> DisplayMode {
        match self {
            MathMode::Inline => DisplayMode::Inline,
            MathMode::Display => DisplayMode::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Math {
    MathMl(String),
    /// The LaTeX did not parse. `fallback` shows the escaped source.
    Unparsed { fallback: String, reason: String },
}

impl Math {
    pub fn into_html(self) -> String {
        match self {
            Math::MathMl(mathml) => mathml,
            Math::Unparsed { fallback, .. } => fallback,
        }
    }
}

/// Longest first, so `$$` is not read as two `$`.
const DELIMITERS: [(&str, &str); 4] = [("\\[", "\\]"), ("$$", "$$"), ("\\(", "\\)"), ("$", "$")];

/// The math inside one pair of surrounding delimiters, or the trimmed input.
fn unwrap_delimiters(latex: &str) -> &str {
    let trimmed = latex.trim();
    DELIMITERS
        .iter()
        .find_map(|(open, close)| trimmed.strip_prefix(open)?.strip_suffix(close))
        .map_or(trimmed, str::trim)
}

/// Render LaTeX, with or without `\[…\]`, `$$…$$`, `\(…\)` or `$…$` around it.
pub fn render_math(latex: &str, mode: MathMode) -> Math {
    let source = unwrap_delimiters(latex);
    let storage = Storage::new();
    let events: Vec<_> = Parser::new(source, &storage).collect();

    let reasons: Vec<String> = events
        .iter()
        .filter_map(|event| event.as_ref().err())
        .map(ToString::to_string)
        .collect();
    if !reasons.is_empty() {
        return unparsed(source, mode, reasons.join("; "));
    }

    let config = RenderConfig {
        display_mode: mode.display_mode(),
        ..Default::default()
    };
    let mut mathml = String::new();
    match push_mathml(&mut mathml, events.into_iter(), config) {
        Ok(()) => Math::MathMl(mathml),
        Err(err) => unparsed(source, mode, err.to_string()),
    }
}

fn unparsed(source: &str, mode: MathMode, reason: String) -> Math {
    tracing::debug!(%reason, "latex did not parse, showing source");
    let mut fallback = format!("<span class=\"math math-error {}\" title=\"", mode.class());
    // Writing into a String cannot fail.
    let _ = escape_html(&mut fallback, &reason);
    fallback.push_str("\"><code>");
    let _ = escape_html(&mut fallback, source);
    fallback.push_str("</code></span>");
    Math::Unparsed { fallback, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_inline_math() {
        let Math::MathMl(mathml) = render_math("x^2", MathMode::Inline) else {
            panic!("expected MathML");
        };
        assert!(mathml.contains("<math"));
        assert!(mathml.contains("</math>"));
    }

    #[test]
    fn renders_handcalcs_style_output() {
        let latex = r"\[ M = \frac{w \cdot L^{2}}{8} \]";
        let Math::MathMl(mathml) = render_math(latex, MathMode::Display) else {
            panic!("expected MathML");
        };
        assert!(mathml.contains("<mfrac"));
        assert!(!mathml.contains(r"\["));
    }

    #[test]
    fn invalid_latex_is_escaped() {
        let Math::Unparsed { fallback, reason } = render_math(r"\frac{<script>", MathMode::Inline)
        else {
            panic!("expected an error");
        };
        assert!(fallback.starts_with("<span class=\"math math-error math-inline\""));
        assert!(fallback.contains("&lt;script&gt;"));
        assert!(!fallback.contains("<script>"));
        assert!(!reason.is_empty());
    }

    #[test]
    fn strips_delimiters() {
        assert_eq!(unwrap_delimiters(r"\[ x \]"), "x");
        assert_eq!(unwrap_delimiters("$$y$$"), "y");
        assert_eq!(unwrap_delimiters("$z$"), "z");
        assert_eq!(unwrap_delimiters(r"\(a\)"), "a");
        assert_eq!(unwrap_delimiters("  plain "), "plain");
        assert_eq!(unwrap_delimiters("$"), "$");
    }

    #[test]
    fn delimited_and_bare_render_alike() {
        assert_eq!(
            render_math("$$a + b$$", MathMode::Display),
            render_math("a + b", MathMode::Display)
        );
    }
}
