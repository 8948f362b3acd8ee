//! HTML presentation of display nodes.
//!
//! Everything that came from the document or the evaluator is escaped or
//! re-emitted through a typed renderer (Markdown, MathML, syntect). Prose HTML
//! in [`DisplayNode::Prose`] is written as is: `render_prose` already turned
//! raw HTML from the document into escaped text.

use std::fmt::Write as _;
use std::sync::LazyLock;

use pulldown_cmark_escape::{escape_html, escape_html_body_text};
use syntect::highlighting::ThemeSet;
use syntect::html::{ClassStyle, ClassedHTMLGenerator, css_for_theme_with_class_style};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

use crate::math::{MathMode, render_math};
use crate::render::{CalculationNode, CalculationStatus, DisplayNode};

/// Prefix of syntect's token classes, so they don't collide with page styles.
pub const CSS_PREFIX: &str = "hl-";

const CLASS_STYLE: ClassStyle = ClassStyle::SpacedPrefixed { prefix: CSS_PREFIX };

static SYNTAX_SET: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtmlOptions {
    /// Highlight code and calculation sources with syntect.
    pub highlight: bool,
}

impl Default for HtmlOptions {
    fn default() -> Self {
        Self { highlight: true }
    }
}

/// Render nodes to an HTML fragment with default options.
pub fn write_html(nodes: &[DisplayNode]) -> String {
    write_html_with(nodes, HtmlOptions::default())
}

pub fn write_html_with(nodes: &[DisplayNode], options: HtmlOptions) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            DisplayNode::Prose { html } => out.push_str(html),
            DisplayNode::Code { language, code } => {
                write_code(&mut out, "code-block", language.as_deref(), code, options);
            }
            DisplayNode::Calculation(calc) => write_calculation(&mut out, calc, options),
        }
    }
    out
}

fn write_calculation(out: &mut String, calc: &CalculationNode, options: HtmlOptions) {
    out.push_str("<div class=\"calc-block\" data-block-id=\"");
    escape_into(out, calc.id.as_str());
    out.push_str("\">\n");
    write_code(out, "calc-source", Some(&calc.language), &calc.code, options);
    out.push_str("<div class=\"calc-result\">\n");

    match &calc.status {
        CalculationStatus::Idle => {}
        CalculationStatus::Executing => {
            out.push_str("<div class=\"calc-executing\">Executing...</div>\n");
        }
        CalculationStatus::Completed {
            latex,
            output,
            variables,
            execution_time,
        } => {
            if let Some(latex) = latex {
                out.push_str("<div class=\"calc-latex\">");
                out.push_str(&render_math(latex, MathMode::Display).into_html());
                out.push_str("</div>\n");
            }
            if let Some(output) = output {
                out.push_str("<pre class=\"calc-output\">");
                escape_body_into(out, output);
                out.push_str("</pre>\n");
            }
            if !variables.is_empty() {
                out.push_str("<div class=\"calc-variables\">\n");
                out.push_str("<div class=\"calc-variables-title\">Variables:</div>\n");
                for (name, value) in variables {
                    out.push_str("<div class=\"calc-variable\">");
                    out.push_str("<span class=\"calc-variable-name\">");
                    escape_body_into(out, name);
                    out.push_str(":</span> <span class=\"calc-variable-value\">");
                    escape_body_into(out, value);
                    out.push_str("</span></div>\n");
                }
                out.push_str("</div>\n");
            }
            let _ = writeln!(
                out,
                "<div class=\"calc-time\">Execution time: {execution_time:.3}s</div>"
            );
        }
        CalculationStatus::Error { message } => write_error(out, "calc-error", message),
        CalculationStatus::Failed { message } => {
            write_error(out, "calc-error calc-failure", message)
        }
    }

    out.push_str("</div>\n</div>\n");
}

fn write_error(out: &mut String, class: &str, message: &str) {
    let _ = write!(
        out,
        "<div class=\"{class}\">\n<div class=\"calc-error-title\">Error:</div>\n<pre>"
    );
    escape_body_into(out, message);
    out.push_str("</pre>\n</div>\n");
}

fn write_code(
    out: &mut String,
    class: &str,
    language: Option<&str>,
    code: &str,
    options: HtmlOptions,
) {
    out.push_str("<pre class=\"");
    out.push_str(class);
    out.push_str("\"><code");
    if let Some(lang) = language.filter(|l| !l.is_empty()) {
        out.push_str(" class=\"language-");
        escape_into(out, lang);
        out.push('"');
    }
    out.push('>');

    let highlighted = options
        .highlight
        .then(|| language.and_then(|lang| highlight(lang, code)))
        .flatten();
    match highlighted {
        Some(html) => out.push_str(&html),
        None => escape_body_into(out, code),
    }
    out.push_str("</code></pre>\n");
}

/// Classed syntect markup for `code`, or `None` for unknown languages.
fn highlight(language: &str, code: &str) -> Option<String> {
    let syntax = SYNTAX_SET.find_syntax_by_token(language)?;
    let mut generator =
        ClassedHTMLGenerator::new_with_class_style(syntax, &SYNTAX_SET, CLASS_STYLE);
    for line in LinesWithEndings::from(code) {
        if let Err(err) = generator.parse_html_for_line_which_includes_newline(line) {
            tracing::warn!(
                language,
                %err,
                "syntax highlighting failed, falling back to plain code"
            );
            return None;
        }
    }
    Some(generator.finalize())
}

/// Token styles for the `hl-` classes, light theme by default and dark under
/// `prefers-color-scheme: dark`.
pub fn syntax_css() -> String {
    let themes = ThemeSet::load_defaults();
    let mut css = String::new();
    if let Some(light) = themes.themes.get("InspiredGitHub") {
        match css_for_theme_with_class_style(light, CLASS_STYLE) {
            Ok(light) => css.push_str(&light),
            Err(err) => tracing::warn!(%err, "could not generate light syntax css"),
        }
    }
    if let Some(dark) = themes.themes.get("base16-ocean.dark") {
        match css_for_theme_with_class_style(dark, CLASS_STYLE) {
            Ok(dark) => {
                css.push_str("\n@media (prefers-color-scheme: dark) {\n");
                css.push_str(&dark);
                css.push_str("}\n");
            }
            Err(err) => tracing::warn!(%err, "could not generate dark syntax css"),
        }
    }
    css
}

const PAGE_CSS: &str = r#"
body {
  max-width: 52rem;
  margin: 2rem auto;
  padding: 0 1rem;
  font-family: system-ui, sans-serif;
  line-height: 1.5;
}
pre {
  overflow-x: auto;
  padding: 0.75rem;
  border-radius: 4px;
  background: rgba(127, 127, 127, 0.08);
}
.calc-block { border-left: 3px solid #4a7bd0; margin: 1rem 0; padding-left: 0.75rem; }
.calc-executing { color: #777; font-style: italic; }
.calc-variables-title, .calc-error-title { font-weight: 600; }
.calc-variable-name { font-family: monospace; }
.calc-time { color: #777; font-size: 0.85em; }
.calc-error { color: #b3261e; }
.math-error code { color: #b3261e; }
"#;

/// A standalone HTML document around the rendered nodes.
pub fn write_page(title: &str, nodes: &[DisplayNode]) -> String {
    let mut page =
        String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>");
    escape_body_into(&mut page, title);
    page.push_str("</title>\n<style>");
    page.push_str(PAGE_CSS);
    page.push_str(&syntax_css());
    page.push_str("</style>\n</head>\n<body>\n<article class=\"engicalc-document\">\n");
    page.push_str(&write_html(nodes));
    page.push_str("</article>\n</body>\n</html>\n");
    page
}

// Writing into a String cannot fail.
fn escape_into(out: &mut String, text: &str) {
    let _ = escape_html(out, text);
}

fn escape_body_into(out: &mut String, text: &str) {
    let _ = escape_html_body_text(out, text);
}
