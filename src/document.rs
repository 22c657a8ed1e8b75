//! Sandbox document assembly.
//!
//! Turns raw fragments (markup, styles, script) or a complete document into
//! the instrumented document a surface renders. Assembly is textual
//! splicing at two anchors: the end of the head (styles, then the shim) and
//! the end of the body (the user script). Nothing else in the base document
//! is touched.
//!
//! A base document without the required closing marker is rejected with
//! [`BuildError::MissingMarker`] rather than patched up.

use crate::error::BuildError;
use crate::shim::{InstrumentationShim, WILDCARD_ORIGIN};
use serde::Deserialize;
use std::fmt;

pub const DEFAULT_TITLE: &str = "Preview";

const HEAD_CLOSE: &str = "</head>";
const BODY_CLOSE: &str = "</body>";
const EMPTY_MARKUP: &str = r#"<div id="app"></div>"#;

/// Stylesheet and runtime used when previewing generated component code.
const COMPONENT_STYLES: &str = "body{font-family:system-ui,sans-serif;padding:1rem;background:#f5f5f5;color:#111}#root{background:#fff;border:1px solid #ddd;padding:1rem;border-radius:8px;min-height:300px}";
const COMPONENT_RUNTIME: &[&str] = &[
    "https://unpkg.com/react@17/umd/react.development.js",
    "https://unpkg.com/react-dom@17/umd/react-dom.development.js",
    "https://unpkg.com/@babel/standalone/babel.min.js",
];

/// Source content for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFragment {
    /// Three independent blobs; any may be empty. If `markup` is itself a
    /// complete document it becomes the base document.
    Parts {
        markup: String,
        styles: String,
        script: String,
    },
    /// A complete document, passed through apart from the shim insertion.
    Document(String),
}

impl SourceFragment {
    pub fn parts(
        markup: impl Into<String>,
        styles: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self::Parts {
            markup: markup.into(),
            styles: styles.into(),
            script: script.into(),
        }
    }

    /// Frontend code returned by the generation service. Complete documents
    /// pass through; component code is wrapped in a React preview shell.
    pub fn from_generated(code: &str, title: &str) -> Self {
        if is_complete_document(code) {
            Self::Document(code.to_string())
        } else {
            Self::Document(component_document(code, title))
        }
    }

    /// Assemble a fragment from a stored project file list.
    pub fn from_project_files(files: &[ProjectFile]) -> Self {
        let content = |path: &str| {
            files
                .iter()
                .find(|f| f.path == path)
                .map(|f| f.content.clone())
                .unwrap_or_default()
        };
        Self::parts(content("index.html"), content("styles.css"), content("script.js"))
    }
}

/// One file of a saved studio project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
}

impl ProjectFile {
    /// Parse the JSON array a project stores its files as.
    pub fn parse_list(json: &str) -> Result<Vec<ProjectFile>, serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(json)
    }
}

/// Options for [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Title for synthesized documents. Ignored for complete documents.
    pub title: Option<String>,
    /// Origin forwarded messages are addressed to; `*` when unset.
    pub target_origin: Option<String>,
    /// Inject the capability lockdown (strict path).
    pub lockdown: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            title: None,
            target_origin: None,
            lockdown: true,
        }
    }
}

/// A fully assembled, instrumented document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDocument(String);

impl SandboxDocument {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SandboxDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SandboxDocument {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Case-insensitive test for a root-document declaration.
pub fn is_complete_document(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("<!doctype") || lower.contains("<html")
}

/// Build the instrumented document for `fragment`.
pub fn build(fragment: &SourceFragment, options: &BuildOptions) -> Result<SandboxDocument, BuildError> {
    let (base, styles, script) = match fragment {
        SourceFragment::Document(document) => (document.clone(), "", ""),
        SourceFragment::Parts {
            markup,
            styles,
            script,
        } => {
            let base = if is_complete_document(markup) {
                markup.clone()
            } else {
                let title = options.title.as_deref().unwrap_or(DEFAULT_TITLE);
                shell(title, markup)
            };
            (base, styles.as_str(), script.as_str())
        }
    };

    let shim = InstrumentationShim::new(
        options.target_origin.as_deref().unwrap_or(WILDCARD_ORIGIN),
        options.lockdown,
    );

    let mut head = String::new();
    if !styles.is_empty() {
        head.push_str("<style>");
        head.push_str(styles);
        head.push_str("</style>");
    }
    head.push_str(&shim.render());

    let at = find_ignore_case(&base, HEAD_CLOSE, Occurrence::First).ok_or(BuildError::MissingMarker {
        marker: HEAD_CLOSE,
        purpose: "instrumentation shim",
    })?;
    let mut document = base;
    document.insert_str(at, &head);

    if !script.is_empty() {
        let at = find_ignore_case(&document, BODY_CLOSE, Occurrence::Last).ok_or(
            BuildError::MissingMarker {
                marker: BODY_CLOSE,
                purpose: "user script",
            },
        )?;
        document.insert_str(at, &format!("<script type=\"module\">\n{script}\n</script>"));
    }

    Ok(SandboxDocument(document))
}

/// Minimal document shell around bare markup.
fn shell(title: &str, markup: &str) -> String {
    let markup = if markup.is_empty() { EMPTY_MARKUP } else { markup };
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"/><title>{}</title></head><body>{}</body></html>",
        escape_html(title),
        markup
    )
}

/// Preview document for a generated React component snippet.
pub fn component_document(code: &str, title: &str) -> String {
    let runtime: String = COMPONENT_RUNTIME
        .iter()
        .map(|src| format!("    <script src=\"{src}\"></script>\n"))
        .collect();
    format!(
        r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8"/>
    <title>{title}</title>
    <style>{COMPONENT_STYLES}</style>
{runtime}  </head>
  <body>
    <div id="root"></div>
    <script type="text/babel">
      {code}
      const RootComponent = typeof App !== 'undefined' ? App : () => React.createElement('div', null, 'No App component found.');
      ReactDOM.render(React.createElement(RootComponent), document.getElementById('root'));
    </script>
  </body>
</html>"#,
        title = escape_html(title),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Clone, Copy)]
enum Occurrence {
    First,
    Last,
}

/// Byte offset of `needle` (ASCII) in `haystack`, ignoring ASCII case.
fn find_ignore_case(haystack: &str, needle: &str, which: Occurrence) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets (and char boundaries) intact.
    let lower = haystack.to_ascii_lowercase();
    match which {
        Occurrence::First => lower.find(needle),
        Occurrence::Last => lower.rfind(needle),
    }
}
