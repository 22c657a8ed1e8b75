//! Locating `<script>` elements in a document.

use crate::dom::{self, ElementSeed};

/// How a script element executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    Classic,
    Module,
    /// Loaded from `src`; needs the network.
    External(String),
    /// A type the surface does not execute (`text/babel`, JSON data, ...).
    Inert(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock {
    pub kind: ScriptKind,
    pub code: String,
}

/// Every script element in document order.
pub fn extract_scripts(html: &str) -> Vec<ScriptBlock> {
    dom::parse(html)
        .into_iter()
        .filter(|element| element.tag == "script")
        .map(|element| ScriptBlock {
            kind: classify(&element),
            code: element.inner_html,
        })
        .collect()
}

fn classify(element: &ElementSeed) -> ScriptKind {
    if let Some(src) = element.attribute("src") {
        return ScriptKind::External(src.trim().to_string());
    }
    match element.attribute("type").map(|t| t.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("text/javascript") | Some("application/javascript") => ScriptKind::Classic,
        Some("module") => ScriptKind::Module,
        Some(other) => ScriptKind::Inert(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_in_document_order() {
        let html = r#"<html><head>
            <script>var a = 1;</script>
            <script src="https://unpkg.com/react.js"></script>
            </head><body>
            <script type="text/babel">const x = <div/>;</script>
            <SCRIPT TYPE="Module">import.meta;</SCRIPT>
            <script type='application/json'>{}</script>
            </body></html>"#;

        let kinds: Vec<_> = extract_scripts(html).into_iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ScriptKind::Classic,
                ScriptKind::External("https://unpkg.com/react.js".into()),
                ScriptKind::Inert("text/babel".into()),
                ScriptKind::Module,
                ScriptKind::Inert("application/json".into()),
            ]
        );
    }

    #[test]
    fn test_code_is_preserved() {
        let scripts = extract_scripts("<body><script type=\"module\">\nconsole.log('ready')\n</script></body>");
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].code, "\nconsole.log('ready')\n");
    }

    #[test]
    fn test_quoted_gt_in_attribute() {
        let scripts = extract_scripts(r#"<script data-x="a>b">run()</script>"#);
        assert_eq!(scripts[0].code, "run()");
        assert_eq!(scripts[0].kind, ScriptKind::Classic);
    }

    #[test]
    fn test_ignores_similar_tags() {
        assert!(extract_scripts("<scripts>nope</scripts><p>text</p>").is_empty());
    }

    #[test]
    fn test_unterminated_script_runs_to_end() {
        let scripts = extract_scripts("<script>tail()");
        assert_eq!(scripts[0].code, "tail()");
    }

    #[test]
    fn test_commented_out_script_is_ignored() {
        let scripts = extract_scripts("<!-- <script>old()</script> --><script>current()</script>");
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].code, "current()");
    }

    #[test]
    fn test_unquoted_attributes() {
        let scripts = extract_scripts("<script type=module defer>go()</script>");
        assert_eq!(scripts[0].kind, ScriptKind::Module);
    }
}
