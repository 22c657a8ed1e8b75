//! Element tree of a preview document.
//!
//! The scan is deliberately shallow: it finds start and end tags, keeps the
//! raw inner markup of every element and links each element to its parent.
//! The surface turns the result into its `document` object.

use serde::Serialize;

/// Elements whose content is text, never markup.
const RAW_TEXT: &[&str] = &["script", "style", "textarea", "title"];

/// Elements that never have an end tag.
const VOID: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

/// One element, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementSeed {
    /// Lowercase tag name.
    pub tag: String,
    /// Attribute names are lowercase; the first occurrence of a name wins.
    pub attributes: Vec<(String, String)>,
    /// Index of the enclosing element.
    pub parent: Option<usize>,
    pub inner_html: String,
}

impl ElementSeed {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Every element of `html` in document order.
///
/// End tags close the nearest open element with the same name, along with
/// anything left open inside it. Stray end tags are ignored and elements
/// still open at the end run to the end of the input.
pub fn parse(html: &str) -> Vec<ElementSeed> {
    let lower = html.to_ascii_lowercase();
    let mut elements: Vec<ElementSeed> = Vec::new();
    // (element index, offset where its content starts)
    let mut open: Vec<(usize, usize)> = Vec::new();
    let mut pos = 0;

    while let Some(found) = lower[pos..].find('<') {
        let at = pos + found;
        let rest = &lower[at..];

        if rest.starts_with("<!--") {
            pos = skip_past(&lower, at + 4, "-->");
            continue;
        }
        if rest.starts_with("<!") || rest.starts_with("<?") {
            pos = skip_past(&lower, at, ">");
            continue;
        }
        if let Some(name_start) = rest.strip_prefix("</").map(|_| at + 2) {
            let name = &lower[name_start..tag_name_end(&lower, name_start)];
            if let Some(depth) = open.iter().rposition(|(i, _)| elements[*i].tag == name) {
                for (index, content_start) in open.drain(depth..) {
                    elements[index].inner_html = html[content_start..at].to_string();
                }
            }
            pos = skip_past(&lower, at, ">");
            continue;
        }
        if !lower.as_bytes().get(at + 1).is_some_and(u8::is_ascii_alphabetic) {
            // A bare `<` in text.
            pos = at + 1;
            continue;
        }

        let name_end = tag_name_end(&lower, at + 1);
        let tag = lower[at + 1..name_end].to_string();
        let Some(tag_end) = find_tag_end(html, name_end) else {
            break;
        };
        let raw_attributes = &html[name_end..tag_end];
        let self_closing = raw_attributes.trim_end().ends_with('/');
        let index = elements.len();
        let content_start = tag_end + 1;
        let raw_text_end = RAW_TEXT.contains(&tag.as_str()).then(|| format!("</{tag}"));
        let has_content = !self_closing && !VOID.contains(&tag.as_str());

        elements.push(ElementSeed {
            tag,
            attributes: parse_attributes(raw_attributes),
            parent: open.last().map(|(i, _)| *i),
            inner_html: String::new(),
        });

        if let Some(end_tag) = raw_text_end {
            let close = lower[content_start..]
                .find(&end_tag)
                .map(|i| content_start + i)
                .unwrap_or(html.len());
            elements[index].inner_html = html[content_start..close].to_string();
            pos = skip_past(&lower, close, ">");
        } else {
            if has_content {
                open.push((index, content_start));
            }
            pos = content_start;
        }
    }

    for (index, content_start) in open {
        elements[index].inner_html = html[content_start..].to_string();
    }

    elements
}

/// Offset just past the next `needle` at or after `from`, or the end.
fn skip_past(lower: &str, from: usize, needle: &str) -> usize {
    lower
        .get(from..)
        .and_then(|rest| rest.find(needle))
        .map(|i| from + i + needle.len())
        .unwrap_or(lower.len())
}

fn tag_name_end(lower: &str, from: usize) -> usize {
    lower.as_bytes()[from..]
        .iter()
        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'-' || *b == b':'))
        .map(|i| from + i)
        .unwrap_or(lower.len())
}

/// Index of the `>` closing the start tag, skipping quoted attribute values.
fn find_tag_end(html: &str, from: usize) -> Option<usize> {
    let mut quote = None;
    for (i, c) in html[from..].char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '>') => return Some(from + i),
            _ => {}
        }
    }
    None
}

fn parse_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attributes: Vec<(String, String)> = Vec::new();
    let mut chars = tag.trim_end_matches('/').chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == '/').is_some() {}
        let name: String = std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace() && *c != '='))
            .collect();
        if name.is_empty() {
            break;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'=').is_some() {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            match chars.next_if(|c| *c == '"' || *c == '\'') {
                Some(q) => {
                    value.extend(std::iter::from_fn(|| chars.next_if(|c| *c != q)));
                    // closing quote
                    chars.next_if_eq(&q);
                }
                None => value.extend(std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace()))),
            }
        }

        let name = name.to_ascii_lowercase();
        if !attributes.iter().any(|(key, _)| *key == name) {
            attributes.push((name, value));
        }
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(elements: &[ElementSeed]) -> Vec<&str> {
        elements.iter().map(|e| e.tag.as_str()).collect()
    }

    #[test]
    fn test_studio_starter_document() {
        let html = r#"<!doctype html><html><head><meta charset="utf-8"/><title>App</title></head><body><h1>Hello NXE</h1><div id="app"></div></body></html>"#;
        let elements = parse(html);

        assert_eq!(tags(&elements), vec!["html", "head", "meta", "title", "body", "h1", "div"]);
        let app = &elements[6];
        assert_eq!(app.attribute("id"), Some("app"));
        assert_eq!(app.parent, Some(4));
        assert_eq!(elements[3].inner_html, "App");
        assert_eq!(elements[4].inner_html, r#"<h1>Hello NXE</h1><div id="app"></div>"#);
        // meta is void, so title is a sibling rather than a child.
        assert_eq!(elements[3].parent, Some(1));
    }

    #[test]
    fn test_raw_text_is_not_parsed() {
        let elements = parse("<body><script>if (a < b) { x = '<div>'; }</script><p>after</p></body>");
        assert_eq!(tags(&elements), vec!["body", "script", "p"]);
        assert_eq!(elements[1].inner_html, "if (a < b) { x = '<div>'; }");
        assert_eq!(elements[2].parent, Some(0));
    }

    #[test]
    fn test_comments_are_skipped() {
        let elements = parse("<div><!-- <span id=x></span> --><b>y</b></div>");
        assert_eq!(tags(&elements), vec!["div", "b"]);
    }

    #[test]
    fn test_unclosed_children_close_with_parent() {
        let elements = parse("<ul><li>one<li>two</ul><p>x</p>");
        assert_eq!(tags(&elements), vec!["ul", "li", "li", "p"]);
        assert_eq!(elements[2].parent, Some(1));
        assert_eq!(elements[2].inner_html, "two");
        assert_eq!(elements[3].parent, None);
    }

    #[test]
    fn test_stray_end_tag_and_bare_lt() {
        let elements = parse("</span><p>1 < 2</p>");
        assert_eq!(tags(&elements), vec!["p"]);
        assert_eq!(elements[0].inner_html, "1 < 2");
    }

    #[test]
    fn test_first_duplicate_attribute_wins() {
        let elements = parse(r#"<div ID="a" id='b' hidden class=wide>"#);
        assert_eq!(
            elements[0].attributes,
            vec![
                ("id".to_string(), "a".to_string()),
                ("hidden".to_string(), String::new()),
                ("class".to_string(), "wide".to_string()),
            ]
        );
        assert_eq!(elements[0].inner_html, "");
    }
}
