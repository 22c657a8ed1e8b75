//! Instrumentation injected into every sandbox document.
//!
//! The shim runs first inside the isolated context. It forwards console
//! calls and uncaught errors to the parent context with `postMessage`, and
//! on the strict path replaces the network and window-spawning primitives
//! with stubs that report and throw.

/// Placeholder substituted with the JSON-encoded target origin.
const ORIGIN_SLOT: &str = "__SANDBOX_TARGET_ORIGIN__";

/// Open wildcard: any embedding parent receives forwarded messages.
pub const WILDCARD_ORIGIN: &str = "*";

const FORWARDING: &str = r#"
  var TARGET = __SANDBOX_TARGET_ORIGIN__;
  var post = function (msg) {
    try { window.parent.postMessage(msg, TARGET); } catch (_) {}
  };
  var stringify = function (value) {
    try {
      return typeof value === 'object' ? JSON.stringify(value) : String(value);
    } catch (_) {
      return String(value);
    }
  };
  ['log', 'info', 'warn', 'error'].forEach(function (level) {
    var original = console[level].bind(console);
    console[level] = function () {
      var args = Array.prototype.slice.call(arguments).map(stringify);
      post({ type: 'console', level: level, args: args });
      original.apply(console, arguments);
    };
  });
  window.addEventListener('error', function (e) {
    post({ type: 'error', message: String(e.message), stack: e.error && e.error.stack });
  });
"#;

const LOCKDOWN: &str = r#"
  var disabled = function (name) {
    return function () {
      var message = name + ' is disabled in sandbox';
      post({ type: 'error', message: message });
      throw new Error(message);
    };
  };
  try { window.fetch = disabled('fetch'); } catch (_) {}
  try {
    if (window.XMLHttpRequest) {
      window.XMLHttpRequest = function () {
        return { open: disabled('XMLHttpRequest.open'), send: disabled('XMLHttpRequest.send') };
      };
    }
  } catch (_) {}
  try { window.open = disabled('window.open'); } catch (_) {}
"#;

/// Which instrumentation gets injected, and where its messages may go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationShim {
    /// Origin the parent must have for messages to be delivered.
    pub target_origin: String,
    /// Replace fetch, XMLHttpRequest and window.open with throwing stubs.
    pub lockdown: bool,
}

impl Default for InstrumentationShim {
    fn default() -> Self {
        Self {
            target_origin: WILDCARD_ORIGIN.to_string(),
            lockdown: true,
        }
    }
}

impl InstrumentationShim {
    pub fn new(target_origin: impl Into<String>, lockdown: bool) -> Self {
        Self {
            target_origin: target_origin.into(),
            lockdown,
        }
    }

    /// The complete `<script>` element to splice into the document head.
    pub fn render(&self) -> String {
        let mut body = String::from(FORWARDING);
        if self.lockdown {
            body.push_str(LOCKDOWN);
        }
        let body = body.replace(ORIGIN_SLOT, &script_string_literal(&self.target_origin));
        format!("<script>\n(function () {{{body}}})();\n</script>")
    }
}

/// Encode `value` as a JS string literal that cannot close its `<script>`.
fn script_string_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_single_script_element() {
        let shim = InstrumentationShim::default().render();
        assert!(shim.starts_with("<script>"));
        assert!(shim.ends_with("</script>"));
        assert_eq!(shim.matches("</script>").count(), 1);
    }

    #[test]
    fn test_wildcard_origin_by_default() {
        let shim = InstrumentationShim::default().render();
        assert!(shim.contains(r#"var TARGET = "*";"#));
        assert!(!shim.contains(ORIGIN_SLOT));
    }

    #[test]
    fn test_lockdown_toggle() {
        let strict = InstrumentationShim::new("*", true).render();
        assert!(strict.contains("window.fetch = disabled('fetch')"));
        assert!(strict.contains("window.open = disabled('window.open')"));

        let simple = InstrumentationShim::new("*", false).render();
        assert!(!simple.contains("window.fetch"));
        assert!(simple.contains("window.addEventListener('error'"));
        assert!(simple.contains("['log', 'info', 'warn', 'error']"));
    }

    #[test]
    fn test_origin_cannot_break_out_of_script() {
        let shim = InstrumentationShim::new("\"</script><script>alert(1)", true).render();
        assert_eq!(shim.matches("</script>").count(), 1);
        assert!(shim.contains(r#"var TARGET = "\"\u003c/script>\u003cscript>alert(1)";"#));
    }
}
