use regex::Regex;
use substrate_core::{Result, SubstrateError};

/// Tag names models use when they write a tool invocation as text.
const GENERIC_TAGS: &str = r"tool_call|function_call|tool_use|function_calls|invoke";

const EXCERPT_CHARS: usize = 160;

/// Text in an assistant message that looks like a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contamination {
    /// The tool the text appears to call, when it can be told.
    pub tool_name: Option<String>,
    pub excerpt: String,
}

/// Spots pseudo-XML tool invocations in plain assistant text.
///
/// Observability only: a hit is reported, never parsed or executed.
pub struct ContaminationDetector {
    pattern: Regex,
    name_attr: Regex,
}

impl ContaminationDetector {
    /// Matches `<tool_call>`, `<function_call>`, vendor-prefixed forms such
    /// as `<xai:function_call name="...">`, and `<known_tool_name ...>`.
    pub fn new<I, S>(tool_names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known: Vec<String> = tool_names
            .into_iter()
            .map(|n| regex::escape(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();
        let alternatives = if known.is_empty() {
            GENERIC_TAGS.to_string()
        } else {
            format!("{GENERIC_TAGS}|{}", known.join("|"))
        };
        let pattern = Regex::new(&format!(
            r"(?i)<\s*(?:[a-z0-9_-]+:)?(?P<tag>{alternatives})(?:\s[^>]*)?>"
        ))
        .map_err(regex_error)?;
        let name_attr = Regex::new(r#"name\s*=\s*["']([^"']+)["']"#).map_err(regex_error)?;
        Ok(Self { pattern, name_attr })
    }

    /// First tool-invocation-like tag in `text`, if any.
    pub fn inspect(&self, text: &str) -> Option<Contamination> {
        let caps = self.pattern.captures(text)?;
        let whole = caps.get(0)?;
        let tag = caps.name("tag")?.as_str();

        let tool_name = if GENERIC_TAGS.split('|').any(|g| g.eq_ignore_ascii_case(tag)) {
            self.name_attr
                .captures(whole.as_str())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        } else {
            Some(tag.to_string())
        };

        Some(Contamination {
            tool_name,
            excerpt: text[whole.start()..].chars().take(EXCERPT_CHARS).collect(),
        })
    }
}

fn regex_error(e: regex::Error) -> SubstrateError {
    SubstrateError::Other(e.into())
}
