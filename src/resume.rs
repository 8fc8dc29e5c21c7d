//! Resume-line codec.
//!
//! A resume line is a single backtick-wrapped CLI command embedded in chat
//! (`` `codex resume <id>` ``) that names an engine-side conversation. Each
//! adapter owns one codec built from its canonical regex; extraction is
//! last-match-wins so the freshest token in a message body is the one that
//! gets resumed.

use regex::Regex;

use crate::model::{EngineId, ResumeToken};

#[derive(Debug, Clone)]
pub struct ResumeCodec {
    engine: EngineId,
    pattern: Regex,
    /// Pi session tokens may be quoted file paths; strip matching quotes.
    strip_quotes: bool,
}

impl ResumeCodec {
    pub fn new(engine: EngineId, pattern: Regex) -> Self {
        Self {
            engine,
            pattern,
            strip_quotes: false,
        }
    }

    pub fn with_quote_stripping(mut self) -> Self {
        self.strip_quotes = true;
        self
    }

    pub fn engine(&self) -> &EngineId {
        &self.engine
    }

    /// Fast predicate used by the truncator to recognize lines that must
    /// survive truncation verbatim.
    pub fn is_line(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    /// Extract the last resume token mentioned in `text`, if any.
    pub fn extract(&self, text: &str) -> Option<ResumeToken> {
        let mut found: Option<&str> = None;
        for captures in self.pattern.captures_iter(text) {
            if let Some(token) = captures.name("token") {
                if !token.as_str().is_empty() {
                    found = Some(token.as_str());
                }
            }
        }
        let mut value = found?.trim().to_string();
        if self.strip_quotes {
            value = strip_matching_quotes(&value);
        }
        if value.is_empty() {
            return None;
        }
        Some(ResumeToken::new(self.engine.clone(), value))
    }
}

fn strip_matching_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}
