//! Replacement templates: literal text mixed with `$name`, `${name}` and
//! `$1`..`$9` regex captures.

use std::borrow::Cow;

use regex::bytes::Captures;

/// Provides request-scoped variable values to template evaluation.
pub trait VariableSource {
    /// Value of `name`, or `None` when the variable is not set for this request.
    fn variable(&self, name: &str) -> Option<Cow<'_, [u8]>>;
}

/// No variables at all.
impl VariableSource for () {
    fn variable(&self, _name: &str) -> Option<Cow<'_, [u8]>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(Vec<u8>),
    Variable(String),
    Capture(usize),
}

/// A compiled template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
    source: String,
}

impl Template {
    /// Compile `source`. A `$` that does not start a variable is kept literally.
    pub fn compile(source: &str) -> Self {
        let bytes = source.as_bytes();
        let mut parts = Vec::new();
        let mut literal = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                literal.push(bytes[i]);
                i += 1;
                continue;
            }

            let rest = &bytes[i + 1..];
            let (part, used) = match rest.first() {
                Some(d) if d.is_ascii_digit() => (Some(Part::Capture(usize::from(d - b'0'))), 1),
                Some(b'{') => match rest.iter().position(|&c| c == b'}') {
                    Some(close) if close > 1 && rest[1..close].iter().all(|&c| is_name_char(c)) => {
                        let name = String::from_utf8_lossy(&rest[1..close]).into_owned();
                        (Some(Part::Variable(name)), close + 1)
                    }
                    _ => (None, 0),
                },
                Some(c) if is_name_char(*c) => {
                    let len = rest.iter().take_while(|&&c| is_name_char(c)).count();
                    let name = String::from_utf8_lossy(&rest[..len]).into_owned();
                    (Some(Part::Variable(name)), len)
                }
                _ => (None, 0),
            };

            match part {
                Some(part) => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(part);
                    i += 1 + used;
                }
                None => {
                    literal.push(b'$');
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Self {
            parts,
            source: source.to_string(),
        }
    }

    /// Template that always evaluates to `text`.
    pub fn literal(text: &[u8]) -> Self {
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            vec![Part::Literal(text.to_vec())]
        };
        Self {
            parts,
            source: String::from_utf8_lossy(text).into_owned(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when evaluation never depends on the request.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Names of the `$variables` the template reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Variable(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Evaluate against request variables and optional regex captures.
    /// Unset variables and missing captures expand to nothing.
    pub fn evaluate(&self, vars: &dyn VariableSource, captures: Option<&Captures<'_>>) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.extend_from_slice(text),
                Part::Variable(name) => {
                    if let Some(value) = vars.variable(name) {
                        out.extend_from_slice(&value);
                    }
                }
                Part::Capture(index) => {
                    if let Some(m) = captures.and_then(|c| c.get(*index)) {
                        out.extend_from_slice(m.as_bytes());
                    }
                }
            }
        }
        out
    }
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
