//! Literal-or-regex patterns and the span splice they drive.

use regex::bytes::{Regex, RegexBuilder};

use crate::proto::Span;
use crate::rewrite::template::{Template, VariableSource};
use crate::rewrite::RewriteError;

/// How a literal pattern is compared to the candidate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralMatch {
    /// Pattern must be a prefix of the candidate (case-sensitive).
    Prefix,
    /// Pattern must equal the whole candidate (case-sensitive).
    Exact,
    /// Pattern must equal the whole candidate, ignoring ASCII case.
    ExactCaseless,
}

/// Literal text or compiled regex.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(Vec<u8>),
    Regex(Regex),
}

impl Pattern {
    /// `~re` is a case-sensitive regex, `~*re` a case-insensitive one, anything else a literal.
    pub fn parse(source: &str) -> Result<Self, RewriteError> {
        let (expr, caseless) = if let Some(re) = source.strip_prefix("~*") {
            (re, true)
        } else if let Some(re) = source.strip_prefix('~') {
            (re, false)
        } else {
            return Ok(Pattern::Literal(source.as_bytes().to_vec()));
        };

        RegexBuilder::new(expr)
            .case_insensitive(caseless)
            .build()
            .map(Pattern::Regex)
            .map_err(|source| RewriteError::InvalidRegex {
                pattern: expr.to_string(),
                source,
            })
    }

    /// Whether the pattern matches `candidate` anywhere (regex) or per `mode` (literal).
    pub fn is_match(&self, candidate: &[u8], mode: LiteralMatch) -> bool {
        match self {
            Pattern::Literal(lit) => literal_span(lit, candidate, mode).is_some(),
            Pattern::Regex(re) => re.is_match(candidate),
        }
    }
}

fn literal_span(lit: &[u8], candidate: &[u8], mode: LiteralMatch) -> Option<Span> {
    let matched = match mode {
        LiteralMatch::Prefix => candidate.starts_with(lit),
        LiteralMatch::Exact => candidate == lit,
        LiteralMatch::ExactCaseless => candidate.eq_ignore_ascii_case(lit),
    };
    if matched {
        Span::new(0, lit.len(), candidate.len())
    } else {
        None
    }
}

/// Pattern plus replacement template.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub pattern: Pattern,
    pub replacement: Template,
}

impl RewriteRule {
    pub fn new(pattern: Pattern, replacement: Template) -> Self {
        Self { pattern, replacement }
    }

    /// Compile a rule from its configured pattern and replacement strings.
    pub fn parse(pattern: &str, replacement: &str) -> Result<Self, RewriteError> {
        Ok(Self::new(Pattern::parse(pattern)?, Template::compile(replacement)))
    }

    /// Try the rule against `value[from..]`. On a match the matched span is
    /// replaced in `value` and `true` is returned.
    pub fn apply(
        &self,
        value: &mut Vec<u8>,
        from: usize,
        mode: LiteralMatch,
        vars: &dyn VariableSource,
    ) -> Result<bool, RewriteError> {
        let Some(candidate) = value.get(from..) else {
            return Ok(false);
        };

        let (span, replacement) = match &self.pattern {
            Pattern::Literal(lit) => match literal_span(lit, candidate, mode) {
                Some(span) => (span, self.replacement.evaluate(vars, None)),
                None => return Ok(false),
            },
            Pattern::Regex(re) => {
                let Some(caps) = re.captures(candidate) else {
                    return Ok(false);
                };
                let Some(whole) = caps.get(0) else {
                    return Ok(false);
                };
                let Some(span) = Span::from_range(whole.range(), candidate.len()) else {
                    return Ok(false);
                };
                (span, self.replacement.evaluate(vars, Some(&caps)))
            }
        };

        splice(value, span.offset(from), &replacement)?;
        Ok(true)
    }
}

/// Replace `span` of `value` with `replacement`.
///
/// A replacement no longer than the span is written in place and the tail
/// shifted left; a longer one goes into a fresh buffer of exactly
/// `value.len() - span.len() + replacement.len()` bytes.
pub fn splice(value: &mut Vec<u8>, span: Span, replacement: &[u8]) -> Result<(), RewriteError> {
    let end = span.end();
    debug_assert!(end <= value.len(), "span outside header value");

    if replacement.len() <= span.len() {
        let write_end = span.start() + replacement.len();
        value[span.start()..write_end].copy_from_slice(replacement);
        value.copy_within(end.., write_end);
        let new_len = value.len() - (span.len() - replacement.len());
        value.truncate(new_len);
        return Ok(());
    }

    let mut out = Vec::new();
    out.try_reserve_exact(value.len() - span.len() + replacement.len())?;
    out.extend_from_slice(&value[..span.start()]);
    out.extend_from_slice(replacement);
    out.extend_from_slice(&value[end..]);
    *value = out;
    Ok(())
}
