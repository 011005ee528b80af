//! `Location` and `Refresh` rewriting.

use crate::rewrite::pattern::{LiteralMatch, Pattern, RewriteRule};
use crate::rewrite::template::VariableSource;
use crate::rewrite::RewriteError;

/// Ordered redirect rules plus the optional default rule derived from the
/// upstream URL and the matched location.
#[derive(Debug, Clone, Default)]
pub struct RedirectRewriter {
    rules: Vec<RewriteRule>,
    default: Option<RewriteRule>,
}

impl RedirectRewriter {
    pub fn new(rules: Vec<RewriteRule>, default: Option<RewriteRule>) -> Self {
        Self { rules, default }
    }

    /// Rewriter that never changes anything.
    pub fn off() -> Self {
        Self::default()
    }

    pub fn is_off(&self) -> bool {
        self.rules.is_empty() && self.default.is_none()
    }

    pub fn default_rule(&self) -> Option<&RewriteRule> {
        self.default.as_ref()
    }

    /// Rewrite a `Location` value in place. Returns whether a rule matched.
    pub fn rewrite_location(&self, value: &mut Vec<u8>, vars: &dyn VariableSource) -> Result<bool, RewriteError> {
        self.rewrite_from(value, 0, vars)
    }

    /// Rewrite the `url=` part of a `Refresh` value in place.
    pub fn rewrite_refresh(&self, value: &mut Vec<u8>, vars: &dyn VariableSource) -> Result<bool, RewriteError> {
        match find_caseless(value, b"url=") {
            Some(at) => self.rewrite_from(value, at + 4, vars),
            None => Ok(false),
        }
    }

    fn rewrite_from(&self, value: &mut Vec<u8>, prefix: usize, vars: &dyn VariableSource) -> Result<bool, RewriteError> {
        for rule in self.rules.iter().chain(self.default.iter()) {
            if rule.apply(value, prefix, LiteralMatch::Prefix, vars)? {
                return Ok(true);
            }
            // Path-only literals also apply to absolute redirects, after scheme and host.
            if let Pattern::Literal(lit) = &rule.pattern {
                if lit.starts_with(b"/") {
                    if let Some(path_at) = authority_end(&value[prefix..]) {
                        if rule.apply(value, prefix + path_at, LiteralMatch::Prefix, vars)? {
                            return Ok(true);
                        }
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Offset of the path in an absolute `scheme://authority/path` value.
fn authority_end(value: &[u8]) -> Option<usize> {
    let scheme_end = find_caseless(value, b"://")?;
    let scheme = &value[..scheme_end];
    if scheme.is_empty() || !scheme.iter().all(|c| c.is_ascii_alphanumeric() || matches!(c, b'+' | b'-' | b'.')) {
        return None;
    }
    let host_start = scheme_end + 3;
    let path = value[host_start..].iter().position(|&c| c == b'/')?;
    Some(host_start + path)
}

fn find_caseless(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(rules: &[(&str, &str)], default: Option<(&str, &str)>) -> RedirectRewriter {
        let rules = rules.iter().map(|(p, r)| RewriteRule::parse(p, r).unwrap()).collect();
        let default = default.map(|(p, r)| RewriteRule::parse(p, r).unwrap());
        RedirectRewriter::new(rules, default)
    }

    #[test]
    fn test_first_rule_wins() {
        let rw = rewriter(&[("http://up/a/", "/one/"), ("http://up/", "/two/")], None);
        let mut value = b"http://up/a/b".to_vec();
        assert!(rw.rewrite_location(&mut value, &()).unwrap());
        assert_eq!(value, b"/one/b");
    }

    #[test]
    fn test_default_rule_tried_last() {
        let rw = rewriter(&[("http://other/", "/x/")], Some(("http://up/app/", "/app/")));
        let mut value = b"http://up/app/page?q=1".to_vec();
        assert!(rw.rewrite_location(&mut value, &()).unwrap());
        assert_eq!(value, b"/app/page?q=1");
    }

    #[test]
    fn test_identity_rule_is_idempotent() {
        let rw = rewriter(&[("http://up/app/", "http://up/app/")], None);
        let original = b"http://up/app/page".to_vec();
        let mut value = original.clone();
        assert!(rw.rewrite_location(&mut value, &()).unwrap());
        assert_eq!(value, original);
    }

    #[test]
    fn test_path_literal_after_host() {
        let rw = rewriter(&[("/internal/", "/public/")], None);
        let mut value = b"https://site.example/internal/x".to_vec();
        assert!(rw.rewrite_location(&mut value, &()).unwrap());
        assert_eq!(value, b"https://site.example/public/x");
    }

    #[test]
    fn test_refresh_url_part() {
        let rw = rewriter(&[("http://up/", "http://front/")], None);
        let mut value = b"5; URL=http://up/next".to_vec();
        assert!(rw.rewrite_refresh(&mut value, &()).unwrap());
        assert_eq!(value, b"5; URL=http://front/next");

        let mut no_url = b"5".to_vec();
        assert!(!rw.rewrite_refresh(&mut no_url, &()).unwrap());
    }

    #[test]
    fn test_off_changes_nothing() {
        let rw = RedirectRewriter::off();
        assert!(rw.is_off());
        let mut value = b"http://up/".to_vec();
        assert!(!rw.rewrite_location(&mut value, &()).unwrap());
    }
}
