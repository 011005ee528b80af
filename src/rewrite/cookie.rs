//! `Set-Cookie` rewriting: `Domain` and `Path` attribute rules plus flag edits
//! keyed on the cookie name.

use std::fmt;

use crate::rewrite::pattern::{LiteralMatch, Pattern, RewriteRule};
use crate::rewrite::template::VariableSource;
use crate::rewrite::RewriteError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    key: Vec<u8>,
    /// `None` for a bare `key`, `Some(vec![])` for `key=`.
    value: Option<Vec<u8>>,
    removed: bool,
}

impl Attribute {
    fn is(&self, key: &[u8]) -> bool {
        !self.removed && self.key.eq_ignore_ascii_case(key)
    }
}

/// Ordered attribute pairs of one `Set-Cookie` value. The first pair is the
/// cookie's own `name=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttributes {
    attrs: Vec<Attribute>,
}

impl CookieAttributes {
    pub fn parse(value: &[u8]) -> Self {
        let mut attrs = Vec::new();
        for (index, segment) in value.split(|&c| c == b';').enumerate() {
            let segment = segment.trim_ascii();
            if segment.is_empty() && index > 0 {
                continue;
            }
            let (key, value) = match segment.iter().position(|&c| c == b'=') {
                Some(eq) => (segment[..eq].trim_ascii(), Some(segment[eq + 1..].trim_ascii().to_vec())),
                None => (segment, None),
            };
            attrs.push(Attribute {
                key: key.to_vec(),
                value,
                removed: false,
            });
        }
        Self { attrs }
    }

    /// Cookie name.
    pub fn name(&self) -> &[u8] {
        self.attrs.first().map(|a| a.key.as_slice()).unwrap_or_default()
    }

    /// Value of attribute `key` (case-insensitive). The outer `Option` is
    /// presence, the inner one distinguishes `key` from `key=`.
    pub fn get(&self, key: &str) -> Option<Option<&[u8]>> {
        self.attributes()
            .find(|a| a.is(key.as_bytes()))
            .map(|a| a.value.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Overwrite the first `key` attribute or append a new one. Returns
    /// whether anything changed.
    pub fn set(&mut self, key: &str, value: Option<&[u8]>) -> bool {
        match self.attrs.iter_mut().skip(1).find(|a| a.is(key.as_bytes())) {
            Some(attr) => {
                if attr.value.as_deref() == value {
                    return false;
                }
                attr.value = value.map(<[u8]>::to_vec);
            }
            None => self.attrs.push(Attribute {
                key: key.as_bytes().to_vec(),
                value: value.map(<[u8]>::to_vec),
                removed: false,
            }),
        }
        true
    }

    /// Drop every `key` attribute. Returns whether any was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let mut removed = false;
        for attr in self.attrs.iter_mut().skip(1).filter(|a| a.is(key.as_bytes())) {
            attr.removed = true;
            removed = true;
        }
        removed
    }

    fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter().skip(1).filter(|a| !a.removed)
    }

    /// Join the surviving pairs with `"; "`.
    pub fn serialize(&self) -> Result<Vec<u8>, RewriteError> {
        let live = || self.attrs.iter().filter(|a| !a.removed);
        let size: usize = live()
            .map(|a| a.key.len() + a.value.as_ref().map_or(0, |v| v.len() + 1) + 2)
            .sum();

        let mut out = Vec::new();
        out.try_reserve_exact(size.saturating_sub(2))?;
        for (i, attr) in live().enumerate() {
            if i > 0 {
                out.extend_from_slice(b"; ");
            }
            out.extend_from_slice(&attr.key);
            if let Some(value) = &attr.value {
                out.push(b'=');
                out.extend_from_slice(value);
            }
        }
        Ok(out)
    }

    /// Apply one flag edit. Returns whether the attributes changed.
    pub fn apply_flag(&mut self, flag: CookieFlag) -> bool {
        match flag {
            CookieFlag::Secure(true) => !self.contains("secure") && self.set("Secure", None),
            CookieFlag::Secure(false) => self.remove("secure"),
            CookieFlag::HttpOnly(true) => !self.contains("httponly") && self.set("HttpOnly", None),
            CookieFlag::HttpOnly(false) => self.remove("httponly"),
            CookieFlag::SameSite(Some(mode)) => match self.attrs.iter_mut().skip(1).find(|a| a.is(b"samesite")) {
                Some(attr) if attr.value.as_deref() == Some(mode.as_str().as_bytes()) => false,
                Some(attr) => {
                    attr.value = Some(mode.as_str().as_bytes().to_vec());
                    true
                }
                None => self.set("SameSite", Some(mode.as_str().as_bytes())),
            },
            CookieFlag::SameSite(None) => self.remove("samesite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flag edit: `true`/`Some` adds or overwrites, `false`/`None` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFlag {
    Secure(bool),
    HttpOnly(bool),
    SameSite(Option<SameSite>),
}

impl CookieFlag {
    /// Parse `secure`, `nosecure`, `httponly`, `nohttponly`,
    /// `samesite=strict|lax|none` or `nosamesite`.
    pub fn parse(token: &str) -> Result<Self, RewriteError> {
        let flag = match token.to_ascii_lowercase().as_str() {
            "secure" => CookieFlag::Secure(true),
            "nosecure" => CookieFlag::Secure(false),
            "httponly" => CookieFlag::HttpOnly(true),
            "nohttponly" => CookieFlag::HttpOnly(false),
            "samesite" | "samesite=strict" => CookieFlag::SameSite(Some(SameSite::Strict)),
            "samesite=lax" => CookieFlag::SameSite(Some(SameSite::Lax)),
            "samesite=none" => CookieFlag::SameSite(Some(SameSite::None)),
            "nosamesite" => CookieFlag::SameSite(None),
            _ => return Err(RewriteError::InvalidCookieFlag(token.to_string())),
        };
        Ok(flag)
    }
}

/// Flags applied to cookies whose name matches `cookie`.
#[derive(Debug, Clone)]
pub struct CookieFlagRule {
    pub cookie: Pattern,
    pub flags: Vec<CookieFlag>,
}

impl CookieFlagRule {
    pub fn parse<S: AsRef<str>>(cookie: &str, flags: &[S]) -> Result<Self, RewriteError> {
        Ok(Self {
            cookie: Pattern::parse(cookie)?,
            flags: flags
                .iter()
                .map(|f| CookieFlag::parse(f.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn matches(&self, name: &[u8]) -> bool {
        self.cookie.is_match(name, LiteralMatch::Exact)
    }
}

/// All cookie rules of one route.
#[derive(Debug, Clone, Default)]
pub struct CookieRewriter {
    domains: Vec<RewriteRule>,
    paths: Vec<RewriteRule>,
    flags: Vec<CookieFlagRule>,
}

impl CookieRewriter {
    pub fn new(domains: Vec<RewriteRule>, paths: Vec<RewriteRule>, flags: Vec<CookieFlagRule>) -> Self {
        Self { domains, paths, flags }
    }

    pub fn is_off(&self) -> bool {
        self.domains.is_empty() && self.paths.is_empty() && self.flags.is_empty()
    }

    /// Rewrite one `Set-Cookie` value. `Ok(None)` means the value is unchanged.
    pub fn rewrite(&self, value: &[u8], vars: &dyn VariableSource) -> Result<Option<Vec<u8>>, RewriteError> {
        if self.is_off() {
            return Ok(None);
        }

        let mut cookie = CookieAttributes::parse(value);
        let mut changed = false;

        for attr in cookie.attrs.iter_mut().skip(1).filter(|a| !a.removed) {
            let Some(attr_value) = attr.value.as_mut() else {
                continue;
            };
            if attr.key.eq_ignore_ascii_case(b"domain") {
                let skip = usize::from(attr_value.first() == Some(&b'.'));
                changed |= apply_first(&self.domains, attr_value, skip, LiteralMatch::ExactCaseless, vars)?;
            } else if attr.key.eq_ignore_ascii_case(b"path") {
                changed |= apply_first(&self.paths, attr_value, 0, LiteralMatch::Prefix, vars)?;
            }
        }

        if let Some(rule) = self.flags.iter().find(|r| r.matches(cookie.name())) {
            for flag in &rule.flags {
                changed |= cookie.apply_flag(*flag);
            }
        }

        if changed {
            cookie.serialize().map(Some)
        } else {
            Ok(None)
        }
    }
}

fn apply_first(
    rules: &[RewriteRule],
    value: &mut Vec<u8>,
    from: usize,
    mode: LiteralMatch,
    vars: &dyn VariableSource,
) -> Result<bool, RewriteError> {
    for rule in rules {
        if rule.apply(value, from, mode, vars)? {
            return Ok(true);
        }
    }
    Ok(false)
}
