//! Rule model
//!
//! A `RuleSet` holds ordered `(pattern, action)` pairs partitioned by scope
//! (client, server, both) and by category (reset, close, ignore, rewrite).
//! Rules are appended while the set is built and are read-only afterwards,
//! so one set can be shared by reference across every session.

use bytes::Bytes;
use regex::bytes::{NoExpand, Regex, RegexBuilder};
use std::borrow::Cow;
use std::fmt;

use crate::error::{ProxyError, Result};

/// Which traffic a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Data sent by the client towards the upstream
    Client,
    /// Data sent by the upstream towards the client
    Server,
    /// Both directions
    Both,
}

/// Originating side of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client -> upstream
    Client,
    /// Upstream -> client
    Server,
}

impl Direction {
    /// Display tag used by output collaborators
    pub fn tag(&self) -> &'static str {
        match self {
            Direction::Client => "outgoing",
            Direction::Server => "incoming",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Action taken when a rule's pattern matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Reset,
    Close,
    Ignore,
    Rewrite(Bytes),
}

/// Byte pattern: a fixed string or a regular expression.
///
/// Both forms compile to a byte regex with Unicode mode off, so `.` matches
/// any byte and `\xNN` is the raw byte `NN`. Regex anchors `^` and `$`
/// match at line boundaries.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    literal: bool,
}

impl Pattern {
    /// Fixed string pattern
    pub fn literal(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(invalid(text, "empty pattern"));
        }
        let regex = compile(&regex::escape(text), false).map_err(|e| invalid(text, e))?;
        Ok(Self {
            source: text.to_string(),
            regex,
            literal: true,
        })
    }

    /// Regular expression pattern
    pub fn regex(expr: &str) -> Result<Self> {
        if expr.is_empty() {
            return Err(invalid(expr, "empty pattern"));
        }
        let regex = compile(expr, true).map_err(|e| invalid(expr, e))?;
        Ok(Self {
            source: expr.to_string(),
            regex,
            literal: false,
        })
    }

    /// Parse `/REGEXP/[imx]` as a regex, anything else as a literal string
    pub fn parse(spec: &str) -> Result<Self> {
        match split_regex_literal(spec) {
            Some((body, flags)) => Self::regex(&with_inline_flags(body, flags)),
            None => Self::literal(spec),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.literal
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, data: &[u8]) -> bool {
        self.regex.is_match(data)
    }

    /// Substitute every match. Regex patterns expand `$N` group references
    /// in `replacement`; literal patterns insert it verbatim.
    pub fn replace_all<'h>(&self, data: &'h [u8], replacement: &[u8]) -> Cow<'h, [u8]> {
        if self.literal {
            self.regex.replace_all(data, NoExpand(replacement))
        } else {
            self.regex.replace_all(data, replacement)
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.literal {
            write!(f, "{:?}", self.source)
        } else {
            write!(f, "/{}/", self.source)
        }
    }
}

fn compile(expr: &str, multi_line: bool) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(expr)
        .unicode(false)
        .multi_line(multi_line)
        .build()
}

/// Parse a rewrite specification: `/REGEXP/[imx]:STRING` or `STRING:STRING`
pub fn parse_rewrite(spec: &str) -> Result<(Pattern, Bytes)> {
    if spec.starts_with('/') {
        let bytes = spec.as_bytes();
        for (i, _) in spec.match_indices('/').skip(1) {
            let flags_len = bytes[i + 1..]
                .iter()
                .take_while(|b| matches!(**b, b'i' | b'm' | b'x'))
                .count();
            let sep = i + 1 + flags_len;
            if bytes.get(sep) == Some(&b':') {
                let pattern = Pattern::parse(&spec[..sep])?;
                let replacement = Bytes::copy_from_slice(spec[sep + 1..].as_bytes());
                return Ok((pattern, replacement));
            }
        }
        return Err(invalid(spec, "expected /REGEXP/:STRING"));
    }

    let (pattern, replacement) = spec
        .split_once(':')
        .ok_or_else(|| invalid(spec, "expected PATTERN:STRING"))?;
    Ok((
        Pattern::literal(pattern)?,
        Bytes::copy_from_slice(replacement.as_bytes()),
    ))
}

fn split_regex_literal(spec: &str) -> Option<(&str, &str)> {
    let rest = spec.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let flags = &rest[end + 1..];
    if flags.chars().all(|c| matches!(c, 'i' | 'm' | 'x')) {
        Some((&rest[..end], flags))
    } else {
        None
    }
}

/// Map `/re/imx` suffix flags onto inline regex flags. `m` follows the
/// dot-matches-newline meaning it has in `/re/m` literals; line anchors
/// are always on.
fn with_inline_flags(body: &str, flags: &str) -> String {
    let mut inline = String::new();
    for c in flags.chars() {
        let flag = match c {
            'm' => 's',
            other => other,
        };
        if !inline.contains(flag) {
            inline.push(flag);
        }
    }
    if inline.is_empty() {
        body.to_string()
    } else {
        format!("(?{}){}", inline, body)
    }
}

fn invalid(pattern: &str, reason: impl fmt::Display) -> ProxyError {
    ProxyError::InvalidRule {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Rules for one scope, grouped by category in registration order
#[derive(Debug, Clone, Default)]
struct ScopedRules {
    reset: Vec<Pattern>,
    close: Vec<Pattern>,
    ignore: Vec<Pattern>,
    rewrite: Vec<(Pattern, Bytes)>,
}

impl ScopedRules {
    fn len(&self) -> usize {
        self.reset.len() + self.close.len() + self.ignore.len() + self.rewrite.len()
    }
}

/// Ordered, append-only rule collection
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    client: ScopedRules,
    server: ScopedRules,
    both: ScopedRules,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// Append a rule
    pub fn push(&mut self, scope: Scope, pattern: Pattern, action: Action) {
        let rules = match scope {
            Scope::Client => &mut self.client,
            Scope::Server => &mut self.server,
            Scope::Both => &mut self.both,
        };
        match action {
            Action::Reset => rules.reset.push(pattern),
            Action::Close => rules.close.push(pattern),
            Action::Ignore => rules.ignore.push(pattern),
            Action::Rewrite(replacement) => rules.rewrite.push((pattern, replacement)),
        }
    }

    pub fn len(&self) -> usize {
        self.client.len() + self.server.len() + self.both.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scoped(&self, direction: Direction) -> &ScopedRules {
        match direction {
            Direction::Client => &self.client,
            Direction::Server => &self.server,
        }
    }

    /// Reset patterns for `direction`, scope-specific first
    pub fn resets(&self, direction: Direction) -> impl Iterator<Item = &Pattern> {
        self.scoped(direction).reset.iter().chain(self.both.reset.iter())
    }

    /// Close patterns for `direction`, scope-specific first
    pub fn closes(&self, direction: Direction) -> impl Iterator<Item = &Pattern> {
        self.scoped(direction).close.iter().chain(self.both.close.iter())
    }

    /// Ignore patterns for `direction`, scope-specific first
    pub fn ignores(&self, direction: Direction) -> impl Iterator<Item = &Pattern> {
        self.scoped(direction)
            .ignore
            .iter()
            .chain(self.both.ignore.iter())
    }

    /// Rewrite rules for `direction`, scope-specific first
    pub fn rewrites(&self, direction: Direction) -> impl Iterator<Item = &(Pattern, Bytes)> {
        self.scoped(direction)
            .rewrite
            .iter()
            .chain(self.both.rewrite.iter())
    }
}

/// Builder that parses pattern text and validates every rule up front
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    rules: RuleSet,
}

impl RuleSetBuilder {
    /// Add a reset rule; `pattern` uses the `/REGEXP/` or literal syntax
    pub fn reset(mut self, scope: Scope, pattern: &str) -> Result<Self> {
        self.rules.push(scope, Pattern::parse(pattern)?, Action::Reset);
        Ok(self)
    }

    /// Add a close rule
    pub fn close(mut self, scope: Scope, pattern: &str) -> Result<Self> {
        self.rules.push(scope, Pattern::parse(pattern)?, Action::Close);
        Ok(self)
    }

    /// Add an ignore rule
    pub fn ignore(mut self, scope: Scope, pattern: &str) -> Result<Self> {
        self.rules.push(scope, Pattern::parse(pattern)?, Action::Ignore);
        Ok(self)
    }

    /// Add a rewrite rule
    pub fn rewrite(mut self, scope: Scope, pattern: &str, replacement: &str) -> Result<Self> {
        let replacement = Bytes::copy_from_slice(replacement.as_bytes());
        self.rules
            .push(scope, Pattern::parse(pattern)?, Action::Rewrite(replacement));
        Ok(self)
    }

    /// Add a rewrite rule from a combined `PATTERN:STRING` specification
    pub fn rewrite_spec(mut self, scope: Scope, spec: &str) -> Result<Self> {
        let (pattern, replacement) = parse_rewrite(spec)?;
        self.rules.push(scope, pattern, Action::Rewrite(replacement));
        Ok(self)
    }

    pub fn build(self) -> RuleSet {
        self.rules
    }
}
