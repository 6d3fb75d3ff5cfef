//! # URL Template Matcher
//!
//! This module compiles URL templates of the form used by HTTP↔gRPC
//! transcoding annotations (`/v1/shelves/{shelf}/books/{book=pages/*}:read`)
//! into [`Pattern`] values that can be matched against incoming request
//! paths.
//!
//! ## Grammar
//!
//! Segments are separated by `/`. A segment is either:
//!
//! * a literal token (any token not containing `{`, `}`, `=`, `*` or `:`),
//! * `*`, matching exactly one non-empty segment,
//! * `**`, matching zero or more remaining segments (only allowed in final
//!   position),
//! * `{name}` or `{name=sub/pattern}`, binding the matched segments to a
//!   variable. Sub-patterns may contain literals and wildcards but no nested
//!   variables.
//!
//! A final `:verb` suffix (outside of any variable) is matched against the
//! verb split off the last path segment. Verb comparison is case-sensitive.
//!
//! Path segments are percent-decoded one by one before literal comparison;
//! an escape that would decode to `/` is deliberately left undecoded so a
//! captured value can never smuggle a path separator.

use std::collections::BTreeMap;
use std::fmt;

/// Errors raised while compiling a URL template.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("template '{0}' does not start with '/'")]
    MissingLeadingSlash(String),
    #[error("unbalanced brace in template segment '{0}'")]
    UnbalancedBrace(String),
    #[error("nested variable in template segment '{0}'")]
    NestedVariable(String),
    #[error("empty variable name in template segment '{0}'")]
    EmptyVariable(String),
    #[error("invalid literal segment '{0}'")]
    InvalidLiteral(String),
    #[error("empty segment in template")]
    EmptySegment,
    #[error("'**' must be the final segment of the template")]
    DeepWildcardPosition,
    #[error("empty verb in template")]
    EmptyVerb,
}

/// One matching step inside a variable sub-pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SubSegment {
    Literal(String),
    Wildcard,
    DeepWildcard,
}

/// One top-level segment of a compiled template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    DeepWildcard,
    Variable { name: String, segments: Vec<SubSegment> },
}

/// Variable bindings produced by a successful match, keyed by variable name.
///
/// Values are percent-decoded, with multi-segment captures joined by `/`.
pub type PathBindings = BTreeMap<String, String>;

/// A compiled URL template.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
    verb: Option<String>,
    /// Number of literal segments, counting literals inside variables.
    literals: usize,
    /// Number of variables bound by this pattern.
    variables: usize,
    raw: String,
}

impl Pattern {
    /// Compiles a URL template.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] for unbalanced braces, nested variables,
    /// misplaced or repeated `**` wildcards, empty segments and malformed
    /// literals.
    pub fn parse(template: &str) -> Result<Self, PatternError> {
        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| PatternError::MissingLeadingSlash(template.to_string()))?;

        let (rest, verb) = split_verb(rest)?;

        let mut segments = Vec::new();
        let mut literals = 0;
        let mut variables = 0;
        let mut saw_deep = false;

        for raw in split_segments(rest)? {
            if saw_deep {
                return Err(PatternError::DeepWildcardPosition);
            }
            let segment = parse_segment(&raw)?;
            match &segment {
                Segment::Literal(_) => literals += 1,
                Segment::DeepWildcard => saw_deep = true,
                Segment::Variable { segments, .. } => {
                    variables += 1;
                    for sub in segments {
                        match sub {
                            SubSegment::Literal(_) => literals += 1,
                            SubSegment::DeepWildcard => saw_deep = true,
                            SubSegment::Wildcard => {}
                        }
                    }
                }
                Segment::Wildcard => {}
            }
            segments.push(segment);
        }

        if segments.is_empty() {
            return Err(PatternError::EmptySegment);
        }

        Ok(Self {
            segments,
            verb,
            literals,
            variables,
            raw: template.to_string(),
        })
    }

    /// Matches the pattern against pre-split path components and a verb.
    ///
    /// `verb` is the suffix split off the final path segment by the caller
    /// (empty when the path carries none). On success, returns the variable
    /// bindings; on mismatch, `None`.
    pub fn matches(&self, components: &[&str], verb: &str) -> Option<PathBindings> {
        match &self.verb {
            Some(v) if v != verb => return None,
            None if !verb.is_empty() => return None,
            _ => {}
        }

        let mut bindings = PathBindings::new();
        let mut pos = 0;

        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    let component = components.get(pos)?;
                    if unescape_segment(component) != *lit {
                        return None;
                    }
                    pos += 1;
                }
                Segment::Wildcard => {
                    let component = components.get(pos)?;
                    if component.is_empty() {
                        return None;
                    }
                    pos += 1;
                }
                Segment::DeepWildcard => {
                    pos = components.len();
                }
                Segment::Variable { name, segments } => {
                    let consumed = match_sub_segments(segments, &components[pos.min(components.len())..])?;
                    let value = components[pos..pos + consumed]
                        .iter()
                        .map(|c| unescape_segment(c))
                        .collect::<Vec<_>>()
                        .join("/");
                    bindings.insert(name.clone(), value);
                    pos += consumed;
                }
            }
        }

        if pos != components.len() {
            return None;
        }
        Some(bindings)
    }

    /// Number of literal segments, used as the primary specificity key.
    pub fn literals(&self) -> usize {
        self.literals
    }

    /// Number of variables bound, used as the secondary specificity key.
    pub fn variables(&self) -> usize {
        self.variables
    }

    /// The verb suffix, if any.
    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Matches a variable sub-pattern against the remaining components,
/// returning how many components it consumed.
fn match_sub_segments(segments: &[SubSegment], components: &[&str]) -> Option<usize> {
    let mut pos = 0;
    for sub in segments {
        match sub {
            SubSegment::Literal(lit) => {
                let component = components.get(pos)?;
                if unescape_segment(component) != *lit {
                    return None;
                }
                pos += 1;
            }
            SubSegment::Wildcard => {
                let component = components.get(pos)?;
                if component.is_empty() {
                    return None;
                }
                pos += 1;
            }
            SubSegment::DeepWildcard => {
                pos = components.len();
            }
        }
    }
    Some(pos)
}

/// Splits the trailing `:verb` off a template body, ignoring colons inside
/// braces.
fn split_verb(rest: &str) -> Result<(&str, Option<String>), PatternError> {
    let mut depth = 0usize;
    let mut split_at = None;
    for (i, c) in rest.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => split_at = None,
            ':' if depth == 0 => split_at = Some(i),
            _ => {}
        }
    }
    match split_at {
        Some(i) => {
            let verb = &rest[i + 1..];
            if verb.is_empty() {
                return Err(PatternError::EmptyVerb);
            }
            Ok((&rest[..i], Some(verb.to_string())))
        }
        None => Ok((rest, None)),
    }
}

/// Splits a template body on `/`, keeping variable bodies (which may contain
/// `/`) intact.
fn split_segments(rest: &str) -> Result<Vec<String>, PatternError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in rest.chars() {
        match c {
            '{' => {
                depth += 1;
                if depth > 1 {
                    return Err(PatternError::NestedVariable(rest.to_string()));
                }
                current.push(c);
            }
            '}' => {
                if depth == 0 {
                    return Err(PatternError::UnbalancedBrace(rest.to_string()));
                }
                depth -= 1;
                current.push(c);
            }
            '/' if depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(PatternError::UnbalancedBrace(rest.to_string()));
    }
    segments.push(current);
    Ok(segments)
}

fn parse_segment(raw: &str) -> Result<Segment, PatternError> {
    if raw.is_empty() {
        return Err(PatternError::EmptySegment);
    }
    if raw == "*" {
        return Ok(Segment::Wildcard);
    }
    if raw == "**" {
        return Ok(Segment::DeepWildcard);
    }
    if let Some(body) = raw.strip_prefix('{') {
        let body = body
            .strip_suffix('}')
            .ok_or_else(|| PatternError::UnbalancedBrace(raw.to_string()))?;
        let (name, sub) = match body.split_once('=') {
            Some((name, sub)) => (name, sub),
            // `{name}` is shorthand for `{name=*}`.
            None => (body, "*"),
        };
        if name.is_empty() {
            return Err(PatternError::EmptyVariable(raw.to_string()));
        }
        if name.contains(['{', '}', '=', '*', ':', '/']) {
            return Err(PatternError::InvalidLiteral(name.to_string()));
        }
        let mut segments = Vec::new();
        for (i, piece) in sub.split('/').enumerate() {
            if i > 0 && matches!(segments.last(), Some(SubSegment::DeepWildcard)) {
                return Err(PatternError::DeepWildcardPosition);
            }
            segments.push(match piece {
                "" => return Err(PatternError::EmptySegment),
                "*" => SubSegment::Wildcard,
                "**" => SubSegment::DeepWildcard,
                lit if lit.contains(['{', '}', '=', '*', ':']) => {
                    return Err(PatternError::NestedVariable(raw.to_string()));
                }
                lit => SubSegment::Literal(lit.to_string()),
            });
        }
        return Ok(Segment::Variable {
            name: name.to_string(),
            segments,
        });
    }
    if raw.contains(['{', '}', '=', '*', ':']) {
        return Err(PatternError::InvalidLiteral(raw.to_string()));
    }
    Ok(Segment::Literal(raw.to_string()))
}

/// Percent-decodes a single path segment.
///
/// Escapes that would decode to `/` (`%2F`) are kept verbatim, and invalid
/// escapes are passed through untouched rather than rejected.
pub(crate) fn unescape_segment(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    let decoded = hi << 4 | lo;
                    if decoded == b'/' {
                        out.extend_from_slice(&bytes[i..i + 3]);
                    } else {
                        out.push(decoded);
                    }
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match *b? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits a request path into components and a trailing verb.
///
/// The verb is the suffix after the last `:` in the final component. A final
/// component that *starts* with `:` is not a verb split; it is reported as
/// `None` so the caller can reject the path.
pub(crate) fn split_path(path: &str) -> Option<(Vec<&str>, &str)> {
    let rest = path.strip_prefix('/')?;
    let mut components: Vec<&str> = rest.split('/').collect();
    let last = components.last()?;
    match last.rfind(':') {
        Some(0) => None,
        Some(idx) => {
            let (head, tail) = last.split_at(idx);
            let verb = &tail[1..];
            *components.last_mut().expect("non-empty components") = head;
            Some((components, verb))
        }
        None => Some((components, "")),
    }
}
