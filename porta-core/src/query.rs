//! # Query-Parameter Decoder
//!
//! Populates a request [`DynamicMessage`] from URL query entries. Each key
//! is a dotted field path resolved through [`crate::fieldpath`]; keys whose
//! prefix is already owned by the body binding or a URL variable are
//! skipped via a [`PathFilter`].
//!
//! Unknown keys are ignored by default — a request may legitimately carry
//! parameters aimed at middleware — unless strict mode is enabled.

use crate::fieldpath::{self, FieldPathError};
use prost_reflect::{DynamicMessage, ReflectMessage};
use std::collections::HashMap;

/// Errors raised while decoding query parameters.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
    #[error("unknown query parameter '{0}'")]
    UnknownParameter(String),
}

/// Separator used when several repeated-field values are packed into a
/// single query value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    Comma,
    Pipe,
    Space,
    Tab,
}

impl Separator {
    fn as_char(self) -> char {
        match self {
            Separator::Comma => ',',
            Separator::Pipe => '|',
            Separator::Space => ' ',
            Separator::Tab => '\t',
        }
    }
}

/// Decoding options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Reject unknown parameter names instead of skipping them.
    pub strict: bool,
    /// Separator for packed repeated values.
    pub separator: Separator,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            strict: false,
            separator: Separator::Comma,
        }
    }
}

/// A trie of dotted field paths with prefix-match lookup.
///
/// `covers` answers whether any inserted path is a prefix of (or equal to)
/// the probed path, which is exactly the filter the dispatcher needs: a
/// bound `nested` subtree owns `nested.child.name` too.
#[derive(Debug, Default, Clone)]
pub struct PathFilter {
    root: FilterNode,
}

#[derive(Debug, Default, Clone)]
struct FilterNode {
    children: HashMap<String, FilterNode>,
    terminal: bool,
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a dotted path.
    pub fn insert(&mut self, path: &str) {
        let mut node = &mut self.root;
        for segment in path.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.terminal = true;
    }

    /// Returns true when an inserted path is a prefix of `path`.
    pub fn covers(&self, path: &str) -> bool {
        let mut node = &self.root;
        for segment in path.split('.') {
            if node.terminal {
                return true;
            }
            match node.children.get(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        node.terminal
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && !self.root.terminal
    }
}

/// Decodes query entries into `msg`, in entry order.
///
/// Repeated keys append in order. When the target field is repeated and a
/// single value contains the configured separator, the value is split and
/// each piece coerced independently.
pub fn decode_query(
    msg: &mut DynamicMessage,
    entries: &[(String, String)],
    filter: &PathFilter,
    opts: &QueryOptions,
) -> Result<(), QueryError> {
    for (key, value) in entries {
        if filter.covers(key) {
            continue;
        }
        let resolved = match fieldpath::resolve_path(&msg.descriptor(), key) {
            Ok(resolved) => resolved,
            Err(FieldPathError::NotFound { .. } | FieldPathError::Empty) if !opts.strict => {
                tracing::debug!("ignoring unknown query parameter '{key}'");
                continue;
            }
            Err(FieldPathError::NotFound { .. } | FieldPathError::Empty) => {
                return Err(QueryError::UnknownParameter(key.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        let separator = opts.separator.as_char();
        let pieces: Vec<&str> = if resolved.leaf().is_list() && value.contains(separator) {
            value.split(separator).collect()
        } else {
            vec![value.as_str()]
        };
        fieldpath::set_field_by_path(msg, key, &pieces)?;
    }
    Ok(())
}

/// Parses a raw query string into ordered key/value entries.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DynamicMessage {
        DynamicMessage::new(echo_service::echo_request())
    }

    fn entries(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_scalars_by_alias_or_name() {
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("int64_value", "4294967296"), ("boolValue", "true")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap();
        let fd = msg.descriptor().get_field_by_name("int64_value").unwrap();
        assert_eq!(msg.get_field(&fd).as_i64(), Some(4294967296));
        let fd = msg.descriptor().get_field_by_name("bool_value").unwrap();
        assert_eq!(msg.get_field(&fd).as_bool(), Some(true));
    }

    #[test]
    fn filtered_prefixes_are_skipped() {
        let mut msg = request();
        let mut filter = PathFilter::new();
        filter.insert("nested");
        decode_query(
            &mut msg,
            &entries(&[("nested.name", "skipped"), ("id", "kept")]),
            &filter,
            &QueryOptions::default(),
        )
        .unwrap();
        let nested_fd = msg.descriptor().get_field_by_name("nested").unwrap();
        assert!(!msg.has_field(&nested_fd));
        let id_fd = msg.descriptor().get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&id_fd).as_str(), Some("kept"));
    }

    #[test]
    fn unknown_keys_ignored_by_default_rejected_in_strict_mode() {
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("no_such_field", "x")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap();

        let err = decode_query(
            &mut msg,
            &entries(&[("no_such_field", "x")]),
            &PathFilter::new(),
            &QueryOptions {
                strict: true,
                ..QueryOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::UnknownParameter(_)));
    }

    #[test]
    fn repeated_keys_append_in_entry_order() {
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("tags", "a"), ("tags", "b")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap();
        let fd = msg.descriptor().get_field_by_name("tags").unwrap();
        let tags: Vec<_> = msg
            .get_field(&fd)
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn packed_values_split_on_separator() {
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("tags", "a,b,c")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap();
        let fd = msg.descriptor().get_field_by_name("tags").unwrap();
        assert_eq!(msg.get_field(&fd).as_list().unwrap().len(), 3);

        // Pipe separator leaves commas alone.
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("tags", "a,b|c")]),
            &PathFilter::new(),
            &QueryOptions {
                separator: Separator::Pipe,
                ..QueryOptions::default()
            },
        )
        .unwrap();
        let fd = msg.descriptor().get_field_by_name("tags").unwrap();
        let values: Vec<_> = msg
            .get_field(&fd)
            .as_list()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["a,b", "c"]);
    }

    #[test]
    fn separator_does_not_split_singular_fields() {
        let mut msg = request();
        decode_query(
            &mut msg,
            &entries(&[("id", "a,b")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap();
        let fd = msg.descriptor().get_field_by_name("id").unwrap();
        assert_eq!(msg.get_field(&fd).as_str(), Some("a,b"));
    }

    #[test]
    fn coercion_failures_bubble_up() {
        let mut msg = request();
        let err = decode_query(
            &mut msg,
            &entries(&[("int32_value", "not-a-number")]),
            &PathFilter::new(),
            &QueryOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            QueryError::FieldPath(FieldPathError::Coercion { .. })
        ));
    }

    #[test]
    fn filter_prefix_semantics() {
        let mut filter = PathFilter::new();
        filter.insert("a.b");
        assert!(filter.covers("a.b"));
        assert!(filter.covers("a.b.c"));
        assert!(!filter.covers("a"));
        assert!(!filter.covers("a.c"));
        assert!(!filter.covers("ab"));
    }

    #[test]
    fn parse_query_preserves_order_and_decodes() {
        let entries = parse_query("b=2&a=1&a=%20x");
        assert_eq!(
            entries,
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), " x".to_string()),
            ]
        );
    }
}
