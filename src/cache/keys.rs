//! Cache key definitions.
//!
//! Every cached value lives under a namespace tag followed by its query
//! parameters, joined with `:`. Free-form parameters (slugs) are validated so
//! they can never smuggle in a delimiter or a glob metacharacter; everything
//! else comes from closed vocabularies (integers and enum tags), which keeps
//! keys unambiguous without escaping.

use std::fmt;

use thiserror::Error;

use crate::domain::blogs::PageQuery;

/// Root of every blog-derived entry.
pub const BLOG_NAMESPACE: &str = "blog";
/// Lock keys sit outside the blog namespace so pattern deletes never touch them.
pub const LOCK_PREFIX: &str = "lock:";
const DELIMITER: char = ':';
const MAX_TEXT_PART_LEN: usize = 200;
const GLOB_METACHARACTERS: [char; 5] = ['*', '?', '[', ']', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    BlogById,
    BlogBySlug,
    BlogPage,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [
        Namespace::BlogById,
        Namespace::BlogBySlug,
        Namespace::BlogPage,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Namespace::BlogById => "blog:id",
            Namespace::BlogBySlug => "blog:slug",
            Namespace::BlogPage => "blog:page",
        }
    }

    /// Short label used in stats output.
    pub fn label(self) -> &'static str {
        match self {
            Namespace::BlogById => "id",
            Namespace::BlogBySlug => "slug",
            Namespace::BlogPage => "page",
        }
    }

    /// Glob matching every key in this namespace.
    pub fn pattern(self) -> String {
        format!("{}{DELIMITER}*", self.tag())
    }
}

/// One positional parameter of a key.
#[derive(Debug, Clone, Copy)]
pub enum KeyPart<'a> {
    Int(i64),
    Unsigned(u64),
    /// A value from a closed vocabulary, e.g. a sort direction.
    Tag(&'static str),
    /// Caller-supplied text; validated before use.
    Text(&'a str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key parameter for `{namespace}` is empty")]
    Empty { namespace: &'static str },
    #[error("key parameter for `{namespace}` exceeds {MAX_TEXT_PART_LEN} bytes")]
    TooLong { namespace: &'static str },
    #[error("key parameter for `{namespace}` contains reserved character {found:?}")]
    ReservedCharacter {
        namespace: &'static str,
        found: char,
    },
}

/// A canonical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a namespace and ordered parameters.
    pub fn build(namespace: Namespace, parts: &[KeyPart<'_>]) -> Result<Self, KeyError> {
        for part in parts {
            if let KeyPart::Text(text) = part {
                validate_text(namespace, text)?;
            }
        }
        Ok(Self(assemble(namespace, parts)))
    }

    pub fn blog_by_id(id: i64) -> Self {
        Self(assemble(Namespace::BlogById, &[KeyPart::Int(id)]))
    }

    pub fn blog_by_slug(slug: &str) -> Result<Self, KeyError> {
        Self::build(Namespace::BlogBySlug, &[KeyPart::Text(slug)])
    }

    pub fn blog_page(query: &PageQuery) -> Self {
        Self(assemble(
            Namespace::BlogPage,
            &[
                KeyPart::Tag(query.visibility.as_str()),
                KeyPart::Unsigned(u64::from(query.page)),
                KeyPart::Unsigned(u64::from(query.limit)),
                KeyPart::Tag(query.sort_by.as_str()),
                KeyPart::Tag(query.sort_order.as_str()),
            ],
        ))
    }

    /// Wrap a key that was produced elsewhere (health checks, scans).
    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the lease guarding computation of this entry.
    pub fn lock_key(&self) -> String {
        format!("{LOCK_PREFIX}{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Glob matching every blog-derived entry (but no lock).
pub fn blog_namespace_pattern() -> String {
    format!("{BLOG_NAMESPACE}{DELIMITER}*")
}

fn assemble(namespace: Namespace, parts: &[KeyPart<'_>]) -> String {
    let mut key = String::from(namespace.tag());
    for part in parts {
        key.push(DELIMITER);
        match part {
            KeyPart::Int(value) => key.push_str(&value.to_string()),
            KeyPart::Unsigned(value) => key.push_str(&value.to_string()),
            KeyPart::Tag(value) | KeyPart::Text(value) => key.push_str(value),
        }
    }
    key
}

fn validate_text(namespace: Namespace, text: &str) -> Result<(), KeyError> {
    let namespace = namespace.tag();
    if text.is_empty() {
        return Err(KeyError::Empty { namespace });
    }
    if text.len() > MAX_TEXT_PART_LEN {
        return Err(KeyError::TooLong { namespace });
    }
    if let Some(found) = text.chars().find(|c| {
        *c == DELIMITER || GLOB_METACHARACTERS.contains(c) || c.is_whitespace() || c.is_control()
    }) {
        return Err(KeyError::ReservedCharacter { namespace, found });
    }
    Ok(())
}
