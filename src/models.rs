// Row and result types shared by the store implementations and the service
// facade, plus the small pure helpers the queries are built from.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Cache keys for stored search results are the search key behind a fixed
/// prefix, matching the host forum's cache namespace.
pub const SEARCH_RESULTS_CACHE_PREFIX: &str = "_search_results_";

/// Derive the cache key a search-result row is stored under.
pub fn search_results_cache_key(search_key: &str) -> String {
    format!("{}{}", SEARCH_RESULTS_CACHE_PREFIX, search_key)
}

/// A post row as this service reads and writes it. `anonymous_index` 0 means
/// the post is not anonymous; positive values are per-topic poster slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub post_id: i64,
    pub topic_id: i64,
    pub forum_id: i64,
    pub poster_id: i64,
    pub post_time: i64,
    pub anonymous_index: i32,
    pub is_anonymous: bool,
    pub post_postcount: bool,
}

/// A cached search-result row. `search_authors` holds space-delimited author
/// ids as written by the host's search subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub search_key: String,
    pub search_keywords: String,
    pub search_authors: String,
    pub search_time: i64,
}

/// Result of the single consistent read behind index assignment: the
/// poster's earliest existing index in the topic, if any, and one past the
/// topic's maximum assigned index.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexSnapshot {
    pub old_index: Option<i32>,
    pub next_index: Option<i32>,
}

impl IndexSnapshot {
    /// Resolve the snapshot into the index to issue. An existing slot is
    /// always reused; otherwise the candidate new index is used, with zero
    /// or missing values coerced to 1 — index 0 is reserved for "not
    /// anonymous" and must never be issued.
    pub fn resolve(&self) -> i32 {
        match self.old_index {
            Some(old) if old > 0 => old,
            _ => match self.next_index {
                Some(next) if next > 0 => next,
                _ => 1,
            },
        }
    }
}

/// Top forum by non-anonymous post count for a poster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveForum {
    pub forum_id: i64,
    pub forum_name: String,
    pub post_count: i64,
}

/// Top topic by non-anonymous post count for a poster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveTopic {
    pub topic_id: i64,
    pub topic_title: String,
    pub post_count: i64,
}

/// Anonymity columns of a single post, as fetched for the revealer.
#[derive(Debug, Clone, Copy)]
pub struct PostAnonymity {
    pub post_id: i64,
    pub poster_id: i64,
    pub anonymous_index: i32,
    pub is_anonymous: bool,
}

/// One entry of `resolve_anonymity`: the username is attached only when the
/// batch contained at least one anonymous post and the poster resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnonymityStatus {
    pub post_id: i64,
    pub poster_id: i64,
    pub is_anonymous: bool,
    pub username: Option<String>,
}

/// An opaque visibility predicate supplied by the host and appended to the
/// activity queries verbatim.
///
/// The fragment is interpolated into SQL, not bound, so it must come from
/// trusted host code (permission machinery), never from user input.
#[derive(Debug, Clone)]
pub struct VisibilityFilter {
    sql: String,
}

impl VisibilityFilter {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// A filter that lets every forum and topic through.
    pub fn all() -> Self {
        Self::new("1 = 1")
    }

    pub fn as_sql(&self) -> &str {
        &self.sql
    }
}

/// Whole-token membership test for the space-delimited `search_authors`
/// column. Tokens that do not parse as integers are skipped.
pub fn authors_contain(search_authors: &str, wanted: &HashSet<i64>) -> bool {
    search_authors
        .split_whitespace()
        .filter_map(|token| token.parse::<i64>().ok())
        .any(|id| wanted.contains(&id))
}

/// Build a contains-substring LIKE pattern for a word, escaping LIKE
/// metacharacters so the word is matched literally. Pairs with `ESCAPE '\'`
/// in the statement.
pub fn contains_like_pattern(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len() + 2);
    for ch in word.chars() {
        if ch == '\\' || ch == '%' || ch == '_' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    format!("%{}%", escaped)
}
