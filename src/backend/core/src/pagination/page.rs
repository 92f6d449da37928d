//! Page requests and page results.

use serde::{Deserialize, Serialize};

use super::cursor::Cursor;
use crate::error::Result;

/// Caller-side paging parameters.
///
/// `after` is exclusive: a page starts at the first entry strictly after it.
/// `cursor`, when present, takes precedence over `after`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl PageRequest {
    /// First page with the default size.
    pub fn first() -> Self {
        Self::default()
    }

    pub fn after(seq: u64) -> Self {
        Self {
            after: Some(seq),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Effective page size: default when unset, clamped to `1..=max`.
    pub fn effective_limit(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max.max(1))
    }

    /// Effective sequence position for `scope`.
    pub fn resolve_seq(&self, scope: &str) -> Result<u64> {
        match &self.cursor {
            Some(token) => Cursor::decode_for(token, scope)?.seq(),
            None => Ok(self.after.unwrap_or(0)),
        }
    }

    /// Effective key position for `scope`; `None` means from the start.
    pub fn resolve_key(&self, scope: &str) -> Result<Option<String>> {
        match &self.cursor {
            Some(token) => Ok(Some(Cursor::decode_for(token, scope)?.key()?.to_string())),
            None => Ok(None),
        }
    }
}

/// One page of results in ascending order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// More entries existed past this page when it was read
    pub has_more: bool,
    /// Sequence number of the last item, for `after`-style paging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<u64>,
    /// Opaque token for the next page, present when `has_more`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            next_after: None,
            next_cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Page over a sequence-ordered collection.
///
/// `entries` must be ascending by sequence number. Items at or before `after`
/// are skipped.
pub fn paginate_seq<T, I>(entries: I, scope: &str, after: u64, limit: usize) -> Result<Page<T>>
where
    I: IntoIterator<Item = (u64, T)>,
{
    let mut iter = entries.into_iter().filter(|(seq, _)| *seq > after);
    let mut items = Vec::with_capacity(limit.min(64));
    let mut last = None;

    for (seq, item) in iter.by_ref().take(limit) {
        last = Some(seq);
        items.push(item);
    }
    let has_more = iter.next().is_some();

    let next_cursor = match (has_more, last) {
        (true, Some(seq)) => Some(Cursor::new(scope, seq).encode()?),
        _ => None,
    };

    Ok(Page {
        items,
        has_more,
        next_after: last,
        next_cursor,
    })
}

/// Page over a key-ordered collection.
///
/// `entries` must be ascending by key. Items at or before `after` are skipped.
pub fn paginate_keyed<T, I>(
    entries: I,
    scope: &str,
    after: Option<&str>,
    limit: usize,
) -> Result<Page<T>>
where
    I: IntoIterator<Item = (String, T)>,
{
    let mut iter = entries
        .into_iter()
        .filter(|(key, _)| after.map_or(true, |after| key.as_str() > after));
    let mut items = Vec::with_capacity(limit.min(64));
    let mut last = None;

    for (key, item) in iter.by_ref().take(limit) {
        last = Some(key);
        items.push(item);
    }
    let has_more = iter.next().is_some();

    let next_cursor = match (has_more, last) {
        (true, Some(key)) => Some(Cursor::new(scope, key).encode()?),
        _ => None,
    };

    Ok(Page {
        items,
        has_more,
        next_after: None,
        next_cursor,
    })
}
