use serde::Serialize;

/// One page of a cursor-paginated listing.
///
/// `next_start` is the cursor to pass as `start_after` for the following page,
/// or `None` once the listing is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Page<T, C> {
    pub items: Vec<T>,
    pub next_start: Option<C>,
}

impl<T, C> Page<T, C> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_start: None,
        }
    }

    /// Build a page from up to `limit + 1` fetched rows.
    ///
    /// The extra row only signals that more data exists; it is dropped and the
    /// last kept row's cursor becomes `next_start`.
    pub fn from_overfetch(mut rows: Vec<T>, limit: usize, cursor: impl Fn(&T) -> C) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_start = if has_more { rows.last().map(&cursor) } else { None };
        Self {
            items: rows,
            next_start,
        }
    }
}
