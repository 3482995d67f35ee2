use std::time::Duration;

/// Client-wide defaults for queries.
///
/// Every [`QueryOptions`](crate::query::QueryOptions) that doesn't override a
/// field picks it up from the [`QueryClient`](crate::cache::QueryClient) it is
/// bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    /// How long data is considered fresh after a fetch settles.
    ///
    /// While fresh, `refresh()` serves cached data without calling the query.
    /// Once expired, `refresh()` fetches again while still exposing the old data.
    pub cache_time: Duration,

    /// Refetch bound queries when the host reports that the app regained focus.
    pub refetch_on_focus: bool,

    /// Refetch bound queries when the host reports that connectivity came back.
    pub refetch_on_reconnect: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(5),
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }
}

impl QueryConfig {
    /// Creates a configuration with the given cache time and both refetch triggers enabled.
    #[must_use]
    pub const fn new(cache_time: Duration) -> Self {
        Self {
            cache_time,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
        }
    }

    /// Sets whether bound queries refetch when the app regains focus.
    #[must_use]
    pub const fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = enabled;
        self
    }

    /// Sets whether bound queries refetch when connectivity comes back.
    #[must_use]
    pub const fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }
}
