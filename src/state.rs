/// Observable state of a query entry or a mutation.
///
/// `data` follows stale-while-revalidate semantics: it only changes when an
/// attempt succeeds, so a failed or in-flight attempt keeps showing the last
/// known value next to `error` / `is_fetching`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState<T, E> {
    /// Last successful value, or the initial value if nothing succeeded yet.
    pub data: Option<T>,
    /// Error of the most recent settled attempt; cleared on success.
    pub error: Option<E>,
    /// Whether an attempt is currently in flight.
    pub is_fetching: bool,
}

impl<T, E> QueryState<T, E> {
    /// Creates an idle state holding `data`.
    #[must_use]
    pub const fn new(data: Option<T>) -> Self {
        Self {
            data,
            error: None,
            is_fetching: false,
        }
    }

    /// Returns the data if any attempt succeeded (or an initial value was given).
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns the error of the last settled attempt.
    pub const fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    /// Returns `true` while fetching with nothing to show yet.
    pub const fn is_loading(&self) -> bool {
        self.is_fetching && self.data.is_none()
    }

    /// Returns `true` if there is data and the last attempt did not fail.
    pub const fn is_success(&self) -> bool {
        self.data.is_some() && self.error.is_none()
    }

    /// Returns `true` if the last settled attempt failed.
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl<T, E> Default for QueryState<T, E> {
    fn default() -> Self {
        Self::new(None)
    }
}
