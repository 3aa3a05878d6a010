/// Lifecycle states shared by item and collection queries. Collection
/// queries never enter `Creating`, `Deleted`, or `Actualized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Initialized,
    Fetching,
    Creating,
    Updating,
    Deleting,
    Refetching,
    Prefetched,
    Fetched,
    Errored,
    ReErrored,
    Deleted,
    Actualized,
}

impl QueryState {
    /// True while an asynchronous operation is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, QueryState::Fetching | QueryState::Creating | QueryState::Updating | QueryState::Deleting | QueryState::Refetching)
    }
}
