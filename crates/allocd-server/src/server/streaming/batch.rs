use allocd_core::Error;

/// Outcome of one fetch: a batch of records, or the failure that ended the
/// producer.
pub type BatchResult<T> = Result<Vec<T>, Error>;

/// The client-facing paging parameters of a batched stream.
///
/// `limit` is the number of records still owed to the client; non-positive
/// means "nothing more" unless `follow` is set, in which case the stream keeps
/// polling until the underlying task terminates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub limit: i64,
    pub follow: bool,
}

impl BatchRequest {
    pub const fn new(limit: i64, follow: bool) -> Self {
        Self { limit, follow }
    }
}

/// Resolves a client limit against the number of records available.
///
/// - `limit <= 0` means "everything after `offset`".
/// - otherwise the smaller of `limit` and what is left after `offset`.
///
/// Never negative.
pub fn effective_limit(limit: i64, offset: i64, total: usize) -> i64 {
    let total = i64::try_from(total).unwrap_or(i64::MAX);
    let available = total.saturating_sub(offset.max(0)).max(0);
    if limit <= 0 {
        available
    } else {
        limit.min(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_limit_takes_everything_available() {
        assert_eq!(effective_limit(0, 0, 10), 10);
        assert_eq!(effective_limit(-3, 4, 10), 6);
    }

    #[test]
    fn positive_limit_is_capped_by_total() {
        assert_eq!(effective_limit(25, 0, 10), 10);
        assert_eq!(effective_limit(5, 0, 10), 5);
        assert_eq!(effective_limit(5, 8, 10), 2);
    }

    #[test]
    fn offset_past_total_yields_zero() {
        assert_eq!(effective_limit(5, 20, 10), 0);
        assert_eq!(effective_limit(0, 20, 10), 0);
    }
}
