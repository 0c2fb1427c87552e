/// A centralized error type for all public runtime operations.
///
/// Internal plumbing uses `anyhow::Result` and converts at the public
/// boundary. Invariant violations are not represented here: they are
/// asserted and abort the process with a diagnostic.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The caller violated the operation contract: null or stale task
    /// reference, yield from an inline task, double initialization.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A transient resource is exhausted (send slots, inbox capacity).
    /// The operation can be retried.
    #[error("resource temporarily unavailable: {0}")]
    Again(&'static str),

    /// The referenced entity does not exist (unknown segment, unknown
    /// unit, missing dependency).
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// A catch-all for any other type of unexpected error.
    #[error("runtime error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again(_))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidArgument(_), Self::InvalidArgument(_)) => true,
            (Self::Again(_), Self::Again(_)) => true,
            (Self::NotFound(_), Self::NotFound(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync);

    #[test]
    fn again_is_transient() {
        assert!(Error::Again("inbox full").is_again());
        assert!(!Error::NotFound("segment").is_again());
    }
}
