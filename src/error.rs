use thiserror::Error;

use crate::coordinator::CoordinatorError;
use crate::core::identity::IdentityError;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; nothing constructs it
/// directly.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Identity(_) => Transience::Permanent,
            Error::Store(e) => e.transience(),
            Error::Coordinator(e) => e.transience(),
        }
    }

    /// True when a `require_primary` transaction found the lease gone.
    /// Callers recover by retrying as a secondary or waiting for the next
    /// primary transition.
    pub fn is_primary_lease_lost(&self) -> bool {
        matches!(self, Error::Coordinator(CoordinatorError::PrimaryLeaseLost))
    }

    /// True when a peer holds the lease without tab synchronization.
    pub fn is_primary_lease_exclusive(&self) -> bool {
        matches!(
            self,
            Error::Coordinator(CoordinatorError::PrimaryLeaseExclusive)
        )
    }
}
