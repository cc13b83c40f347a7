//! Listener plumbing: a single `on_status` callback standing in for a
//! whole set of per-transition callbacks, delivered through a shared
//! executor so no service or network mutex is ever held while a listener
//! runs.

use crate::status::Status;

/// An observer attached to a service. Delivery is asynchronous and
/// ordered per-listener, never synchronized across listeners globally.
pub trait Listener: Send + Sync {
    fn on_status(&self, status: Status);
}

impl<F> Listener for F
where
    F: Fn(Status) + Send + Sync,
{
    fn on_status(&self, status: Status) {
        self(status)
    }
}
