//! Internal pool notifications.

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(super) struct Comms {
    /// A connection or a slot was returned.
    pub(super) returned: Notify,
    /// The pool was resumed.
    pub(super) ready: Notify,
}
