use tokio::sync::oneshot;

use crate::{Error, ErrorKind, Result, RpcReply, WaiterCleaner};

/// Pending reply of one invocation.
pub struct Receiver<'a> {
    rx: oneshot::Receiver<Result<RpcReply>>,
    cleaner: WaiterCleaner<'a>,
}

impl<'a> Receiver<'a> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<RpcReply>>, cleaner: WaiterCleaner<'a>) -> Self {
        Self { rx, cleaner }
    }

    /// # Errors
    ///
    /// Returns the failure posted for this invocation, or `ConnectionLost` if
    /// the slot vanished without an answer.
    pub async fn recv(self) -> Result<RpcReply> {
        let Self { rx, cleaner } = self;
        let result = rx
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionLost, e.to_string()))
            .and_then(|result| result);
        std::mem::forget(cleaner); // the slot was consumed by the sender, nothing to clean.
        result
    }
}
