use foldhash::fast::RandomState;
use tokio::sync::oneshot;

use crate::{Error, ErrorKind, InvocationId, Receiver, Result, RpcReply};

/// Outstanding requests, keyed by invocation id.
///
/// A caller allocates a slot before sending its request; the consumer of the
/// reply queue posts the matching reply into it. Connection loss fails every
/// slot at once.
#[derive(Default)]
pub struct Waiter {
    id_map: dashmap::DashMap<InvocationId, oneshot::Sender<Result<RpcReply>>, RandomState>,
}

/// RAII guard removing a slot whose caller gave up (timeout, cancellation).
pub struct WaiterCleaner<'a> {
    waiter: &'a Waiter,
    id: InvocationId,
}

impl Drop for WaiterCleaner<'_> {
    fn drop(&mut self) {
        self.waiter.remove(self.id);
    }
}

impl Waiter {
    /// Registers `id` as awaiting a reply.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the id is already outstanding.
    pub fn alloc(&self, id: InvocationId) -> Result<Receiver<'_>> {
        let (tx, rx) = oneshot::channel();
        match self.id_map.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("invocation id {id} is already in use"),
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        Ok(Receiver::new(rx, WaiterCleaner { waiter: self, id }))
    }

    /// Hands a reply (or a failure) to whoever waits on `id`.
    pub fn post(&self, id: InvocationId, result: Result<RpcReply>) {
        if let Some((_, tx)) = self.id_map.remove(&id) {
            let _ = tx.send(result);
        } else {
            tracing::warn!(
                "RPC reply arrived to unknown RPC ID {id}, the caller may have timed out"
            );
        }
    }

    /// Posts a reply received from the wire, refusing oversized bodies.
    pub(crate) fn post_reply(&self, reply: RpcReply, max_message_size: usize) {
        let id = reply.id;
        if reply.body.len() > max_message_size {
            self.post(
                id,
                Err(Error::new(
                    ErrorKind::MessageTooLarge,
                    format!(
                        "reply of {} bytes exceeds the limit of {max_message_size}",
                        reply.body.len()
                    ),
                )),
            );
        } else {
            self.post(id, Ok(reply));
        }
    }

    /// Fails every outstanding request with `error`.
    pub fn fail_all(&self, error: &Error) {
        let ids: Vec<InvocationId> = self.id_map.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.id_map.remove(&id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Whether a reply for `id` is still awaited.
    #[must_use]
    pub fn contains(&self, id: InvocationId) -> bool {
        self.id_map.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.id_map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_map.is_empty()
    }

    fn remove(&self, id: InvocationId) {
        self.id_map.remove(&id);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("outstanding", &self.id_map.len())
            .finish()
    }
}
