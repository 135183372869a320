use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use foldhash::fast::RandomState;

use crate::{Demultiplexer, Error, InvocationId};

/// A closed reply queue waiting to be deleted and reported to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReapRequest {
    pub address: String,
    pub invocation_id: InvocationId,
}

/// Demultiplexers of one connection, by reply-queue address.
///
/// The weak index lets decoding find a demultiplexer without keeping it
/// alive. The keep-alive set pins the ones that have subscribers; entries are
/// added and removed under the demultiplexer's own lock.
#[derive(Default)]
pub struct StreamRegistry {
    weak: DashMap<String, Weak<Demultiplexer>, RandomState>,
    keep_alive: DashMap<String, Arc<Demultiplexer>, RandomState>,
}

impl StreamRegistry {
    pub(crate) fn insert(&self, demux: &Arc<Demultiplexer>) {
        self.weak
            .insert(demux.address().to_string(), Arc::downgrade(demux));
    }

    /// # Returns
    ///
    /// The demultiplexer of the reply queue at `address`, or `None` once
    /// every stream bound to it was dropped.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<Arc<Demultiplexer>> {
        self.weak.get(address).and_then(|entry| entry.upgrade())
    }

    pub(crate) fn keep_alive(&self, demux: Arc<Demultiplexer>) {
        self.keep_alive.insert(demux.address().to_string(), demux);
    }

    /// Drops the strong reference. The caller drops the returned value once
    /// it holds no lock.
    pub(crate) fn release(&self, address: &str) -> Option<Arc<Demultiplexer>> {
        self.keep_alive.remove(address).map(|(_, demux)| demux)
    }

    pub(crate) fn forget(&self, address: &str) {
        self.weak
            .remove_if(address, |_, entry| entry.strong_count() == 0);
    }

    fn live(&self) -> Vec<Arc<Demultiplexer>> {
        self.weak
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Prunes dead entries and closes queues left unsubscribed for longer
    /// than `idle_timeout`. Returns how many were closed.
    pub(crate) fn sweep(&self, idle_timeout: Duration) -> usize {
        self.weak.retain(|_, entry| entry.strong_count() > 0);
        let live = self.live();
        live.iter()
            .filter(|demux| demux.close_if_idle(idle_timeout))
            .count()
    }

    /// Terminates every live stream with `error`.
    pub(crate) fn fail_all(&self, error: &Error) {
        let live = self.live();
        for demux in &live {
            demux.fail(error);
        }
    }

    /// Reply queues still open or awaiting collection.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.weak
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Reply queues pinned by at least one subscription.
    #[must_use]
    pub fn keep_alive_count(&self) -> usize {
        self.keep_alive.len()
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("live", &self.live_count())
            .field("keep_alive", &self.keep_alive_count())
            .finish()
    }
}
