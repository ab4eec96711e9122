//! Compare-on-resolve tracking for superseded requests
//!
//! Requests cannot be cancelled once issued. Instead each request takes a
//! ticket, and its result is only accepted if no newer request has started
//! in the meantime.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CurrentRequest {
    generation: Arc<AtomicU64>,
}

#[derive(Debug)]
pub struct RequestTicket {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl RequestTicket {
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

impl CurrentRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, superseding any earlier one
    pub fn begin(&self) -> RequestTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RequestTicket {
            generation,
            current: self.generation.clone(),
        }
    }

    /// Await `request`; `None` if a newer request began before it resolved
    pub async fn resolve<T, F>(&self, request: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let ticket = self.begin();
        let value = request.await;
        if ticket.is_current() {
            Some(value)
        } else {
            debug!("Discarding stale result of request {}", ticket.generation);
            None
        }
    }
}
