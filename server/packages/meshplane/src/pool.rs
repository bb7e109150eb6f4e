//! Live adapter clients for one streaming session.

use std::collections::HashMap;
use std::sync::Arc;

use meshplane_adapter_client::AdapterClient;
use tokio_util::sync::CancellationToken;

/// A connected client plus the token that stops its listener.
///
/// `generation` changes every time a location is (re)registered so that a
/// stale listener exit can never evict its replacement.
pub struct LiveClient {
    pub client: Arc<dyn AdapterClient>,
    pub cancel: CancellationToken,
    pub generation: u64,
}

impl LiveClient {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.client.close().await;
    }
}

/// Owned exclusively by one reconciliation loop; never shared.
#[derive(Default)]
pub struct Pool {
    clients: HashMap<String, LiveClient>,
    next_generation: u64,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.clients.contains_key(location)
    }

    pub fn get(&self, location: &str) -> Option<&LiveClient> {
        self.clients.get(location)
    }

    /// Sorted so callers and logs see a stable order.
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.clients.keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Registers `client` and returns the generation assigned to it. Any
    /// client already registered at `location` is handed back to the caller
    /// for shutdown.
    pub fn insert(
        &mut self,
        location: &str,
        client: Arc<dyn AdapterClient>,
        cancel: CancellationToken,
    ) -> (u64, Option<LiveClient>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let previous = self.clients.insert(
            location.to_string(),
            LiveClient {
                client,
                cancel,
                generation,
            },
        );
        (generation, previous)
    }

    pub fn remove(&mut self, location: &str) -> Option<LiveClient> {
        self.clients.remove(location)
    }

    /// Removes the entry only if it is still the registration identified by
    /// `generation`.
    pub fn remove_generation(&mut self, location: &str, generation: u64) -> Option<LiveClient> {
        match self.clients.get(location) {
            Some(live) if live.generation == generation => self.clients.remove(location),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<(String, LiveClient)> {
        self.clients.drain().collect()
    }
}
