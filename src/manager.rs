//! Identifier registry and client creation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    agent::{DEFAULT_MAX_SOCKETS, TunnelAgent},
    client::{Client, DEFAULT_GRACE_PERIOD},
    error::AgentError,
};

/// Tuning for clients created by a [`ClientManager`].
#[derive(Debug, Clone)]
pub struct BrokerOpts {
    /// Cap on concurrently connected tunnel sockets per client.
    pub max_tcp_sockets: usize,
    /// How long a client may stay offline before it is reaped.
    pub grace_period: Duration,
}

impl Default for BrokerOpts {
    fn default() -> Self {
        Self {
            max_tcp_sockets: DEFAULT_MAX_SOCKETS,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Record returned to the admin layer when a client is created.
///
/// `port` is the broker TCP port the remote user dials.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
}

/// Broker-wide counters for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrokerStats {
    /// Number of live tunnel clients.
    pub tunnels: usize,
}

/// Registry mapping public client identifiers to live [`Client`]s.
///
/// The map is the only cross-client state in the broker and is mutated only
/// on create and remove.
#[derive(derive_more::Debug)]
pub struct ClientManager {
    opts: BrokerOpts,
    #[debug(skip)]
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientManager {
    pub fn new(opts: BrokerOpts) -> Arc<Self> {
        Arc::new(Self {
            opts,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a new client and starts its tunnel listener.
    ///
    /// If `requested_id` is already taken, a fresh identifier is generated
    /// instead; a single regeneration is performed, with no retry loop. The
    /// client is removed again if the listener fails to bind.
    pub async fn new_client(
        self: &Arc<Self>,
        requested_id: &str,
    ) -> Result<ClientInfo, AgentError> {
        let (agent, events) = TunnelAgent::new(self.opts.max_tcp_sockets);
        let (id, client) = {
            let mut clients = self.clients.lock().expect("client registry lock poisoned");
            let id = if clients.contains_key(requested_id) {
                let generated = generate_id();
                debug!(requested = %requested_id, %generated, "identifier taken, generated a fresh one");
                generated
            } else {
                requested_id.to_string()
            };
            let client = Client::new(id.clone(), agent, events, self.opts.grace_period);
            clients.insert(id.clone(), client.clone());
            (id, client)
        };

        let manager = Arc::downgrade(self);
        let closed = client.closed();
        let watched_id = id.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(manager) = manager.upgrade() {
                manager.remove_client(&watched_id);
            }
        });

        match client.listen().await {
            Ok(port) => {
                info!(%id, port, "created tunnel client");
                Ok(ClientInfo {
                    id,
                    port,
                    max_conn_count: self.opts.max_tcp_sockets,
                })
            }
            Err(err) => {
                self.remove_client(&id);
                Err(err)
            }
        }
    }

    /// Removes and closes a client. No-op when the id is unknown.
    pub fn remove_client(&self, id: &str) {
        let client = self
            .clients
            .lock()
            .expect("client registry lock poisoned")
            .remove(id);
        if let Some(client) = client {
            debug!(%id, "removed tunnel client");
            client.close();
        }
    }

    /// True when a client is registered under `id`.
    pub fn has_client(&self, id: &str) -> bool {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .contains_key(id)
    }

    /// Looks up a client by its public identifier.
    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Broker-wide counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            tunnels: self
                .clients
                .lock()
                .expect("client registry lock poisoned")
                .len(),
        }
    }

    /// Closes every registered client, for embedding servers shutting down.
    pub fn close_all(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .expect("client registry lock poisoned")
            .drain()
            .collect();
        for (id, client) in clients {
            debug!(%id, "closing tunnel client");
            client.close();
        }
    }
}

/// Word pools for generated identifiers. URL-safe, lowercase, short.
const ADJECTIVES: &[&str] = &[
    "able", "bold", "brave", "bright", "calm", "clever", "cold", "cool", "crisp", "eager",
    "early", "fancy", "fast", "fine", "fresh", "gentle", "glad", "grand", "great", "happy",
    "honest", "keen", "kind", "large", "light", "lively", "loud", "lucky", "merry", "mild",
    "neat", "nice", "plain", "proud", "quick", "quiet", "rapid", "sharp", "shiny", "smart",
    "soft", "solid", "stout", "swift", "tall", "tidy", "vivid", "warm", "wise", "young",
];

const ANIMALS: &[&str] = &[
    "badger", "bat", "bear", "beaver", "bee", "bison", "crab", "crane", "crow", "deer",
    "dove", "duck", "eagle", "falcon", "ferret", "finch", "fox", "frog", "goat", "goose",
    "hare", "hawk", "heron", "horse", "lark", "lemur", "lion", "llama", "lynx", "mole",
    "moose", "mouse", "otter", "owl", "panda", "pony", "rabbit", "raven", "robin", "seal",
    "shrew", "sloth", "snail", "squid", "stork", "swan", "tiger", "trout", "whale", "wren",
];

/// Generates an `adjective-adjective-animal` slug.
fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let first = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let second = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let animal = ANIMALS[rng.gen_range(0..ANIMALS.len())];
    format!("{first}-{second}-{animal}")
}
