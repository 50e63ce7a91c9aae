use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{Client, ClientConfig, Result};

/// Clients keyed by site code.
///
/// Owned by the host application: create one registry at startup and pass it to whatever needs
/// a client. Asking twice for the same site returns the same client.
///
/// # Examples
/// ```no_run
/// # use flagline::{ClientConfig, ClientRegistry};
/// let registry = ClientRegistry::new();
/// let client = registry
///     .get_or_create(ClientConfig::from_site_code("site-code"))
///     .unwrap();
/// assert!(registry.get("site-code").is_some());
/// registry.close_all();
/// # drop(client);
/// ```
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<Client>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    /// Return the client of the configured site, creating it from `config` if needed. The
    /// configuration is ignored when a client already exists.
    ///
    /// # Errors
    ///
    /// Errors of [`ClientConfig::to_client`].
    pub fn get_or_create(&self, config: ClientConfig) -> Result<Arc<Client>> {
        match self.clients.entry(config.site_code.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let client = Arc::new(config.to_client()?);
                entry.insert(client.clone());
                Ok(client)
            }
        }
    }

    /// Client of `site_code`, if one was created.
    pub fn get(&self, site_code: &str) -> Option<Arc<Client>> {
        self.clients.get(site_code).map(|client| client.value().clone())
    }

    /// Remove and close the client of `site_code`. Returns `true` if a client was removed.
    pub fn remove(&self, site_code: &str) -> bool {
        let Some((_, client)) = self.clients.remove(site_code) else {
            return false;
        };
        close(&client);
        true
    }

    /// Close and remove every client.
    pub fn close_all(&self) {
        let site_codes: Vec<String> = self
            .clients
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for site_code in site_codes {
            self.remove(&site_code);
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn close(client: &Client) {
    if let Err(err) = client.close() {
        log::warn!(target: "flagline", site_code = client.site_code(); "failed to close client: {err}");
    }
}
