//! Immutable pool of per-key clients
//!
//! Built once at startup from the configured key list and never mutated.
//! Keys that are blank or fail client construction are skipped, so a pool
//! may legitimately be empty; the dispatcher reports that as a
//! configuration error on first use.

use backend::ClientFactory;
use common::Secret;
use tracing::{error, info, warn};

/// Split a comma-delimited key list into trimmed, non-empty entries.
///
/// Duplicates are kept.
pub fn split_credentials(raw: &str) -> Vec<Secret<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_string()))
        .collect()
}

/// Ordered, fixed-size collection of clients, one per usable key.
#[derive(Debug)]
pub struct Pool<C> {
    clients: Vec<C>,
}

impl<C> Pool<C> {
    /// Build one client per credential.
    ///
    /// Entries are trimmed; blank entries and entries the factory rejects are
    /// skipped with a warning instead of failing the whole build.
    pub fn build<I, F>(credentials: I, factory: &F) -> Self
    where
        I: IntoIterator<Item = Secret<String>>,
        F: ClientFactory<Client = C>,
    {
        let mut clients = Vec::new();
        for (position, credential) in credentials.into_iter().enumerate() {
            let trimmed = credential.expose().trim();
            if trimmed.is_empty() {
                continue;
            }
            match factory.build(Secret::new(trimmed.to_string())) {
                Ok(client) => clients.push(client),
                Err(e) => {
                    warn!(position, error = %e, "skipping key that failed client construction")
                }
            }
        }

        if clients.is_empty() {
            error!("key pool is empty, every dispatch will fail until keys are configured");
        } else {
            info!(keys = clients.len(), "key pool built");
        }
        Self { clients }
    }

    /// Wrap already-constructed clients.
    pub fn from_clients(clients: Vec<C>) -> Self {
        Self { clients }
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client at `index`.
    ///
    /// Callers must stay within `[0, size)`; out-of-range indices panic.
    pub fn get(&self, index: usize) -> &C {
        &self.clients[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::BackendError;

    /// Factory producing the key text itself; keys starting with "bad" fail.
    struct EchoFactory;

    impl ClientFactory for EchoFactory {
        type Client = String;

        fn build(&self, credential: Secret<String>) -> backend::Result<String> {
            if credential.expose().starts_with("bad") {
                return Err(BackendError::new("malformed key"));
            }
            Ok(credential.expose().clone())
        }
    }

    fn secrets(keys: &[&str]) -> Vec<Secret<String>> {
        keys.iter().map(|k| Secret::new(k.to_string())).collect()
    }

    #[test]
    fn split_trims_and_drops_empty_entries() {
        let keys = split_credentials(" k1 ,, k2,   ,k3 ");
        let exposed: Vec<&str> = keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(exposed, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn split_blank_input_yields_nothing() {
        assert!(split_credentials("").is_empty());
        assert!(split_credentials(" , ,").is_empty());
    }

    #[test]
    fn split_keeps_duplicates() {
        assert_eq!(split_credentials("k,k").len(), 2);
    }

    #[test]
    fn build_preserves_order() {
        let pool = Pool::build(secrets(&["a", "b", "c"]), &EchoFactory);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.get(0), "a");
        assert_eq!(pool.get(1), "b");
        assert_eq!(pool.get(2), "c");
    }

    #[test]
    fn build_skips_failed_construction() {
        let pool = Pool::build(secrets(&["a", "bad-key", "c"]), &EchoFactory);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.get(0), "a");
        assert_eq!(pool.get(1), "c");
    }

    #[test]
    fn build_trims_and_skips_blank_entries() {
        let pool = Pool::build(secrets(&["  a  ", "   ", ""]), &EchoFactory);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.get(0), "a");
    }

    #[test]
    fn build_keeps_duplicate_keys() {
        let pool = Pool::build(secrets(&["a", "a"]), &EchoFactory);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn all_keys_failing_gives_empty_pool() {
        let pool = Pool::build(secrets(&["bad1", "bad2"]), &EchoFactory);
        assert!(pool.is_empty());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    #[should_panic]
    fn get_out_of_range_panics() {
        let pool = Pool::from_clients(vec!["a".to_string()]);
        let _ = pool.get(1);
    }
}
