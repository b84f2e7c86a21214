//! Flushable TLS session caches.
//!
//! rustls' stock memory caches have no way to drop every resumable session
//! at once, which is exactly what a credential reset needs: any session
//! established under retired credentials must not be resumed. These caches
//! implement the rustls storage traits over bounded maps and add `flush`.

use crate::prelude::*;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::server::StoresServerSessions;
use rustls::NamedGroup;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 256;
const TLS13_TICKETS_PER_SERVER: usize = 8;

/// Server-side session cache with wholesale invalidation.
///
/// Bounded; the oldest entry is evicted first. `flush` drops everything,
/// forcing full handshakes for every subsequent connection.
pub struct FlushableServerSessionCache {
    capacity: usize,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    order: VecDeque<Vec<u8>>,
}

impl std::fmt::Debug for FlushableServerSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushableServerSessionCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for FlushableServerSessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FlushableServerSessionCache {
    /// Creates a cache bounded to `capacity` sessions (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Drops every cached session.
    pub fn flush(&self) {
        let mut state = lock(&self.state);
        let dropped = state.entries.len();
        state.entries.clear();
        state.order.clear();
        debug!("flushed {dropped} server sessions");
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoresServerSessions for FlushableServerSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let mut state = lock(&self.state);
        if !state.entries.contains_key(&key) {
            state.order.push_back(key.clone());
            while state.order.len() > self.capacity {
                if let Some(oldest) = state.order.pop_front() {
                    state.entries.remove(&oldest);
                }
            }
        }
        state.entries.insert(key, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        lock(&self.state).entries.get(key).cloned()
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        state.order.retain(|k| k != key);
        state.entries.remove(key)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

/// Client-side session cache with wholesale invalidation.
///
/// Stores key-exchange hints, TLS 1.2 sessions, and TLS 1.3 tickets per
/// server name, bounded by server-name count. `flush` drops everything.
pub struct FlushableClientSessionCache {
    capacity: usize,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    entries: HashMap<ServerName<'static>, ClientEntry>,
    order: VecDeque<ServerName<'static>>,
}

#[derive(Default)]
struct ClientEntry {
    kx_hint: Option<NamedGroup>,
    tls12: Option<Tls12ClientSessionValue>,
    tls13: VecDeque<Tls13ClientSessionValue>,
}

impl std::fmt::Debug for FlushableClientSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushableClientSessionCache")
            .field("capacity", &self.capacity)
            .field("server_names", &lock(&self.state).entries.len())
            .finish()
    }
}

impl Default for FlushableClientSessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FlushableClientSessionCache {
    /// Creates a cache bounded to `capacity` server names (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Drops every cached session and hint.
    pub fn flush(&self) {
        let mut state = lock(&self.state);
        let dropped = state.entries.len();
        state.entries.clear();
        state.order.clear();
        debug!("flushed client sessions for {dropped} server names");
    }

    /// Number of server names with cached state.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entry<R>(
        &self,
        server_name: ServerName<'static>,
        f: impl FnOnce(&mut ClientEntry) -> R,
    ) -> R {
        let mut state = lock(&self.state);
        if !state.entries.contains_key(&server_name) {
            state.order.push_back(server_name.clone());
            while state.order.len() > self.capacity {
                if let Some(oldest) = state.order.pop_front() {
                    state.entries.remove(&oldest);
                }
            }
        }
        f(state.entries.entry(server_name).or_default())
    }
}

impl ClientSessionStore for FlushableClientSessionCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.with_entry(server_name, |entry| entry.kx_hint = Some(group));
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        lock(&self.state)
            .entries
            .get(&server_name.to_owned())
            .and_then(|entry| entry.kx_hint)
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.with_entry(server_name, |entry| entry.tls12 = Some(value));
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        lock(&self.state)
            .entries
            .get(&server_name.to_owned())
            .and_then(|entry| entry.tls12.clone())
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'_>) {
        if let Some(entry) = lock(&self.state).entries.get_mut(&server_name.to_owned()) {
            entry.tls12 = None;
        }
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.with_entry(server_name, |entry| {
            entry.tls13.push_back(value);
            while entry.tls13.len() > TLS13_TICKETS_PER_SERVER {
                entry.tls13.pop_front();
            }
        });
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        lock(&self.state)
            .entries
            .get_mut(&server_name.to_owned())
            .and_then(|entry| entry.tls13.pop_front())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_cache_round_trips_and_flushes() {
        let cache = FlushableServerSessionCache::new(16);
        assert!(cache.can_cache());

        assert!(cache.put(b"id-1".to_vec(), b"state-1".to_vec()));
        assert_eq!(cache.get(b"id-1"), Some(b"state-1".to_vec()));
        assert_eq!(cache.len(), 1);

        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.get(b"id-1"), None);
    }

    #[test]
    fn server_cache_take_removes() {
        let cache = FlushableServerSessionCache::new(16);
        cache.put(b"id".to_vec(), b"state".to_vec());
        assert_eq!(cache.take(b"id"), Some(b"state".to_vec()));
        assert_eq!(cache.take(b"id"), None);
    }

    #[test]
    fn server_cache_evicts_oldest_at_capacity() {
        let cache = FlushableServerSessionCache::new(2);
        cache.put(b"a".to_vec(), b"1".to_vec());
        cache.put(b"b".to_vec(), b"2".to_vec());
        cache.put(b"c".to_vec(), b"3".to_vec());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.get(b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn client_cache_stores_kx_hints_per_server() {
        let cache = FlushableClientSessionCache::new(16);
        let name = ServerName::try_from("a.example").unwrap().to_owned();

        cache.set_kx_hint(name.clone(), NamedGroup::X25519);
        assert_eq!(cache.kx_hint(&name), Some(NamedGroup::X25519));

        let other = ServerName::try_from("b.example").unwrap().to_owned();
        assert_eq!(cache.kx_hint(&other), None);

        cache.flush();
        assert_eq!(cache.kx_hint(&name), None);
    }

    #[test]
    fn client_cache_evicts_oldest_server_name() {
        let cache = FlushableClientSessionCache::new(1);
        let a = ServerName::try_from("a.example").unwrap().to_owned();
        let b = ServerName::try_from("b.example").unwrap().to_owned();

        cache.set_kx_hint(a.clone(), NamedGroup::X25519);
        cache.set_kx_hint(b.clone(), NamedGroup::secp256r1);

        assert_eq!(cache.kx_hint(&a), None);
        assert_eq!(cache.kx_hint(&b), Some(NamedGroup::secp256r1));
    }
}
