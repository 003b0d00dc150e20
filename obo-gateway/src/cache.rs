//! Session-scoped encrypted cache for delegation tokens.
//!
//! Cached tokens are AES-256-GCM encrypted under a per-session random key,
//! with the SHA-256 hash of the requestor's JWT as additional authenticated
//! data. A stolen ciphertext, or a rotated requestor JWT, never yields
//! usable plaintext: decryption under a different AAD fails authentication
//! and is reported as a miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aes_gcm::aead::{Aead, OsRng, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::task::{BackgroundTask, ShutdownToken};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no active cache session with id `{session_id}`")]
    NoSession { session_id: String },

    #[error("encryption failed")]
    Encrypt,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Sessions idle past this are destroyed by the sweeper.
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_entries_per_session: usize,
    pub max_total_entries: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            max_entries_per_session: 32,
            max_total_entries: 10_000,
        }
    }
}

struct CacheEntry {
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
    auth_tag: [u8; TAG_LEN],
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
    last_used: OffsetDateTime,
}

impl CacheEntry {
    fn approx_bytes(&self) -> u64 {
        (IV_LEN + TAG_LEN + self.ciphertext.len()) as u64
    }
}

/// One per active transport session. The key buffer is overwritten with
/// zeros when the session is destroyed.
#[derive(Zeroize, ZeroizeOnDrop)]
struct CacheSession {
    key: [u8; KEY_LEN],
    /// SHA-256 of the requestor JWT this session's entries are bound to.
    aad: [u8; 32],
    #[zeroize(skip)]
    jwt_subject: String,
    #[zeroize(skip)]
    last_active: OffsetDateTime,
    #[zeroize(skip)]
    entries: HashMap<String, CacheEntry>,
}

impl CacheSession {
    fn new(aad: [u8; 32], jwt_subject: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        Self {
            key,
            aad,
            jwt_subject: jwt_subject.to_owned(),
            last_active: OffsetDateTime::now_utc(),
            entries: HashMap::new(),
        }
    }

    /// Rotating the key requires dropping every entry: a single session id
    /// owns exactly one key.
    fn rekey(&mut self, aad: [u8; 32]) {
        self.entries.clear();
        self.key.zeroize();
        OsRng.fill_bytes(&mut self.key);
        self.aad = aad;
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    decryption_failures: AtomicU64,
    requestor_mismatch: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub decryption_failures: u64,
    pub requestor_mismatch: u64,
    pub active_sessions: u64,
    pub total_entries: u64,
    pub approx_bytes: u64,
}

pub struct EncryptedTokenCache {
    options: CacheOptions,
    sessions: Mutex<HashMap<String, Arc<Mutex<CacheSession>>>>,
    counters: Counters,
}

impl EncryptedTokenCache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            sessions: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Ensures a cache session exists for `session_id`, bound to
    /// `subject_token`.
    ///
    /// An existing session whose subject differs is treated as a spoofing
    /// attempt: it is cleared and reinitialised, and the mismatch counted.
    /// The legitimate owner loses cached entries (a minor, bounded DoS) but
    /// the AAD binding keeps the previous plaintext unreachable either way.
    pub fn activate_session(&self, session_id: &str, subject_token: &str, jwt_subject: &str) {
        let aad = token_hash(subject_token);
        let mut sessions = self.sessions.lock();

        match sessions.get(session_id) {
            Some(session) => {
                let mut session = session.lock();
                if session.jwt_subject != jwt_subject {
                    warn!(session.id = session_id, "Cache session requestor mismatch");
                    self.counters.requestor_mismatch.fetch_add(1, Ordering::Relaxed);
                    session.rekey(aad);
                    session.jwt_subject = jwt_subject.to_owned();
                }
                session.last_active = OffsetDateTime::now_utc();
            }
            None => {
                sessions.insert(
                    session_id.to_owned(),
                    Arc::new(Mutex::new(CacheSession::new(aad, jwt_subject))),
                );
            }
        }
    }

    /// Returns the decrypted token, or `None` on any miss: absent or expired
    /// entry, AAD mismatch, or GCM authentication failure.
    pub fn get(&self, session_id: &str, cache_key: &str, subject_token: &str) -> Option<Zeroizing<String>> {
        let Some(session) = self.session(session_id) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut session = session.lock();

        if session.aad != token_hash(subject_token) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.decryption_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = OffsetDateTime::now_utc();

        let expired = match session.entries.get(cache_key) {
            Some(entry) => entry.expires_at <= now,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            session.entries.remove(cache_key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let key = session.key;
        let aad = session.aad;

        let plaintext = {
            let entry = session.entries.get(cache_key).expect("entry presence checked above");
            decrypt(&key, &aad, entry)
        };

        let Some(plaintext) = plaintext else {
            session.entries.remove(cache_key);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.decryption_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if let Some(entry) = session.entries.get_mut(cache_key) {
            entry.last_used = now;
        }
        session.last_active = now;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);

        Some(plaintext)
    }

    /// Encrypts and stores a token under `cache_key`.
    ///
    /// When the session is bound to a different requestor JWT (same subject,
    /// refreshed token), the session is rekeyed first: stale entries would
    /// never decrypt again anyway.
    pub fn set(
        &self,
        session_id: &str,
        cache_key: &str,
        plaintext: &str,
        subject_token: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), CacheError> {
        self.enforce_global_cap(session_id);

        let session = self.session(session_id).ok_or_else(|| CacheError::NoSession {
            session_id: session_id.to_owned(),
        })?;

        let mut session = session.lock();

        let aad = token_hash(subject_token);
        if session.aad != aad {
            session.rekey(aad);
        }

        if session.entries.len() >= self.options.max_entries_per_session && !session.entries.contains_key(cache_key) {
            evict_lru(&mut session.entries);
        }

        let now = OffsetDateTime::now_utc();

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new_from_slice(&session.key).expect("key is exactly 32 bytes");
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &session.aad,
                },
            )
            .map_err(|_| CacheError::Encrypt)?;

        let tag_start = sealed.len() - TAG_LEN;
        let mut auth_tag = [0u8; TAG_LEN];
        auth_tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        session.entries.insert(
            cache_key.to_owned(),
            CacheEntry {
                iv,
                ciphertext: sealed,
                auth_tag,
                expires_at,
                created_at: now,
                last_used: now,
            },
        );
        session.last_active = now;

        Ok(())
    }

    pub fn clear_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    pub fn metrics(&self) -> CacheMetrics {
        let sessions: Vec<Arc<Mutex<CacheSession>>> = self.sessions.lock().values().cloned().collect();

        let mut total_entries = 0u64;
        let mut approx_bytes = 0u64;

        for session in &sessions {
            let session = session.lock();
            total_entries += session.entries.len() as u64;
            approx_bytes += session.entries.values().map(CacheEntry::approx_bytes).sum::<u64>();
        }

        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            decryption_failures: self.counters.decryption_failures.load(Ordering::Relaxed),
            requestor_mismatch: self.counters.requestor_mismatch.load(Ordering::Relaxed),
            active_sessions: sessions.len() as u64,
            total_entries,
            approx_bytes,
        }
    }

    /// Destroys idle sessions and drops expired entries.
    pub fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let timeout = self.options.session_timeout;

        let mut sessions = self.sessions.lock();

        sessions.retain(|session_id, session| {
            let mut session = session.lock();

            session.entries.retain(|_, entry| now < entry.expires_at);

            let keep = now < session.last_active + timeout;
            if !keep {
                trace!(session.id = %session_id, "Destroying idle cache session");
            }
            keep
        });
    }

    fn session(&self, session_id: &str) -> Option<Arc<Mutex<CacheSession>>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Keeps the total entry count under the global cap by evicting the
    /// least recently used entry outside the target session.
    fn enforce_global_cap(&self, target_session_id: &str) {
        let sessions: Vec<(String, Arc<Mutex<CacheSession>>)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect();

        let mut total = 0usize;
        let mut victim: Option<(Arc<Mutex<CacheSession>>, String, OffsetDateTime)> = None;

        for (session_id, session) in &sessions {
            let session_guard = session.lock();
            total += session_guard.entries.len();

            if session_id == target_session_id {
                continue;
            }

            for (key, entry) in &session_guard.entries {
                if victim.as_ref().is_none_or(|(_, _, used)| entry.last_used < *used) {
                    victim = Some((Arc::clone(session), key.clone(), entry.last_used));
                }
            }
        }

        if total >= self.options.max_total_entries
            && let Some((session, key, _)) = victim
        {
            session.lock().entries.remove(&key);
        }
    }
}

fn token_hash(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
    if let Some(lru) = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone())
    {
        entries.remove(&lru);
    }
}

fn decrypt(key: &[u8; KEY_LEN], aad: &[u8; 32], entry: &CacheEntry) -> Option<Zeroizing<String>> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");

    let mut sealed = Vec::with_capacity(entry.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&entry.ciphertext);
    sealed.extend_from_slice(&entry.auth_tag);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&entry.iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .ok()?;

    String::from_utf8(plaintext).ok().map(Zeroizing::new)
}

/// Periodically destroys idle cache sessions.
pub struct CacheSweeperTask {
    pub cache: Arc<EncryptedTokenCache>,
}

#[async_trait]
impl BackgroundTask for CacheSweeperTask {
    type Output = anyhow::Result<()>;

    const LABEL: &'static str = "token cache sweeper";

    async fn run(self, mut stop: ShutdownToken) -> Self::Output {
        let interval = self.cache.options.sweep_interval;

        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.cache.sweep();
                }
                _ = stop.triggered() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}
