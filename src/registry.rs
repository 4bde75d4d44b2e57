//! Process-wide registry of sessions, join codes and known listeners
//!
//! Three indices, each behind its own lock so lookups stay cheap: sessions by
//! id, active join codes, and the user registry that hands every principal a
//! stable display name and station frequency for the life of the process.
//! Nothing here survives a restart; that is a documented property of the
//! whole system, not an accident.
//!
//! Lock discipline: map guards are held only for the lookup or mutation
//! itself, never while a session's own mutex is taken. [Registry::forget] is
//! the one operation called while a session is locked, which is safe because
//! no path locks a session while holding a map guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::auth::Principal;
use crate::session::Session;

/// Join codes stop admitting members after one hour; the session lives on
pub const JOIN_CODE_TTL_MS: f64 = 60.0 * 60.0 * 1000.0;

/// The FM band stations are assigned from: 88.1, 88.3, .. 107.9
const FREQUENCY_SLOTS: usize = 100;

/// Everything the process remembers about a principal
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub display_name: String,

    /// Station frequency in MHz, stable per principal per process run
    pub frequency: f64,
}

/// A join code pointing at its session
struct CodeEntry {
    session_id: String,
    expires_at: f64,
}

/// Result of resolving a join code
pub enum CodeLookup {
    NotFound,
    Expired,
    Found(Arc<Mutex<Session>>),
}

/// The in-memory heart of the server: all active sessions and everyone who
/// has ever authenticated this run
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    codes: RwLock<HashMap<String, CodeEntry>>,
    users: RwLock<HashMap<String, UserProfile>>,
    frequency_counter: AtomicUsize,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            sessions: Default::default(),
            codes: Default::default(),
            users: Default::default(),
            frequency_counter: AtomicUsize::new(0),
        }
    }
}

impl Registry {
    /// Record a principal on first authentication, updating the display name
    /// on later ones. The assigned frequency never changes within a run.
    pub fn register_user(&self, user_id: &str, display_name: Option<&str>) -> UserProfile {
        let mut users = self.users.write().unwrap();
        if let Some(profile) = users.get_mut(user_id) {
            if let Some(name) = display_name {
                profile.display_name = name.to_string();
            }
            return profile.clone();
        }

        let slot = self.frequency_counter.fetch_add(1, Ordering::Relaxed) % FREQUENCY_SLOTS;
        let profile = UserProfile {
            display_name: display_name.unwrap_or(user_id).to_string(),
            // Integer math so 88.3 is exactly 88.3 and not a float artifact
            frequency: (881 + 2 * slot) as f64 / 10.0,
        };
        users.insert(user_id.to_string(), profile.clone());
        tracing::info!(
            "registered user {user_id} on frequency {frequency}",
            frequency = profile.frequency
        );
        profile
    }

    /// Look up a previously registered principal
    pub fn profile(&self, user_id: &str) -> Option<UserProfile> {
        self.users.read().unwrap().get(user_id).cloned()
    }

    /// Create a session with a fresh unguessable id and a unique 4-digit join
    /// code, owned and DJ'd by `creator`.
    pub fn create_session(&self, creator: &Principal, now_ms: f64) -> (String, String) {
        let id = uuid::Uuid::new_v4().to_string();
        let join_code = {
            let mut codes = self.codes.write().unwrap();
            let mut rng = rand::rng();
            let code = loop {
                let candidate = format!("{:04}", rng.random_range(0..10_000));
                if !codes.contains_key(&candidate) {
                    break candidate;
                }
            };
            codes.insert(
                code.clone(),
                CodeEntry {
                    session_id: id.clone(),
                    expires_at: now_ms + JOIN_CODE_TTL_MS,
                },
            );
            code
        };

        let session = Session::new(id.clone(), join_code.clone(), creator.user_id.clone(), now_ms);
        self.sessions
            .write()
            .unwrap()
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!(
            "session {id} created by {creator} with join code {join_code}",
            creator = creator.user_id
        );
        (id, join_code)
    }

    pub fn session(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// All current sessions, cloned out so callers never hold the map guard
    /// while locking a session
    pub fn sessions_snapshot(&self) -> Vec<Arc<Mutex<Session>>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Resolve a join code, honoring its TTL
    pub fn lookup_code(&self, code: &str, now_ms: f64) -> CodeLookup {
        let codes = self.codes.read().unwrap();
        let Some(entry) = codes.get(code) else {
            return CodeLookup::NotFound;
        };
        if now_ms > entry.expires_at {
            return CodeLookup::Expired;
        }
        let session_id = entry.session_id.clone();
        drop(codes);
        match self.session(&session_id) {
            Some(session) => CodeLookup::Found(session),
            None => CodeLookup::NotFound,
        }
    }

    /// Drop a session and its join code from both indices. Called from the
    /// destroy path, possibly while the session itself is locked.
    pub fn forget(&self, session_id: &str, join_code: &str) {
        self.sessions.write().unwrap().remove(session_id);
        self.codes.write().unwrap().remove(join_code);
    }
}
