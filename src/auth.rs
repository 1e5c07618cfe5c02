//! Login throttling, IP bans, and credential storage.
//!
//! Both persisted stores are small YAML documents read fresh on every check,
//! so an operator can edit them on disk and the change applies without a
//! restart. There is no in-app unban: clearing a ban means editing the file.
//!
//! The failed-attempt counter is deliberately never reset by a later
//! successful login. That is the long-standing observed behavior of this
//! gate and changing it would silently loosen the security posture.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ApiError;

/// Failed logins from one IP before it is banned.
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;

/// Per-IP failure record persisted in the ban file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub banned: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BanFile {
    #[serde(default)]
    ips: BTreeMap<String, BanRecord>,
}

/// Persisted ban list. Reads hit the file every time; writes are serialized
/// behind a mutex so concurrent failures from one IP cannot lose counts.
#[derive(Clone)]
pub struct BanStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl BanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BanStore {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load(&self) -> BanFile {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Unreadable ban file, treating as empty");
                BanFile::default()
            }),
            // Missing file just means nobody has failed a login yet.
            Err(_) => BanFile::default(),
        }
    }

    fn save(&self, file: &BanFile) {
        let result = serde_yaml::to_string(file)
            .map_err(|e| e.to_string())
            .and_then(|raw| fs::write(&self.path, raw).map_err(|e| e.to_string()));
        if let Err(e) = result {
            // Best effort: a failed write must not turn a login failure
            // into a server error.
            warn!(path = %self.path.display(), error = %e, "Could not persist ban file");
        }
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.load().ips.get(ip).is_some_and(|r| r.banned)
    }

    pub fn record(&self, ip: &str) -> Option<BanRecord> {
        self.load().ips.get(ip).cloned()
    }

    /// Increment the failure counter for an IP, promoting to banned at the
    /// threshold. Returns the updated record.
    pub fn record_failure(&self, ip: &str) -> BanRecord {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = self.load();
        let record = file.ips.entry(ip.to_string()).or_default();
        record.failures += 1;
        if record.failures >= MAX_LOGIN_ATTEMPTS {
            record.banned = true;
        }
        let updated = record.clone();
        self.save(&file);
        if updated.banned {
            warn!(%ip, failures = updated.failures, "IP banned");
        } else {
            info!(%ip, failures = updated.failures, "Failed login recorded");
        }
        updated
    }
}

/// Ban enforcement with an always-exempt set.
///
/// Check order per request: exempt wins unconditionally, then the ban list,
/// then the request proceeds.
#[derive(Clone)]
pub struct AccessGate {
    store: BanStore,
    exempt: Arc<HashSet<String>>,
}

impl AccessGate {
    pub fn new(store: BanStore, safe_ips: &[String]) -> Self {
        let mut exempt: HashSet<String> = safe_ips.iter().cloned().collect();
        // Loopback is always safe so a local operator cannot lock
        // themselves out.
        exempt.insert("127.0.0.1".to_string());
        exempt.insert("::1".to_string());
        AccessGate {
            store,
            exempt: Arc::new(exempt),
        }
    }

    pub fn is_exempt(&self, ip: &str) -> bool {
        self.exempt.contains(ip)
    }

    pub fn check(&self, ip: &str) -> Result<(), ApiError> {
        if self.is_exempt(ip) {
            return Ok(());
        }
        if self.store.is_banned(ip) {
            return Err(ApiError::Banned);
        }
        Ok(())
    }

    /// Count a failed login. Exempt IPs are never counted.
    pub fn note_failure(&self, ip: &str) -> Option<BanRecord> {
        if self.is_exempt(ip) {
            info!(%ip, "Skipping failure count for exempt IP");
            return None;
        }
        Some(self.store.record_failure(ip))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: BTreeMap<String, String>,
}

/// Credential storage backed by a YAML users file.
///
/// Plaintext entries are migrated in place to Argon2id PHC hashes the first
/// time the file is read, so a hand-edited file heals itself on the next
/// login attempt. An absent or empty file disables authentication entirely.
#[derive(Clone)]
pub struct CredentialStore {
    path: PathBuf,
    migrate_lock: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CredentialStore {
            path: path.into(),
            migrate_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load(&self) -> UsersFile {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Unreadable users file, auth disabled");
                UsersFile::default()
            }),
            Err(_) => UsersFile::default(),
        }
    }

    /// Whether any users are configured. No users means auth is off.
    pub fn enabled(&self) -> bool {
        !self.load().users.is_empty()
    }

    /// Verify a username/password pair, migrating any plaintext entries to
    /// salted hashes along the way.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let _guard = self.migrate_lock.lock().unwrap();
        let mut file = self.load();
        if self.migrate_plaintext(&mut file) {
            let result = serde_yaml::to_string(&file)
                .map_err(|e| e.to_string())
                .and_then(|raw| fs::write(&self.path, raw).map_err(|e| e.to_string()));
            match result {
                Ok(()) => info!(path = %self.path.display(), "Migrated plaintext credentials to hashes"),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Could not persist migrated credentials")
                }
            }
        }

        file.users
            .get(username)
            .is_some_and(|hash| verify_password(password, hash))
    }

    fn migrate_plaintext(&self, file: &mut UsersFile) -> bool {
        let mut changed = false;
        for secret in file.users.values_mut() {
            if !is_phc_hash(secret) {
                match hash_password(secret) {
                    Ok(hash) => {
                        *secret = hash;
                        changed = true;
                    }
                    Err(e) => warn!(error = %e, "Could not hash plaintext credential"),
                }
            }
        }
        changed
    }
}

fn is_phc_hash(secret: &str) -> bool {
    secret.starts_with("$argon2")
}

/// Hash a password to a PHC-formatted Argon2id string.
pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| e.to_string())
}

/// Verify a password against a stored PHC hash. The hash carries its own
/// parameters, so a default instance verifies hashes from any settings.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_path(prefix: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "hearth-{prefix}-{}-{n}.yaml",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_five_failures_ban_an_ip() {
        let store = BanStore::new(temp_path("bans"));
        for i in 1..MAX_LOGIN_ATTEMPTS {
            let record = store.record_failure("9.9.9.9");
            assert_eq!(record.failures, i);
            assert!(!record.banned);
        }
        let record = store.record_failure("9.9.9.9");
        assert!(record.banned);
        assert!(store.is_banned("9.9.9.9"));
        assert!(!store.is_banned("1.2.3.4"));
    }

    #[test]
    fn test_gate_exempts_loopback_and_safe_ips() {
        let store = BanStore::new(temp_path("bans"));
        let gate = AccessGate::new(store, &["10.0.0.2".to_string()]);

        for _ in 0..10 {
            assert!(gate.note_failure("127.0.0.1").is_none());
            assert!(gate.note_failure("10.0.0.2").is_none());
        }
        assert!(gate.check("127.0.0.1").is_ok());
        assert!(gate.check("::1").is_ok());
        assert!(gate.check("10.0.0.2").is_ok());
    }

    #[test]
    fn test_gate_rejects_banned_ip() {
        let store = BanStore::new(temp_path("bans"));
        let gate = AccessGate::new(store, &[]);

        for _ in 0..MAX_LOGIN_ATTEMPTS {
            gate.note_failure("9.9.9.9");
        }
        assert!(matches!(gate.check("9.9.9.9"), Err(ApiError::Banned)));
        assert!(gate.check("8.8.4.4").is_ok());
    }

    #[test]
    fn test_external_file_edits_apply_without_restart() {
        let path = temp_path("bans");
        let store = BanStore::new(path.clone());
        assert!(!store.is_banned("5.5.5.5"));

        // Operator bans by hand.
        fs::write(&path, "ips:\n  5.5.5.5:\n    failures: 9\n    banned: true\n").unwrap();
        assert!(store.is_banned("5.5.5.5"));

        // Operator unbans by hand: the only way to clear a ban.
        fs::write(&path, "ips: {}\n").unwrap();
        assert!(!store.is_banned("5.5.5.5"));
    }

    #[test]
    fn test_missing_ban_file_is_empty() {
        let store = BanStore::new(temp_path("bans"));
        assert!(!store.is_banned("1.1.1.1"));
        assert!(store.record("1.1.1.1").is_none());
    }

    #[test]
    fn test_credentials_disabled_without_users() {
        let store = CredentialStore::new(temp_path("users"));
        assert!(!store.enabled());
        assert!(!store.verify("anyone", "anything"));
    }

    #[test]
    fn test_plaintext_migrates_to_hash_on_first_read() {
        let path = temp_path("users");
        fs::write(&path, "users:\n  alice: hunter2\n").unwrap();
        let store = CredentialStore::new(path.clone());

        assert!(store.verify("alice", "hunter2"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("$argon2"));
        assert!(!raw.contains("hunter2"));

        // Still verifies against the migrated hash.
        assert!(store.verify("alice", "hunter2"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "hunter2"));
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("other", &hash));
        assert!(!verify_password("s3cret", "not-a-hash"));
    }
}
