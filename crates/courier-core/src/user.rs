//! User credentials and per-user receive filtering.
//!
//! A registered user is identified by an opaque check-code: a 128-bit
//! hex token bound to the user id at registration and valid until the
//! expiry window closes or the user is invalidated. The manager sweeps
//! expired users on a ticker. Each user carries a [`UserFilter`] that
//! the subscription broker applies to inbound messages.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::broker::MessageFilter;
use crate::message::Message;

/// Default credential lifetime when a caller does not pick one.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(30 * 60);

/// Errors from credential operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserError {
    /// The presented secret does not match the current one.
    #[error("secret key does not match")]
    SecretMismatch,

    /// No user is registered under the check-code.
    #[error("no user matches the check code")]
    UnknownCheckCode,

    /// The user was invalidated or expired.
    #[error("user is disabled")]
    Disabled,

    /// The receive-list selector was neither `RL` nor `BL`.
    #[error("unknown receive list {0:?}")]
    UnknownList(String),
}

/// Whether a sender outside both lists passes the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Pass unless the sender is denied.
    #[default]
    DefaultReceive,
    /// Reject unless the sender is allowed.
    DefaultReject,
}

impl FromStr for ReceiveMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DefaultReceive" => Ok(Self::DefaultReceive),
            "DefaultReject" => Ok(Self::DefaultReject),
            _ => Err(()),
        }
    }
}

/// Which of a filter's two sets a list update addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// The allow ("RL") set.
    Allow,
    /// The deny ("BL") set.
    Deny,
}

impl FromStr for ListKind {
    type Err = UserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RL" => Ok(Self::Allow),
            "BL" => Ok(Self::Deny),
            other => Err(UserError::UnknownList(other.to_owned())),
        }
    }
}

/// Per-user allow/deny decision applied to each inbound message.
///
/// A sender passes iff it is not denied and is either explicitly
/// allowed or the mode is [`ReceiveMode::DefaultReceive`].
pub struct UserFilter {
    mode: ReceiveMode,
    allow: RwLock<HashSet<String>>,
    deny: RwLock<HashSet<String>>,
}

impl UserFilter {
    /// Create an empty filter with the given mode.
    #[must_use]
    pub fn new(mode: ReceiveMode) -> Self {
        Self {
            mode,
            allow: RwLock::new(HashSet::new()),
            deny: RwLock::new(HashSet::new()),
        }
    }

    /// Seed both sets from a registration params block: newline
    /// separated `RL:a;b;c` / `BL:a;b;c` lines. Unknown lines are
    /// ignored.
    pub fn seed(&self, params: &str) {
        for line in params.lines() {
            if let Some(ids) = line.strip_prefix("RL:") {
                extend(&mut self.allow.write().unwrap(), ids);
            } else if let Some(ids) = line.strip_prefix("BL:") {
                extend(&mut self.deny.write().unwrap(), ids);
            }
        }
    }

    /// Apply newline-separated `Add a;b` / `Del a;b` commands to one of
    /// the two sets.
    pub fn update(&self, list: ListKind, body: &str) {
        let set = match list {
            ListKind::Allow => &self.allow,
            ListKind::Deny => &self.deny,
        };
        let mut set = set.write().unwrap();

        for line in body.lines() {
            if let Some(ids) = line.strip_prefix("Add ") {
                extend(&mut set, ids);
            } else if let Some(ids) = line.strip_prefix("Del ") {
                for id in split_ids(ids) {
                    set.remove(id);
                }
            }
        }
    }

    /// Whether a message from `sender` passes this filter.
    #[must_use]
    pub fn is_received(&self, sender: &str) -> bool {
        if self.deny.read().unwrap().contains(sender) {
            return false;
        }
        if self.allow.read().unwrap().contains(sender) {
            return true;
        }
        self.mode == ReceiveMode::DefaultReceive
    }
}

impl MessageFilter for UserFilter {
    fn filter(&self, messages: Vec<Arc<Message>>) -> Vec<Arc<Message>> {
        messages
            .into_iter()
            .filter(|message| self.is_received(message.sender()))
            .collect()
    }
}

fn split_ids(ids: &str) -> impl Iterator<Item = &str> {
    ids.split(';').map(str::trim).filter(|id| !id.is_empty())
}

fn extend(set: &mut HashSet<String>, ids: &str) {
    set.extend(split_ids(ids).map(str::to_owned));
}

/// A registered user.
pub struct User {
    id: String,
    check_code: String,
    created_at: Instant,
    expire: Duration,
    disabled: AtomicBool,
    filter: Arc<UserFilter>,
}

impl User {
    /// User id the credential is bound to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The opaque bearer credential.
    #[must_use]
    pub fn check_code(&self) -> &str {
        &self.check_code
    }

    /// The user's receive filter.
    #[must_use]
    pub fn filter(&self) -> Arc<UserFilter> {
        self.filter.clone()
    }

    /// Mark the user unusable. Validation fails afterwards.
    pub fn invalidate(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    /// Whether the user was invalidated.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.expire
    }
}

/// Issues and validates check-codes, sweeps expired users.
pub struct UserManager {
    secret: RwLock<String>,
    users: Arc<DashMap<String, Arc<User>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl UserManager {
    /// Create a manager holding the shared client secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: RwLock::new(secret.into()),
            users: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Register a user and return its check-code.
    ///
    /// # Errors
    ///
    /// Fails when `secret` does not match the current secret key.
    pub fn register_user(
        &self,
        secret: &str,
        id: &str,
        expire: Duration,
        mode: ReceiveMode,
        params: &str,
    ) -> Result<String, UserError> {
        if *self.secret.read().unwrap() != secret {
            return Err(UserError::SecretMismatch);
        }

        let check_code = new_check_code(id);
        let filter = Arc::new(UserFilter::new(mode));
        filter.seed(params);

        let user = Arc::new(User {
            id: id.to_owned(),
            check_code: check_code.clone(),
            created_at: Instant::now(),
            expire,
            disabled: AtomicBool::new(false),
            filter,
        });

        debug!(user = id, "registered user");
        self.users.insert(check_code.clone(), user);
        Ok(check_code)
    }

    /// Swap the secret key after verifying the old one.
    ///
    /// # Errors
    ///
    /// Fails when `old` does not match.
    pub fn update_secret_key(&self, old: &str, new: &str) -> Result<(), UserError> {
        let mut secret = self.secret.write().unwrap();
        if *secret != old {
            return Err(UserError::SecretMismatch);
        }
        *secret = new.to_owned();
        Ok(())
    }

    /// Look up the user bound to a check-code.
    ///
    /// # Errors
    ///
    /// Fails for unknown codes and disabled users.
    pub fn validate(&self, check_code: &str) -> Result<Arc<User>, UserError> {
        let user = self
            .users
            .get(check_code)
            .map(|entry| entry.clone())
            .ok_or(UserError::UnknownCheckCode)?;

        if user.is_disabled() {
            return Err(UserError::Disabled);
        }
        Ok(user)
    }

    /// Apply an `Add`/`Del` command body to the named list of the user's
    /// filter.
    ///
    /// # Errors
    ///
    /// Fails for unknown codes, disabled users, or an unknown list name.
    pub fn update_receive_list(
        &self,
        check_code: &str,
        list: &str,
        body: &str,
    ) -> Result<(), UserError> {
        let kind = list.parse::<ListKind>()?;
        let user = self.validate(check_code)?;
        user.filter.update(kind, body);
        Ok(())
    }

    /// Start the periodic expiry sweep, replacing any previous one. The
    /// sweep task is supervised and relaunched after a fault.
    pub fn start_expire_check(&self, period: Duration) {
        let users = self.users.clone();
        let handle = tokio::spawn(async move {
            loop {
                let table = users.clone();
                let task = tokio::spawn(async move {
                    let mut ticker = interval(period);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        sweep_expired(&table);
                    }
                });
                match task.await {
                    Err(join_err) if join_err.is_panic() => {
                        warn!("user expiry sweep fault, restarting");
                        continue;
                    }
                    _ => break,
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// One expiry pass: disable and remove every user whose lifetime has
    /// elapsed.
    pub fn expire_pass(&self) {
        sweep_expired(&self.users);
    }

    /// Stop the expiry sweep.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Number of registered users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no user is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Disable and remove every user whose lifetime has elapsed.
fn sweep_expired(users: &DashMap<String, Arc<User>>) {
    let now = Instant::now();
    let expired: Vec<Arc<User>> = users
        .iter()
        .filter(|entry| entry.value().is_expired(now))
        .map(|entry| entry.value().clone())
        .collect();

    for user in expired {
        user.invalidate();
        users.remove(user.check_code());
        debug!(user = user.id(), "expired user removed");
    }
}

/// New opaque credential: md5 over the user id and the current time,
/// hex encoded.
fn new_check_code(id: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Md5::new();
    hasher.update(id.as_bytes());
    hasher.update(now.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
