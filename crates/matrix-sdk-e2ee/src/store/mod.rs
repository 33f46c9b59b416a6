// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The Device Session Store.
//!
//! The store holds the local [`Account`], the Olm sessions we share with other
//! devices, the inbound group sessions of rooms, and the secrets that a
//! migration brings along with them.
//!
//! All writes go through [`DeviceSessionStore::save_changes()`], which applies
//! a [`Changes`] struct in one go. Operations that use the store take shared
//! access through [`DeviceSessionStore::read_access()`] while a migration takes
//! [`DeviceSessionStore::exclusive_access()`] for its whole replay.
//!
//! ```
//! # use matrix_sdk_e2ee::{olm::Account, store::DeviceSessionStore};
//! # use ruma::{device_id, user_id};
//! # let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
//! let store = DeviceSessionStore::with_account(account);
//! assert!(store.is_authoritative());
//! ```

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ruma::{OwnedDeviceId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

mod caches;

pub use caches::{GroupSessionStore, SessionStore};

use crate::{
    backups::BackupDecryptionKey,
    locks::RwLock as StdRwLock,
    olm::{Account, InboundGroupSession, Session, StaticAccountData},
};

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// The store holds the account of a different user or device.
    #[error(
        "the store holds the account of {expected_user} {expected_device}, \
         but we tried to save the account of {got_user} {got_device}"
    )]
    MismatchedAccount {
        /// The user ID of the stored account.
        expected_user: OwnedUserId,
        /// The device ID of the stored account.
        expected_device: OwnedDeviceId,
        /// The user ID of the account we tried to save.
        got_user: OwnedUserId,
        /// The device ID of the account we tried to save.
        got_device: OwnedDeviceId,
    },
}

/// Aggregated changes to be saved in the store.
///
/// This is an update for the store, all the fields are applied together by
/// [`DeviceSessionStore::save_changes()`].
#[derive(Default, Debug)]
#[allow(missing_docs)]
pub struct Changes {
    pub account: Option<Account>,
    pub private_identity: Option<CrossSigningKeyExport>,
    pub backup_version: Option<String>,
    pub backup_decryption_key: Option<BackupDecryptionKey>,
    pub sessions: Vec<Session>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub tracked_users: Vec<TrackedUser>,
    pub pending_to_device: Vec<PendingToDeviceEvent>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.private_identity.is_none()
            && self.backup_version.is_none()
            && self.backup_decryption_key.is_none()
            && self.sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.tracked_users.is_empty()
            && self.pending_to_device.is_empty()
    }
}

/// A user for which we are tracking the list of devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedUser {
    /// The user ID of the user.
    pub user_id: OwnedUserId,
    /// The outdate/dirty flag of the user, remembers if the list of devices for
    /// the user is considered to be out of date. If the list of devices is
    /// out of date, a `/keys/query` request should be sent out for this
    /// user.
    pub dirty: bool,
}

/// A to-device event that was received but not processed yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingToDeviceEvent {
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Stored versions of the backup keys.
#[derive(Default, Clone, Debug)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys.
    pub decryption_key: Option<BackupDecryptionKey>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// A struct containing private cross signing keys that can be backed up or
/// uploaded to the secret store.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CrossSigningKeyExport {
    /// The seed of the master key encoded as unpadded base64.
    pub master_key: Option<String>,
    /// The seed of the self signing key encoded as unpadded base64.
    pub self_signing_key: Option<String>,
    /// The seed of the user signing key encoded as unpadded base64.
    pub user_signing_key: Option<String>,
}

impl CrossSigningKeyExport {
    /// Does the export contain any key at all.
    pub fn is_empty(&self) -> bool {
        self.master_key.is_none()
            && self.self_signing_key.is_none()
            && self.user_signing_key.is_none()
    }
}

#[cfg(not(tarpaulin_include))]
impl Debug for CrossSigningKeyExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossSigningKeyExport")
            .field("master_key", &self.master_key.is_some())
            .field("self_signing_key", &self.self_signing_key.is_some())
            .field("user_signing_key", &self.user_signing_key.is_some())
            .finish_non_exhaustive()
    }
}

/// The in-memory Device Session Store.
///
/// The store is cheap to clone, all clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct DeviceSessionStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    static_account: StdRwLock<Option<StaticAccountData>>,
    account: Mutex<Option<Account>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    private_identity: StdRwLock<Option<CrossSigningKeyExport>>,
    backup_keys: RwLock<BackupKeys>,
    tracked_users: StdRwLock<BTreeMap<OwnedUserId, TrackedUser>>,
    pending_to_device: StdRwLock<Vec<PendingToDeviceEvent>>,
    authoritative: AtomicBool,
    access: RwLock<()>,
    save_changes_lock: Mutex<()>,
}

impl DeviceSessionStore {
    /// Create a new empty store.
    ///
    /// The store isn't authoritative until a migration into it succeeded, or
    /// until an account was provisioned directly in it with
    /// [`DeviceSessionStore::with_account()`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new authoritative store for a freshly provisioned account.
    pub fn with_account(account: Account) -> Self {
        let inner = StoreInner {
            static_account: StdRwLock::new(Some(account.static_data().clone())),
            account: Mutex::new(Some(account)),
            authoritative: AtomicBool::new(true),
            ..Default::default()
        };

        Self { inner: Arc::new(inner) }
    }

    /// Take shared access to the store.
    ///
    /// Encryption, decryption, and backups hold this while they work on the
    /// store.
    pub async fn read_access(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.access.read().await
    }

    /// Take exclusive access to the store, waiting for all the shared access
    /// holders to finish.
    pub async fn exclusive_access(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.access.write().await
    }

    /// Is this store the source of truth for the account.
    pub fn is_authoritative(&self) -> bool {
        self.inner.authoritative.load(Ordering::SeqCst)
    }

    pub(crate) fn set_authoritative(&self, authoritative: bool) {
        self.inner.authoritative.store(authoritative, Ordering::SeqCst);
    }

    /// Get the static data of the stored account, if there is one.
    pub fn static_account(&self) -> Option<StaticAccountData> {
        self.inner.static_account.read().clone()
    }

    /// Lock the stored account.
    ///
    /// Returns [`CryptoStoreError::AccountUnset`] if the store has no account.
    pub async fn account(&self) -> Result<MappedMutexGuard<'_, Account>> {
        let guard = self.inner.account.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| CryptoStoreError::AccountUnset)
    }

    /// Save the set of changes to the store.
    ///
    /// Nothing is applied if the changes don't fit the stored account.
    #[instrument(skip_all)]
    pub async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.inner.save_changes_lock.lock().await;
        let mut account_guard = self.inner.account.lock().await;

        match (account_guard.as_ref(), changes.account.as_ref()) {
            (Some(stored), Some(new))
                if stored.user_id() != new.user_id() || stored.device_id() != new.device_id() =>
            {
                return Err(CryptoStoreError::MismatchedAccount {
                    expected_user: stored.user_id().to_owned(),
                    expected_device: stored.device_id().to_owned(),
                    got_user: new.user_id().to_owned(),
                    got_device: new.device_id().to_owned(),
                });
            }
            (None, None)
                if !changes.sessions.is_empty() || !changes.inbound_group_sessions.is_empty() =>
            {
                return Err(CryptoStoreError::AccountUnset);
            }
            _ => {}
        }

        let Changes {
            account,
            private_identity,
            backup_version,
            backup_decryption_key,
            sessions,
            inbound_group_sessions,
            tracked_users,
            pending_to_device,
        } = changes;

        if let Some(account) = account {
            *self.inner.static_account.write() = Some(account.static_data().clone());
            *account_guard = Some(account);
        }

        drop(account_guard);

        let session_count = sessions.len();
        let group_session_count = inbound_group_sessions.len();

        for session in sessions {
            self.inner.sessions.add(session).await;
        }

        for session in inbound_group_sessions {
            self.inner.inbound_group_sessions.add(session);
        }

        if let Some(identity) = private_identity {
            *self.inner.private_identity.write() = Some(identity);
        }

        {
            let mut backup_keys = self.inner.backup_keys.write().await;

            if let Some(key) = backup_decryption_key {
                backup_keys.decryption_key = Some(key);
            }

            if let Some(version) = backup_version {
                backup_keys.backup_version = Some(version);
            }
        }

        self.inner
            .tracked_users
            .write()
            .extend(tracked_users.into_iter().map(|u| (u.user_id.clone(), u)));
        self.inner.pending_to_device.write().extend(pending_to_device);

        debug!(session_count, group_session_count, "Saved changes to the store");

        Ok(())
    }

    /// Get the sessions we share with the device owning the given Curve25519
    /// key.
    pub fn get_sessions(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.inner.sessions.get(sender_key)
    }

    /// Get the sessions of the given sender key, creating an empty list if we
    /// don't share any session with the device yet.
    pub(crate) fn session_entry(&self, sender_key: &str) -> Arc<Mutex<Vec<Session>>> {
        self.inner.sessions.entry(sender_key)
    }

    /// Get the number of Olm sessions in the store.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.count().await
    }

    /// Get the inbound group session with the given room and session ID.
    pub fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Option<InboundGroupSession> {
        self.inner.inbound_group_sessions.get(room_id, session_id)
    }

    /// Get all the inbound group sessions in the store.
    pub fn get_inbound_group_sessions(&self) -> Vec<InboundGroupSession> {
        self.inner.inbound_group_sessions.get_all()
    }

    /// Get the number of inbound group sessions, in total and backed up.
    pub fn inbound_group_session_counts(&self) -> RoomKeyCounts {
        let sessions = self.inner.inbound_group_sessions.get_all();
        let backed_up = sessions.iter().filter(|s| s.backed_up()).count();

        RoomKeyCounts { total: sessions.len(), backed_up }
    }

    /// Get at most `limit` inbound group sessions that aren't backed up yet.
    pub fn inbound_group_sessions_for_backup(&self, limit: usize) -> Vec<InboundGroupSession> {
        self.inner
            .inbound_group_sessions
            .get_all()
            .into_iter()
            .filter(|s| !s.backed_up())
            .take(limit)
            .collect()
    }

    /// Mark all the inbound group sessions as not backed up, used when a new
    /// backup version is created.
    pub fn reset_backup_state(&self) {
        for session in self.inner.inbound_group_sessions.get_all() {
            session.reset_backup_state();
        }
    }

    /// Get a copy of the private cross-signing keys.
    pub fn export_cross_signing_keys(&self) -> Option<CrossSigningKeyExport> {
        self.inner.private_identity.read().clone()
    }

    /// Get the backup version and backup decryption key.
    pub async fn load_backup_keys(&self) -> BackupKeys {
        self.inner.backup_keys.read().await.clone()
    }

    /// Get the users whose device lists we track.
    pub fn tracked_users(&self) -> Vec<TrackedUser> {
        self.inner.tracked_users.read().values().cloned().collect()
    }

    /// Get the to-device events that were received but not yet processed.
    pub fn pending_to_device(&self) -> Vec<PendingToDeviceEvent> {
        self.inner.pending_to_device.read().clone()
    }

    /// Does the store hold no data at all.
    pub async fn is_empty(&self) -> bool {
        let has_account = self.inner.account.lock().await.is_some();
        let session_count = self.session_count().await;
        let has_backup_keys = {
            let keys = self.inner.backup_keys.read().await;
            keys.backup_version.is_some() || keys.decryption_key.is_some()
        };

        !has_account
            && !has_backup_keys
            && session_count == 0
            && self.inner.inbound_group_sessions.count() == 0
            && self.inner.private_identity.read().is_none()
            && self.inner.tracked_users.read().is_empty()
            && self.inner.pending_to_device.read().is_empty()
    }

    /// Remove all the data from the store.
    ///
    /// A cleared store isn't authoritative.
    pub async fn clear(&self) {
        let _guard = self.inner.save_changes_lock.lock().await;

        *self.inner.account.lock().await = None;
        *self.inner.static_account.write() = None;
        self.inner.sessions.clear();
        self.inner.inbound_group_sessions.clear();
        *self.inner.private_identity.write() = None;
        *self.inner.backup_keys.write().await = BackupKeys::default();
        self.inner.tracked_users.write().clear();
        self.inner.pending_to_device.write().clear();
        self.set_authoritative(false);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id};

    use super::{Changes, CryptoStoreError, DeviceSessionStore, TrackedUser};
    use crate::olm::Account;

    #[tokio::test]
    async fn changes_are_applied_together() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account.create_group_session_pair(room_id!("!test:localhost"), false);

        let store = DeviceSessionStore::new();
        assert!(store.is_empty().await);
        assert!(!store.is_authoritative());

        let changes = Changes {
            account: Some(account),
            inbound_group_sessions: vec![inbound.clone()],
            tracked_users: vec![TrackedUser {
                user_id: user_id!("@bob:localhost").to_owned(),
                dirty: true,
            }],
            ..Default::default()
        };
        store.save_changes(changes).await.unwrap();

        assert!(!store.is_empty().await);
        assert_eq!(store.account().await.unwrap().device_id(), device_id!("ALICE"));
        assert_eq!(store.inbound_group_session_counts().total, 1);
        assert_eq!(store.tracked_users().len(), 1);

        inbound.mark_as_backed_up();
        assert_eq!(store.inbound_group_session_counts().backed_up, 1);
        assert!(store.inbound_group_sessions_for_backup(10).is_empty());

        store.reset_backup_state();
        assert_eq!(store.inbound_group_sessions_for_backup(10).len(), 1);

        store.clear().await;
        assert!(store.is_empty().await);
        assert_matches!(store.account().await, Err(CryptoStoreError::AccountUnset));
    }

    #[tokio::test]
    async fn sessions_need_an_account() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account.create_group_session_pair(room_id!("!test:localhost"), false);

        let store = DeviceSessionStore::new();
        let changes = Changes { inbound_group_sessions: vec![inbound], ..Default::default() };

        assert_matches!(store.save_changes(changes).await, Err(CryptoStoreError::AccountUnset));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn a_different_account_is_rejected() {
        let store = DeviceSessionStore::with_account(Account::with_device_id(
            user_id!("@alice:localhost"),
            device_id!("ALICE"),
        ));

        let other = Account::with_device_id(user_id!("@alice:localhost"), device_id!("OTHER"));
        let changes = Changes { account: Some(other), ..Default::default() };

        assert_matches!(
            store.save_changes(changes).await,
            Err(CryptoStoreError::MismatchedAccount { .. })
        );
        assert_eq!(store.account().await.unwrap().device_id(), device_id!("ALICE"));
    }
}
