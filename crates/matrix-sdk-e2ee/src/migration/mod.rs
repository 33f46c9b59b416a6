// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! Migration of the cryptographic state of a legacy store into a
//! [`DeviceSessionStore`].
//!
//! A migration goes through the states of [`MigrationState`] in order, it
//! never goes back. The legacy store is only read until the new store holds
//! the complete replay, after that the legacy store gives up its authority
//! and its Olm sessions are deleted. Group sessions and the rest of the legacy
//! data stay where they are.
//!
//! A failed migration leaves the legacy store authoritative and the new store
//! empty, so it can be retried from scratch.
//!
//! ```no_run
//! # use matrix_sdk_e2ee::{
//! #     migration::{MemoryLegacyStore, MigrationOrchestrator},
//! #     store::DeviceSessionStore,
//! # };
//! # async fn example(legacy: MemoryLegacyStore) -> anyhow::Result<()> {
//! let target = DeviceSessionStore::new();
//! let mut migration = MigrationOrchestrator::new(legacy, target.clone());
//!
//! let report = migration
//!     .run(&|processed: usize, total: usize| println!("{processed}/{total}"))
//!     .await?;
//!
//! println!("Migrated {} Olm sessions", report.counts.olm_sessions);
//! assert!(target.is_authoritative());
//! # Ok(())
//! # }
//! ```

mod legacy;
mod replay;
mod snapshot;

pub use legacy::{
    LegacyAccount, LegacyCryptoStore, LegacyInboundGroupSession, LegacyOlmSession,
    LegacyStoreError, MemoryLegacyStore,
};
use serde::{Deserialize, Serialize};
pub use snapshot::MigrationSnapshot;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use self::replay::Replay;
use crate::{
    backups::DecodeError,
    progress::ProgressListener,
    store::{CryptoStoreError, DeviceSessionStore},
};

/// The states of a migration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// The migration wasn't started yet.
    NotStarted,
    /// The legacy store is being read.
    Extracting,
    /// The extracted snapshot is being checked.
    Validating,
    /// The snapshot is being staged for the new store.
    Replaying,
    /// The staged changes are committed and the legacy store gives up its
    /// authority.
    Finalizing,
    /// The new store is authoritative.
    Succeeded,
    /// The migration failed, the legacy store is still authoritative.
    Failed,
}

impl MigrationState {
    /// Is this a terminal state.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Error type for a failed migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The legacy store was never initialized, there's nothing to migrate.
    #[error("the legacy store is empty")]
    EmptyStore,

    /// The legacy store doesn't contain a complete identity.
    #[error("the legacy store doesn't contain a user ID, a device ID, and an account")]
    MissingIdentity,

    /// The legacy store was already migrated.
    #[error("the legacy store was already migrated")]
    AlreadyMigrated,

    /// The new store already contains data.
    #[error("the target store isn't empty")]
    TargetNotEmpty,

    /// The legacy store returned an error.
    #[error(transparent)]
    Legacy(#[from] LegacyStoreError),

    /// The new store returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// A pickle of the legacy store couldn't be decrypted.
    #[error("a pickle of the legacy store couldn't be restored: {0}")]
    Unpickling(#[from] vodozemac::PickleError),

    /// A Curve25519 key of the legacy store is invalid.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// A private cross-signing key isn't a valid Ed25519 seed.
    #[error("the private {0} key isn't a valid Ed25519 key")]
    InvalidCrossSigningKey(&'static str),

    /// The recovery key of the backup is invalid.
    #[error(transparent)]
    InvalidRecoveryKey(#[from] DecodeError),
}

fn default_true() -> bool {
    true
}

/// Settings for a migration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Should the inbound group sessions be migrated.
    ///
    /// Off by default, group sessions stay in the legacy store.
    #[serde(default)]
    pub migrate_megolm_sessions: bool,

    /// Should the legacy Olm sessions be deleted after a successful
    /// migration.
    #[serde(default = "default_true")]
    pub delete_legacy_olm_sessions: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { migrate_megolm_sessions: false, delete_legacy_olm_sessions: true }
    }
}

/// The number of records a migration moved to the new store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationCounts {
    /// Was the account migrated.
    pub account: bool,
    /// The number of Olm sessions.
    pub olm_sessions: usize,
    /// The number of inbound group sessions.
    pub inbound_group_sessions: usize,
    /// The number of inbound group sessions that were skipped because the
    /// legacy record was incomplete.
    pub skipped_inbound_group_sessions: usize,
    /// The number of private cross-signing keys.
    pub cross_signing_keys: usize,
    /// Was the backup key migrated.
    pub backup_key: bool,
    /// The number of tracked users.
    pub tracked_users: usize,
    /// The number of pending to-device events.
    pub pending_to_device: usize,
}

/// The outcome of a successful migration.
#[derive(Clone, Debug)]
pub struct MigrationReport {
    /// The final state, always [`MigrationState::Succeeded`].
    pub state: MigrationState,
    /// What was migrated.
    pub counts: MigrationCounts,
    /// Were the legacy Olm sessions deleted.
    ///
    /// A failed deletion doesn't fail the migration, the sessions are
    /// superseded either way.
    pub legacy_olm_sessions_deleted: bool,
}

/// Moves the cryptographic state of a legacy store into a
/// [`DeviceSessionStore`].
#[derive(Debug)]
pub struct MigrationOrchestrator<L> {
    legacy: L,
    target: DeviceSessionStore,
    config: MigrationConfig,
    state: MigrationState,
}

impl<L: LegacyCryptoStore> MigrationOrchestrator<L> {
    /// Create a new orchestrator with the default [`MigrationConfig`].
    pub fn new(legacy: L, target: DeviceSessionStore) -> Self {
        Self::with_config(legacy, target, MigrationConfig::default())
    }

    /// Create a new orchestrator with the given config.
    pub fn with_config(legacy: L, target: DeviceSessionStore, config: MigrationConfig) -> Self {
        Self { legacy, target, config, state: MigrationState::NotStarted }
    }

    /// The current state of the migration.
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// The legacy store of the migration.
    pub fn legacy_store(&self) -> &L {
        &self.legacy
    }

    /// Give back the legacy store.
    pub fn into_legacy_store(self) -> L {
        self.legacy
    }

    fn transition(&mut self, state: MigrationState, listener: &dyn ProgressListener) {
        info!(from = ?self.state, to = ?state, "Migration state changed");

        self.state = state;
        listener.on_state_changed(state);
    }

    /// Run the migration.
    ///
    /// A failed migration can be run again, a successful one can't.
    #[instrument(skip_all)]
    pub async fn run(
        &mut self,
        listener: &dyn ProgressListener,
    ) -> Result<MigrationReport, MigrationError> {
        if self.state == MigrationState::Succeeded {
            return Err(MigrationError::AlreadyMigrated);
        }

        match self.run_helper(listener).await {
            Ok(report) => {
                self.transition(MigrationState::Succeeded, listener);
                Ok(report)
            }
            Err(e) => {
                error!(error = ?e, "The migration failed, the legacy store stays in charge");
                self.transition(MigrationState::Failed, listener);
                Err(e)
            }
        }
    }

    async fn run_helper(
        &mut self,
        listener: &dyn ProgressListener,
    ) -> Result<MigrationReport, MigrationError> {
        self.transition(MigrationState::Extracting, listener);

        if self.legacy.is_migrated().await? {
            return Err(MigrationError::AlreadyMigrated);
        }

        let snapshot = MigrationSnapshot::extract(&self.legacy).await?;

        self.transition(MigrationState::Validating, listener);
        let account = snapshot.validate(self.legacy.pickle_key())?;

        self.transition(MigrationState::Replaying, listener);

        let target = self.target.clone();
        let _access = target.exclusive_access().await;

        if !target.is_empty().await {
            return Err(MigrationError::TargetNotEmpty);
        }

        let (changes, counts) =
            Replay::new(&snapshot, self.legacy.pickle_key(), &self.config, listener)
                .run(account)?;

        self.transition(MigrationState::Finalizing, listener);

        target.save_changes(changes).await?;

        if let Err(e) = self.legacy.mark_migrated().await {
            target.clear().await;
            return Err(e.into());
        }

        target.set_authoritative(true);

        let legacy_olm_sessions_deleted = if self.config.delete_legacy_olm_sessions {
            match self.legacy.delete_olm_sessions().await {
                Ok(count) => {
                    info!(count, "Deleted the legacy Olm sessions");
                    true
                }
                Err(e) => {
                    warn!(error = ?e, "Couldn't delete the legacy Olm sessions");
                    false
                }
            }
        } else {
            false
        };

        info!(?counts, "Migrated the legacy store");

        Ok(MigrationReport {
            state: MigrationState::Succeeded,
            counts,
            legacy_olm_sessions_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use ruma::{device_id, room_id, user_id, OwnedUserId};
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::{
        LegacyAccount, LegacyCryptoStore, LegacyInboundGroupSession, LegacyOlmSession,
        LegacyStoreError, MemoryLegacyStore, MigrationConfig, MigrationError,
        MigrationOrchestrator, MigrationState,
    };
    use crate::{
        backups::BackupDecryptionKey,
        identities::DeviceData,
        olm::Account,
        progress::ProgressListener,
        store::{CrossSigningKeyExport, DeviceSessionStore, PendingToDeviceEvent},
    };

    const PICKLE_KEY: [u8; 32] = [42u8; 32];

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<MigrationState>>,
        progress: Mutex<Vec<(usize, usize)>>,
    }

    impl ProgressListener for Recorder {
        fn on_progress(&self, processed: usize, total: usize) {
            self.progress.lock().unwrap().push((processed, total));
        }

        fn on_state_changed(&self, state: MigrationState) {
            self.states.lock().unwrap().push(state);
        }
    }

    /// A legacy store that refuses to give up its authority.
    #[derive(Debug)]
    struct StubbornStore(MemoryLegacyStore);

    #[async_trait]
    impl LegacyCryptoStore for StubbornStore {
        fn pickle_key(&self) -> &[u8; 32] {
            self.0.pickle_key()
        }

        async fn load_account(&self) -> Result<Option<LegacyAccount>, LegacyStoreError> {
            self.0.load_account().await
        }

        async fn load_olm_sessions(&self) -> Result<Vec<LegacyOlmSession>, LegacyStoreError> {
            self.0.load_olm_sessions().await
        }

        async fn load_inbound_group_sessions(
            &self,
        ) -> Result<Vec<LegacyInboundGroupSession>, LegacyStoreError> {
            self.0.load_inbound_group_sessions().await
        }

        async fn load_tracked_users(&self) -> Result<Vec<OwnedUserId>, LegacyStoreError> {
            self.0.load_tracked_users().await
        }

        async fn load_pending_to_device(
            &self,
        ) -> Result<Vec<PendingToDeviceEvent>, LegacyStoreError> {
            self.0.load_pending_to_device().await
        }

        async fn is_migrated(&self) -> Result<bool, LegacyStoreError> {
            self.0.is_migrated().await
        }

        async fn mark_migrated(&self) -> Result<(), LegacyStoreError> {
            Err(LegacyStoreError::Backend("the disk is full".into()))
        }

        async fn delete_olm_sessions(&self) -> Result<usize, LegacyStoreError> {
            self.0.delete_olm_sessions().await
        }
    }

    /// Fill a legacy store with one account, three Olm sessions and two group
    /// sessions.
    async fn legacy_store() -> (MemoryLegacyStore, Account) {
        let alice = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let store = MemoryLegacyStore::new(PICKLE_KEY);
        let recovery_key = BackupDecryptionKey::new();

        store.set_account(LegacyAccount {
            user_id: Some(alice.user_id().to_owned()),
            device_id: Some(alice.device_id().to_owned()),
            pickle: Some(alice.encrypted_pickle(&PICKLE_KEY)),
            shared: true,
            cross_signing_keys: CrossSigningKeyExport {
                master_key: Some(vodozemac::Ed25519SecretKey::new().to_base64()),
                ..Default::default()
            },
            backup_version: Some("1".to_owned()),
            recovery_key: Some(recovery_key.to_base58()),
        });

        for (user_id, device_id) in [
            (user_id!("@bob:localhost"), device_id!("BOB")),
            (user_id!("@carol:localhost"), device_id!("CAROL")),
            (user_id!("@dave:localhost"), device_id!("DAVE")),
        ] {
            let other = Account::with_device_id(user_id, device_id);
            let device = DeviceData::new(
                other.user_id(),
                other.device_id(),
                other.identity_keys.curve25519,
                other.identity_keys.ed25519,
            );
            let one_time_key = *other.one_time_keys().values().next().unwrap();
            let session = alice.create_outbound_session(&device, one_time_key);

            store.add_olm_session(LegacyOlmSession {
                device_key: session.sender_key.to_base64(),
                pickle: session.encrypted_pickle(&PICKLE_KEY).await,
                last_received_message_ts: 1_700_000_000_000,
            });
            store.add_tracked_user(user_id.to_owned());
        }

        for room_id in [room_id!("!first:localhost"), room_id!("!second:localhost")] {
            let (_, inbound) = alice.create_group_session_pair(room_id, false);

            store.add_inbound_group_session(LegacyInboundGroupSession {
                sender_key: Some(inbound.sender_key().to_base64()),
                room_id: Some(room_id.to_owned()),
                pickle: Some(inbound.encrypted_pickle(&PICKLE_KEY).await),
                keys_claimed: inbound.signing_keys().clone(),
                forwarding_chain: Vec::new(),
                trusted: true,
                backed_up: false,
            });
        }

        store.add_pending_to_device(PendingToDeviceEvent {
            sender: user_id!("@bob:localhost").to_owned(),
            event_type: "m.room.encrypted".to_owned(),
            content: json!({ "algorithm": "m.olm.v1.curve25519-aes-sha2" }),
        });

        (store, alice)
    }

    async fn assert_single_authority<L: LegacyCryptoStore>(
        migration: &MigrationOrchestrator<L>,
        target: &DeviceSessionStore,
    ) {
        let legacy_authoritative = !migration.legacy_store().is_migrated().await.unwrap();
        assert_ne!(legacy_authoritative, target.is_authoritative());
    }

    #[tokio::test]
    async fn full_migration() {
        let (legacy, alice) = legacy_store().await;
        let target = DeviceSessionStore::new();
        let config = MigrationConfig { migrate_megolm_sessions: true, ..Default::default() };
        let mut migration = MigrationOrchestrator::with_config(legacy, target.clone(), config);

        assert_single_authority(&migration, &target).await;

        let recorder = Recorder::default();
        let report = migration.run(&recorder).await.unwrap();

        assert_eq!(report.state, MigrationState::Succeeded);
        assert_eq!(migration.state(), MigrationState::Succeeded);
        assert!(report.counts.account);
        assert_eq!(report.counts.olm_sessions, 3);
        assert_eq!(report.counts.inbound_group_sessions, 2);
        assert_eq!(report.counts.cross_signing_keys, 1);
        assert!(report.counts.backup_key);
        assert!(report.legacy_olm_sessions_deleted);

        let account = target.static_account().expect("The account was migrated");
        assert_eq!(account.identity_keys().curve25519, alice.identity_keys().curve25519);
        assert!(target.account().await.unwrap().shared());
        assert_eq!(target.session_count().await, 3);
        assert_eq!(target.inbound_group_session_counts().total, 2);
        assert_eq!(target.tracked_users().len(), 3);
        assert_eq!(target.pending_to_device().len(), 1);
        assert!(target.export_cross_signing_keys().is_some());

        let backup_keys = target.load_backup_keys().await;
        assert_eq!(backup_keys.backup_version.as_deref(), Some("1"));
        assert!(backup_keys.decryption_key.is_some());

        assert!(migration.legacy_store().load_olm_sessions().await.unwrap().is_empty());
        assert_eq!(migration.legacy_store().load_inbound_group_sessions().await.unwrap().len(), 2);
        assert_single_authority(&migration, &target).await;

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                MigrationState::Extracting,
                MigrationState::Validating,
                MigrationState::Replaying,
                MigrationState::Finalizing,
                MigrationState::Succeeded,
            ]
        );
        assert!(recorder.progress.lock().unwrap().contains(&(3, 3)));

        assert_matches!(migration.run(&recorder).await, Err(MigrationError::AlreadyMigrated));
    }

    #[tokio::test]
    async fn group_sessions_stay_behind_by_default() {
        let (legacy, _) = legacy_store().await;
        let target = DeviceSessionStore::new();
        let mut migration = MigrationOrchestrator::new(legacy, target.clone());

        let report = migration.run(&|_: usize, _: usize| {}).await.unwrap();

        assert_eq!(report.counts.olm_sessions, 3);
        assert_eq!(report.counts.inbound_group_sessions, 0);
        assert_eq!(target.session_count().await, 3);
        assert_eq!(target.inbound_group_session_counts().total, 0);
        assert_eq!(migration.legacy_store().load_inbound_group_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn an_empty_legacy_store_fails() {
        let target = DeviceSessionStore::new();
        let mut migration =
            MigrationOrchestrator::new(MemoryLegacyStore::new(PICKLE_KEY), target.clone());

        let recorder = Recorder::default();
        assert_matches!(migration.run(&recorder).await, Err(MigrationError::EmptyStore));

        assert_eq!(migration.state(), MigrationState::Failed);
        assert_eq!(recorder.states.lock().unwrap().last(), Some(&MigrationState::Failed));
        assert!(target.is_empty().await);
        assert_single_authority(&migration, &target).await;
    }

    #[tokio::test]
    async fn a_populated_target_is_rejected() {
        let (legacy, _) = legacy_store().await;
        let target = DeviceSessionStore::with_account(Account::with_device_id(
            user_id!("@alice:localhost"),
            device_id!("OTHER"),
        ));
        let mut migration = MigrationOrchestrator::new(legacy, target.clone());

        assert_matches!(
            migration.run(&|_: usize, _: usize| {}).await,
            Err(MigrationError::TargetNotEmpty)
        );

        assert_eq!(target.account().await.unwrap().device_id(), device_id!("OTHER"));
        assert_eq!(target.session_count().await, 0);
        assert_eq!(migration.legacy_store().load_olm_sessions().await.unwrap().len(), 3);
        assert!(!migration.legacy_store().is_migrated().await.unwrap());
    }

    #[tokio::test]
    async fn the_target_is_cleared_if_the_legacy_store_keeps_its_authority() {
        let (legacy, _) = legacy_store().await;
        let target = DeviceSessionStore::new();
        let mut migration = MigrationOrchestrator::new(StubbornStore(legacy), target.clone());

        assert_matches!(
            migration.run(&|_: usize, _: usize| {}).await,
            Err(MigrationError::Legacy(LegacyStoreError::Backend(_)))
        );

        assert_eq!(migration.state(), MigrationState::Failed);
        assert!(target.is_empty().await);
        assert_eq!(migration.legacy_store().0.load_olm_sessions().await.unwrap().len(), 3);
        assert_single_authority(&migration, &target).await;

        let legacy = migration.into_legacy_store().0;
        let mut retry = MigrationOrchestrator::new(legacy, target.clone());
        retry.run(&|_: usize, _: usize| {}).await.unwrap();

        assert_eq!(target.session_count().await, 3);
        assert_single_authority(&retry, &target).await;
    }
}
