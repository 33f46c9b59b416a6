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

//! Turning a [`MigrationSnapshot`] into [`Changes`] for the new store.
//!
//! The replay doesn't touch any store, everything is staged in memory and
//! committed by the orchestrator in one go.

use ruma::{SecondsSinceUnixEpoch, UInt};
use tracing::{debug, info, warn};
use vodozemac::{megolm::InboundGroupSessionPickle, Curve25519PublicKey, Ed25519SecretKey};

use super::{snapshot::MigrationSnapshot, MigrationConfig, MigrationCounts, MigrationError};
use crate::{
    backups::BackupDecryptionKey,
    olm::{Account, InboundGroupSession, PickledInboundGroupSession, Session, StaticAccountData},
    progress::ProgressListener,
    store::{Changes, TrackedUser},
};

/// Convert a timestamp in milliseconds since the Unix epoch.
fn from_millis(millis: u64) -> SecondsSinceUnixEpoch {
    SecondsSinceUnixEpoch(UInt::new_saturating(millis / 1000))
}

fn check_seed(name: &'static str, seed: Option<&str>) -> Result<(), MigrationError> {
    if let Some(seed) = seed {
        Ed25519SecretKey::from_base64(seed)
            .map_err(|_| MigrationError::InvalidCrossSigningKey(name))?;
    }

    Ok(())
}

pub(super) struct Replay<'a> {
    snapshot: &'a MigrationSnapshot,
    pickle_key: &'a [u8; 32],
    config: &'a MigrationConfig,
    listener: &'a dyn ProgressListener,
    counts: MigrationCounts,
}

impl<'a> Replay<'a> {
    pub(super) fn new(
        snapshot: &'a MigrationSnapshot,
        pickle_key: &'a [u8; 32],
        config: &'a MigrationConfig,
        listener: &'a dyn ProgressListener,
    ) -> Self {
        Self { snapshot, pickle_key, config, listener, counts: MigrationCounts::default() }
    }

    /// Stage all the categories of the snapshot.
    ///
    /// The identity goes first, followed by the Olm sessions, the inbound
    /// group sessions, the cross-signing keys, and the backup state. Any error
    /// aborts the whole replay.
    pub(super) fn run(
        mut self,
        account: Account,
    ) -> Result<(Changes, MigrationCounts), MigrationError> {
        let mut changes = Changes::default();
        let static_account = account.static_data().clone();

        changes.account = Some(account);
        self.counts.account = true;
        self.listener.on_progress(1, 1);

        self.stage_sessions(static_account, &mut changes)?;
        self.stage_inbound_group_sessions(&mut changes)?;
        self.stage_cross_signing_keys(&mut changes)?;
        self.stage_backup(&mut changes)?;
        self.stage_inbox(&mut changes);

        debug!(counts = ?self.counts, "Staged the legacy store");

        Ok((changes, self.counts))
    }

    fn stage_sessions(
        &mut self,
        static_account: StaticAccountData,
        changes: &mut Changes,
    ) -> Result<(), MigrationError> {
        let total = self.snapshot.olm_sessions.len();
        self.listener.on_progress(0, total);

        for (i, record) in self.snapshot.olm_sessions.iter().enumerate() {
            let sender_key = Curve25519PublicKey::from_base64(&record.device_key)?;
            let session = Session::from_encrypted_pickle(
                static_account.clone(),
                sender_key,
                &record.pickle,
                self.pickle_key,
                from_millis(record.last_received_message_ts),
            )?;

            changes.sessions.push(session);
            self.listener.on_progress(i + 1, total);
        }

        self.counts.olm_sessions = total;

        Ok(())
    }

    fn stage_inbound_group_sessions(
        &mut self,
        changes: &mut Changes,
    ) -> Result<(), MigrationError> {
        if !self.config.migrate_megolm_sessions {
            info!(
                count = self.snapshot.inbound_group_sessions.len(),
                "Group session migration is disabled, leaving the group sessions behind"
            );
            self.listener.on_progress(0, 0);

            return Ok(());
        }

        let total = self.snapshot.inbound_group_sessions.len();
        self.listener.on_progress(0, total);

        for (i, record) in self.snapshot.inbound_group_sessions.iter().enumerate() {
            let (Some(sender_key), Some(room_id), Some(pickle)) =
                (&record.sender_key, &record.room_id, &record.pickle)
            else {
                warn!(
                    room_id = ?record.room_id,
                    sender_key = ?record.sender_key,
                    "Skipping a group session with missing data"
                );

                self.counts.skipped_inbound_group_sessions += 1;
                self.listener.on_progress(i + 1, total);

                continue;
            };

            let pickle = PickledInboundGroupSession {
                pickle: InboundGroupSessionPickle::from_encrypted(pickle, self.pickle_key)?,
                sender_key: Curve25519PublicKey::from_base64(sender_key)?,
                signing_key: record.keys_claimed.clone(),
                forwarding_curve25519_key_chain: record.forwarding_chain.clone(),
                room_id: room_id.clone(),
                imported: !record.trusted,
                backed_up: record.backed_up,
                shared_history: false,
                untrusted: !record.trusted,
            };

            changes.inbound_group_sessions.push(InboundGroupSession::from_pickle(pickle));
            self.counts.inbound_group_sessions += 1;
            self.listener.on_progress(i + 1, total);
        }

        Ok(())
    }

    fn stage_cross_signing_keys(&mut self, changes: &mut Changes) -> Result<(), MigrationError> {
        let keys = &self.snapshot.account.cross_signing_keys;

        check_seed("master", keys.master_key.as_deref())?;
        check_seed("self-signing", keys.self_signing_key.as_deref())?;
        check_seed("user-signing", keys.user_signing_key.as_deref())?;

        let count = [&keys.master_key, &keys.self_signing_key, &keys.user_signing_key]
            .into_iter()
            .filter(|k| k.is_some())
            .count();

        if !keys.is_empty() {
            changes.private_identity = Some(keys.clone());
        }

        self.counts.cross_signing_keys = count;
        self.listener.on_progress(count, count);

        Ok(())
    }

    fn stage_backup(&mut self, changes: &mut Changes) -> Result<(), MigrationError> {
        let account = &self.snapshot.account;

        if let Some(recovery_key) = &account.recovery_key {
            changes.backup_decryption_key = Some(BackupDecryptionKey::from_base58(recovery_key)?);
            self.counts.backup_key = true;
        }

        changes.backup_version = account.backup_version.clone();

        let total = usize::from(account.recovery_key.is_some());
        self.listener.on_progress(total, total);

        Ok(())
    }

    fn stage_inbox(&mut self, changes: &mut Changes) {
        changes.tracked_users = self
            .snapshot
            .tracked_users
            .iter()
            .map(|user_id| TrackedUser { user_id: user_id.clone(), dirty: true })
            .collect();
        changes.pending_to_device = self.snapshot.pending_to_device.clone();

        self.counts.tracked_users = changes.tracked_users.len();
        self.counts.pending_to_device = changes.pending_to_device.len();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches2::assert_matches;
    use ruma::{device_id, room_id, user_id, UInt};

    use super::{from_millis, Replay};
    use crate::{
        migration::{
            legacy::{LegacyAccount, LegacyInboundGroupSession},
            snapshot::MigrationSnapshot,
            MigrationConfig, MigrationError,
        },
        olm::Account,
        store::CrossSigningKeyExport,
    };

    const PICKLE_KEY: [u8; 32] = [1u8; 32];

    fn snapshot(account: &Account) -> MigrationSnapshot {
        MigrationSnapshot {
            account: LegacyAccount {
                user_id: Some(account.user_id().to_owned()),
                device_id: Some(account.device_id().to_owned()),
                pickle: Some(account.encrypted_pickle(&PICKLE_KEY)),
                ..Default::default()
            },
            olm_sessions: Vec::new(),
            inbound_group_sessions: Vec::new(),
            tracked_users: vec![user_id!("@bob:localhost").to_owned()],
            pending_to_device: Vec::new(),
        }
    }

    #[test]
    fn timestamps_are_truncated_to_seconds() {
        assert_eq!(from_millis(1_700_000_000_999).0, UInt::from(1_700_000_000u32));
    }

    #[tokio::test]
    async fn group_sessions_with_missing_data_are_skipped() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));
        let (_, inbound) = account.create_group_session_pair(room_id!("!test:localhost"), false);

        let mut snapshot = snapshot(&account);
        snapshot.inbound_group_sessions = vec![
            LegacyInboundGroupSession {
                sender_key: Some(inbound.sender_key().to_base64()),
                room_id: Some(inbound.room_id().to_owned()),
                pickle: Some(inbound.encrypted_pickle(&PICKLE_KEY).await),
                keys_claimed: inbound.signing_keys().clone(),
                trusted: false,
                ..Default::default()
            },
            LegacyInboundGroupSession {
                room_id: Some(inbound.room_id().to_owned()),
                ..Default::default()
            },
        ];

        let progress = Mutex::new(Vec::new());
        let listener = |processed: usize, total: usize| {
            progress.lock().unwrap().push((processed, total));
        };

        let config = MigrationConfig { migrate_megolm_sessions: true, ..Default::default() };
        let restored = snapshot.validate(&PICKLE_KEY).unwrap();
        let (changes, counts) =
            Replay::new(&snapshot, &PICKLE_KEY, &config, &listener).run(restored).unwrap();

        assert_eq!(counts.inbound_group_sessions, 1);
        assert_eq!(counts.skipped_inbound_group_sessions, 1);
        assert_eq!(changes.inbound_group_sessions[0].session_id(), inbound.session_id());
        assert!(changes.inbound_group_sessions[0].has_been_imported());
        assert!(changes.inbound_group_sessions[0].is_untrusted());
        assert_eq!(changes.tracked_users.len(), 1);
        assert!(changes.tracked_users[0].dirty);

        let progress = progress.into_inner().unwrap();
        assert!(progress.contains(&(2, 2)));
        assert!(progress.contains(&(0, 0)));
    }

    #[test]
    fn invalid_cross_signing_keys_abort_the_replay() {
        let account = Account::with_device_id(user_id!("@alice:localhost"), device_id!("ALICE"));

        let mut snapshot = snapshot(&account);
        snapshot.account.cross_signing_keys = CrossSigningKeyExport {
            master_key: Some("not a key".to_owned()),
            ..Default::default()
        };

        let listener = |_: usize, _: usize| {};
        let config = MigrationConfig::default();
        let restored = snapshot.validate(&PICKLE_KEY).unwrap();

        assert_matches!(
            Replay::new(&snapshot, &PICKLE_KEY, &config, &listener).run(restored),
            Err(MigrationError::InvalidCrossSigningKey("master"))
        );
    }
}
