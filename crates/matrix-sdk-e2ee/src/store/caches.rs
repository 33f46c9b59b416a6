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

//! Collection of small in-memory stores that hold the live Olm objects.
//!
//! Readers never block each other. Writers to the sessions of one remote
//! device are serialized by the per sender key mutex.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use ruma::{OwnedRoomId, RoomId};
use tokio::sync::Mutex;

use crate::{
    locks::RwLock as StdRwLock,
    olm::{InboundGroupSession, Session},
};

/// In-memory store for Olm Sessions.
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    #[allow(clippy::type_complexity)]
    entries: Arc<StdRwLock<BTreeMap<String, Arc<Mutex<Vec<Session>>>>>>,
}

impl SessionStore {
    /// Create a new empty Session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the list of sessions of the given sender key, creating an empty one
    /// if needed.
    ///
    /// Holding the returned mutex serializes all writers for the remote
    /// device.
    pub fn entry(&self, sender_key: &str) -> Arc<Mutex<Vec<Session>>> {
        if let Some(sessions) = self.entries.read().get(sender_key) {
            return sessions.clone();
        }

        self.entries.write().entry(sender_key.to_owned()).or_default().clone()
    }

    /// Add a session to the store.
    ///
    /// Returns true if the session was added, false if the session was
    /// already in the store.
    pub async fn add(&self, session: Session) -> bool {
        let sessions_lock = self.entry(&session.sender_key.to_base64());
        let mut sessions = sessions_lock.lock().await;

        if !sessions.contains(&session) {
            sessions.push(session);
            true
        } else {
            false
        }
    }

    /// Get all the sessions that belong to the given sender key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.read().get(sender_key).cloned()
    }

    /// Get the number of Olm sessions in the store.
    pub async fn count(&self) -> usize {
        let entries: Vec<_> = self.entries.read().values().cloned().collect();
        let mut count = 0;

        for sessions in entries {
            count += sessions.lock().await.len();
        }

        count
    }

    /// Remove all the sessions from the store.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[derive(Debug, Default, Clone)]
/// In-memory store that holds inbound group sessions.
pub struct GroupSessionStore {
    #[allow(clippy::type_complexity)]
    entries: Arc<StdRwLock<BTreeMap<OwnedRoomId, HashMap<String, InboundGroupSession>>>>,
}

impl GroupSessionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns true if the session was added, false if the session was
    /// already in the store, in which case it's replaced.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .write()
            .entry(session.room_id().to_owned())
            .or_default()
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get all the group sessions the store knows about.
    pub fn get_all(&self) -> Vec<InboundGroupSession> {
        self.entries.read().values().flat_map(|sessions| sessions.values().cloned()).collect()
    }

    /// Get the number of `InboundGroupSession`s we have.
    pub fn count(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    /// Get a inbound group session from our store.
    ///
    /// # Arguments
    /// * `room_id` - The room id of the room that the session belongs to.
    ///
    /// * `session_id` - The unique id of the session.
    pub fn get(&self, room_id: &RoomId, session_id: &str) -> Option<InboundGroupSession> {
        self.entries.read().get(room_id).and_then(|m| m.get(session_id).cloned())
    }

    /// Remove all the sessions from the store.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
