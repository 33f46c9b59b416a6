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

//! The crypto specific Olm objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod session;

pub use account::{Account, InboundCreationResult, PickledAccount, StaticAccountData};
pub use group_sessions::{
    BackedUpRoomKey, ExportedRoomKey, InboundGroupSession, PickledInboundGroupSession,
};
pub use session::{PickledSession, Session};
pub use vodozemac::{
    megolm::{ExportedSessionKey, SessionKey},
    olm::IdentityKeys,
};
