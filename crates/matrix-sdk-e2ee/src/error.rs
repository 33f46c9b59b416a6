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

use ruma::{OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use super::store::CryptoStoreError;

/// Result type of the Olm to-device operations.
pub type OlmResult<T> = Result<T, OlmError>;
/// Result type of the group session operations.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed or failed one
    /// of the plaintext checks.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// None of the Olm sessions we share with the sender could decrypt the
    /// message, and no new session could be created for it.
    #[error("unable to decrypt the Olm message from {0} with sender key {1}")]
    UnableToDecrypt(OwnedUserId, Curve25519PublicKey),
}

/// Error representing a failure during a group decryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),
}

/// Error that occurs when decrypting an event that is malformed, or whose
/// decrypted payload doesn't belong to us.
///
/// The variants fall into two groups: format errors, which say that the event
/// or its plaintext is missing something, and trust errors, which say that the
/// plaintext was meant for somebody else. See [`EventError::is_trust_error()`].
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The event content isn't a valid Olm encrypted event content.
    #[error("the event content isn't a valid Olm encrypted content: {0}")]
    BadEventFormat(String),

    /// The Encrypted message doesn't contain a ciphertext.
    #[error("the Encrypted message doesn't contain a ciphertext")]
    MissingCiphertext,

    /// The Encrypted message is missing the sender key.
    #[error("the Encrypted message is missing the sender key")]
    MissingSenderKey,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    NotIncludedInRecipients,

    /// The decrypted plaintext is missing a required property.
    #[error("the decrypted plaintext is missing the `{0}` property")]
    MissingProperty(&'static str),

    /// The plaintext was encrypted for a different user.
    #[error("the plaintext was encrypted for {0}, but we are {1}")]
    BadRecipient(String, OwnedUserId),

    /// The plaintext was encrypted for a different Ed25519 key than ours.
    #[error(
        "the plaintext was encrypted for the Ed25519 key {0}, but our key is {1}"
    )]
    BadRecipientKey(String, Box<Ed25519PublicKey>),

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message. The event was most likely re-encrypted and relayed by somebody
    /// else.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    ForwardedMessage(String, OwnedUserId),

    /// The room ID of the plaintext doesn't match the room ID of the encrypted
    /// event.
    #[error(
        "the room id of the plaintext doesn't match the room id of the \
        encrypted event: expected {0:?}, got {1:?}"
    )]
    BadRoom(Option<OwnedRoomId>, Option<String>),
}

impl EventError {
    /// Does this error say that the plaintext was meant for somebody else?
    ///
    /// Trust errors are security relevant, they may be a sign of a replayed or
    /// relayed message.
    pub fn is_trust_error(&self) -> bool {
        matches!(
            self,
            EventError::BadRecipient(..)
                | EventError::BadRecipientKey(..)
                | EventError::ForwardedMessage(..)
                | EventError::BadRoom(..)
        )
    }
}

/// Error that occurs when an Olm session or a room key can't be created.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// Error when creating an Olm Session from an incoming Olm message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The room key uses an algorithm we don't support.
    #[error("the room key uses an unsupported algorithm: {0}")]
    Algorithm(String),
}
