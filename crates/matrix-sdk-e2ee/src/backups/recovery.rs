// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::io::{Cursor, Read};

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{pk_encryption::PkDecryption, Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::types::{AesHmacSha2AuthData, MegolmV1AuthData};

/// Error type for the decoding of a [`BackupDecryptionKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The recovery key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),
    /// The recovery key is too short.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The private part of a backup key.
///
/// The key is the 32 byte secret both backup algorithms derive their keys
/// from. Users usually see it as a base58 encoded recovery key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    pub(crate) inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"...").finish()
    }
}

impl std::fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        f.write_str(&string)
    }
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key will hold.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random decryption key.
    pub fn new() -> Self {
        let mut rng = thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rng.fill_bytes(key.as_mut_slice());

        Self { inner: key }
    }

    /// Create a decryption key from the given bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*key) }
    }

    /// Derive a decryption key from a passphrase.
    ///
    /// The passphrase is stretched with PBKDF2-SHA-512, the salt and the
    /// number of iterations are part of the backup auth data.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice())
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        Self { inner: key }
    }

    /// Try to create a decryption key from an unpadded base64 string.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(vodozemac::base64_decode(key)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self { inner: key })
        }
    }

    /// Encode the decryption key as unpadded base64.
    pub fn to_base64(&self) -> String {
        vodozemac::base64_encode(self.inner.as_slice())
    }

    /// Try to decode a base58 encoded recovery key.
    ///
    /// Whitespace is ignored, so the grouped form of [`Display`] parses as
    /// well.
    ///
    /// [`Display`]: std::fmt::Display
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());

        let decoded = Zeroizing::new(
            bs58::decode(value.as_str()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let mut decoded = Cursor::new(decoded.as_slice());

        let mut prefix = [0u8; 2];
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        let mut expected_parity = [0u8; 1];

        decoded.read_exact(&mut prefix)?;
        decoded.read_exact(key.as_mut_slice())?;
        decoded.read_exact(&mut expected_parity)?;

        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key.as_slice());

        if prefix != Self::PREFIX {
            key.zeroize();
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            key.zeroize();
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            Ok(Self { inner: key })
        }
    }

    /// Encode the decryption key as a base58 recovery key.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_slice(),
                self.inner.as_slice(),
                [Self::parity_byte(self.inner.as_slice())].as_slice(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.inner
    }

    pub(crate) fn pk_decryption(&self) -> PkDecryption {
        let secret_key = Curve25519SecretKey::from_slice(&self.inner);
        PkDecryption::from_key(secret_key)
    }

    /// The Curve25519 public key of the `m.megolm_backup.v1.curve25519-aes-sha2`
    /// backup algorithm.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.pk_decryption().public_key()
    }

    /// Create the auth data of a new `m.megolm_backup.v1.curve25519-aes-sha2`
    /// backup using this key.
    pub fn megolm_v1_auth_data(&self) -> MegolmV1AuthData {
        MegolmV1AuthData::new(self.public_key())
    }

    /// Create the auth data of a new `m.megolm_backup.v1.aes-hmac-sha2` backup
    /// using this key.
    ///
    /// The auth data contains a key check, a MAC that lets other devices
    /// check if they have the right key.
    pub fn aes_hmac_sha2_auth_data(&self) -> AesHmacSha2AuthData {
        super::aes::key_check(self)
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;

    use super::{BackupDecryptionKey, DecodeError};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base64_decoding() {
        let key = BackupDecryptionKey::new();

        let base64 = key.to_base64();
        let decoded_key = BackupDecryptionKey::from_base64(&base64).unwrap();
        assert_eq!(key.inner, decoded_key.inner, "The decode key doesn't match the original");

        assert_matches!(BackupDecryptionKey::from_base64("foo!"), Err(DecodeError::Base64(_)));
        assert_matches!(BackupDecryptionKey::from_base64("AAAA"), Err(DecodeError::Length(32, 3)));
    }

    #[test]
    fn base58_decoding() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);

        let display = key.to_string();
        assert!(display.split(' ').all(|chunk| chunk.len() <= 4));

        let decoded = BackupDecryptionKey::from_base58(&display).unwrap();
        assert_eq!(key.inner, decoded.inner);
        assert_eq!(key.public_key(), decoded.public_key());

        let mut bytes = bs58::decode(key.to_base58()).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let broken = bs58::encode(&bytes).into_string();

        assert_matches!(BackupDecryptionKey::from_base58(&broken), Err(DecodeError::Parity(..)));

        bytes[0] = 0x00;
        let broken = bs58::encode(&bytes).into_string();
        assert_matches!(BackupDecryptionKey::from_base58(&broken), Err(DecodeError::Prefix(..)));

        assert_matches!(BackupDecryptionKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn passphrase_derivation_is_stable() {
        let first = BackupDecryptionKey::from_passphrase("It's a secret", "salt", 1000);
        let second = BackupDecryptionKey::from_passphrase("It's a secret", "salt", 1000);
        let other = BackupDecryptionKey::from_passphrase("It's a secret", "pepper", 1000);

        assert_eq!(first.inner, second.inner);
        assert_ne!(first.inner, other.inner);
    }

    proptest! {
        #[test]
        fn base58_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
            let key = BackupDecryptionKey::from_bytes(&bytes);
            let decoded = BackupDecryptionKey::from_base58(&key.to_base58()).unwrap();

            prop_assert_eq!(key.inner, decoded.inner);
        }
    }
}
