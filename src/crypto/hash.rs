// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Opaque cryptographic secure hash used by the overall project.
//!
//! Current implementation uses SHA-256.
//!
//! The serialization uses [Multihash](https://multiformats.io/multihash) format
//! to keep a door opened for future extensions. Since a single algorithm is
//! supported every hash, and thus every transaction address, has a fixed
//! length.

use crate::{base::serialize, Error, ErrorKind, Result};
use ring::digest;
use serde::{de::Visitor, Deserializer, Serializer};
use std::fmt::{Debug, Display, Formatter};

/// Multihash SHA-256 type.
const MULTIHASH_TYPE_SHA256: u8 = 0x12;

/// SHA-256 digest length.
const SHA256_LEN: usize = 32;

/// Serialized length: algorithm tag (1 byte) + digest length (1 byte) + digest.
const MULTIHASH_BYTES_LEN: usize = 2 + SHA256_LEN;

#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; MULTIHASH_BYTES_LEN]);

impl Default for Hash {
    fn default() -> Self {
        Hash::from_digest([0; SHA256_LEN])
    }
}

impl Hash {
    fn from_digest(digest: [u8; SHA256_LEN]) -> Self {
        let mut bytes = [0; MULTIHASH_BYTES_LEN];
        bytes[0] = MULTIHASH_TYPE_SHA256;
        bytes[1] = SHA256_LEN as u8;
        bytes[2..].copy_from_slice(&digest);
        Hash(bytes)
    }

    /// Compute hash from arbitrary data.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, data);
        let mut bytes = [0; SHA256_LEN];
        bytes.copy_from_slice(digest.as_ref());
        Hash::from_digest(bytes)
    }

    /// Construct from a bytes slice representing a serialized multihash.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MULTIHASH_BYTES_LEN
            || bytes[0] != MULTIHASH_TYPE_SHA256
            || bytes[1] as usize != SHA256_LEN
        {
            return Err(Error::new_ext(ErrorKind::MalformedData, "invalid multihash"));
        }
        let mut hash = [0; MULTIHASH_BYTES_LEN];
        hash.copy_from_slice(bytes);
        Ok(Hash(hash))
    }

    /// Creates a new instance from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex::decode(hex) {
            Ok(buf) => Self::from_bytes(&buf),
            Err(err) => Err(Error::new_ext(ErrorKind::MalformedData, err)),
        }
    }

    /// Returns the hash serialized as a multihash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wrapped digest bytes.
    pub fn hash_value(&self) -> &[u8] {
        &self.0[2..]
    }

    /// Multihash hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl serde::Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.as_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HashVisitor;

        impl<'v> Visitor<'v> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
                write!(fmt, "expecting byte array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Hash::from_bytes(bytes).map_err(|_err| serde::de::Error::custom("Invalid multihash"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(HashVisitor)
    }
}

/// A trait for types that can be hashed.
pub trait Hashable {
    /// Hash of the MessagePack representation.
    fn primary_hash(&self) -> Hash;
}

/// Blanket implementation for all types that can be serialized using
/// MessagePack.
impl<T: serde::Serialize> Hashable for T {
    fn primary_hash(&self) -> Hash {
        let buf = serialize::rmp_serialize(self).unwrap_or_default();
        Hash::from_data(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};

    const HASH_HEX: &str =
        "c4221220879ecb0adedfa6a8aa19d972d225c3ce74d95619fda302ab4090fcff2ab45e6f";

    #[test]
    fn hash_serialize() {
        let hash = Hash::from_hex(&HASH_HEX[4..]).unwrap();

        let buf = rmp_serialize(&hash).unwrap();

        assert_eq!(hex::encode(&buf), HASH_HEX);
    }

    #[test]
    fn hash_deserialize() {
        let expected = Hash::from_hex(&HASH_HEX[4..]).unwrap();
        let buf = hex::decode(HASH_HEX).unwrap();

        let hash: Hash = rmp_deserialize(&buf).unwrap();

        assert_eq!(hash, expected);
    }

    #[test]
    fn sha256_of_empty_data() {
        let hash = Hash::from_data(&[]);

        assert_eq!(
            hex::encode(hash.hash_value()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn reject_truncated_multihash() {
        let err = Hash::from_hex("12201234").unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }
}
