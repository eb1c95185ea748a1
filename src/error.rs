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

//! Library error codes and results.

use crate::channel::ChannelError;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    MalformedData,
    BadNetwork,
    InvalidSignature,
    ResourceNotFound,
    Timeout,
    InvalidElection,
    NoQuorum,
    DuplicatedWorkflow,
    ReplicationFault,
    NotImplemented,
    Other,
}

/// Error kind strings.
pub(super) mod error_kind_str {
    pub const MALFORMED_DATA: &str = "malformed data";
    pub const BAD_NETWORK: &str = "bad network";
    pub const INVALID_SIGNATURE: &str = "invalid signature";
    pub const RESOURCE_NOT_FOUND: &str = "resource not found";
    pub const TIMEOUT: &str = "timeout";
    pub const INVALID_ELECTION: &str = "invalid election";
    pub const NO_QUORUM: &str = "no quorum";
    pub const DUPLICATED_WORKFLOW: &str = "duplicated workflow";
    pub const REPLICATION_FAULT: &str = "replication fault";
    pub const NOT_IMPLEMENTED: &str = "not implemented";
    pub const OTHER: &str = "other";
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            MalformedData => error_kind_str::MALFORMED_DATA,
            BadNetwork => error_kind_str::BAD_NETWORK,
            InvalidSignature => error_kind_str::INVALID_SIGNATURE,
            ResourceNotFound => error_kind_str::RESOURCE_NOT_FOUND,
            Timeout => error_kind_str::TIMEOUT,
            InvalidElection => error_kind_str::INVALID_ELECTION,
            NoQuorum => error_kind_str::NO_QUORUM,
            DuplicatedWorkflow => error_kind_str::DUPLICATED_WORKFLOW,
            ReplicationFault => error_kind_str::REPLICATION_FAULT,
            NotImplemented => error_kind_str::NOT_IMPLEMENTED,
            Other => error_kind_str::OTHER,
        }
    }

    fn from_name(kind: &str) -> Self {
        match kind {
            error_kind_str::MALFORMED_DATA => ErrorKind::MalformedData,
            error_kind_str::BAD_NETWORK => ErrorKind::BadNetwork,
            error_kind_str::INVALID_SIGNATURE => ErrorKind::InvalidSignature,
            error_kind_str::RESOURCE_NOT_FOUND => ErrorKind::ResourceNotFound,
            error_kind_str::TIMEOUT => ErrorKind::Timeout,
            error_kind_str::INVALID_ELECTION => ErrorKind::InvalidElection,
            error_kind_str::NO_QUORUM => ErrorKind::NoQuorum,
            error_kind_str::DUPLICATED_WORKFLOW => ErrorKind::DuplicatedWorkflow,
            error_kind_str::REPLICATION_FAULT => ErrorKind::ReplicationFault,
            error_kind_str::NOT_IMPLEMENTED => ErrorKind::NotImplemented,
            _ => ErrorKind::Other,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct StringVisitor;

impl<'de> Visitor<'de> for StringVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<R>(self, value: &str) -> std::result::Result<String, R> {
        Ok(value.to_string())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let kind = deserializer.deserialize_str(StringVisitor)?;
        Ok(ErrorKind::from_name(&kind))
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propageted the error.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Only the string representation travels within messages.
    #[serde(serialize_with = "source_se", deserialize_with = "source_de")]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn source_se<S: Serializer>(
    source: &Option<Box<dyn std::error::Error + Send + Sync>>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match source {
        Some(b) => s.serialize_str(&b.to_string()),
        None => s.serialize_unit(),
    }
}

fn source_de<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Box<dyn std::error::Error + Send + Sync>>, D::Error> {
    match d.deserialize_str(StringVisitor) {
        Ok(s) => Ok(Some(s.into())),
        Err(_err) => Ok(None),
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        // The source is not clonable, keep at least its description.
        match self.source {
            Some(ref source) => Error::new_ext(self.kind, source.to_string()),
            None => Error::new(self.kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::new_ext(ErrorKind::Other, s)
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        let kind = match err {
            ChannelError::RecvTimeout => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        };
        Error::new_ext(kind, err)
    }
}

impl From<async_std::future::TimeoutError> for Error {
    fn from(err: async_std::future::TimeoutError) -> Self {
        Error::new_ext(ErrorKind::Timeout, err)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(error.into()),
        }
    }

    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.source, &other.source) {
            (None, None) => true,
            (Some(src1), Some(src2)) => src1.to_string() == src2.to_string(),
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};
    use std::io;
    use ErrorKind::*;

    #[test]
    fn generic_error_type() {
        let src1 = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");
        let src2 = io::Error::new(io::ErrorKind::TimedOut, "oh yes!");
        let err1 = Error::new_ext(ReplicationFault, src1);
        let err2 = Error::new_ext(ReplicationFault, src2);

        assert_ne!(err1, err2);
    }

    #[test]
    fn external_network_failure() {
        let source = io::Error::new(io::ErrorKind::ConnectionRefused, "oh no!");

        let error = Error::new_ext(BadNetwork, source);

        assert_eq!(error.to_string(), "bad network");
        assert_eq!(error.to_string_full(), "bad network: oh no!");
        let source = std::error::Error::source(&error)
            .unwrap()
            .downcast_ref::<io::Error>()
            .unwrap();
        assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn clone_keeps_source_description() {
        let error = Error::new_ext(NoQuorum, "zero confirmations");

        let cloned = error.clone();

        assert_eq!(cloned, error);
        assert_eq!(cloned.to_string_full(), "no quorum: zero confirmations");
    }

    #[test]
    fn channel_timeout_conversion() {
        let error: Error = ChannelError::RecvTimeout.into();

        assert_eq!(error.kind, Timeout);
    }

    const ERROR_HEX: &str = "92b17265706c69636174696f6e206661756c74a66f68206e6f21";
    const ERROR_NO_SOURCE_HEX: &str = "92b17265706c69636174696f6e206661756c74c0";

    #[test]
    fn error_serialize() {
        let error = Error::new_ext(ReplicationFault, "oh no!");

        let buf = rmp_serialize(&error).unwrap();

        assert_eq!(hex::encode(&buf), ERROR_HEX);
    }

    #[test]
    fn error_deserialize() {
        let buf = hex::decode(ERROR_HEX).unwrap();

        let err: Error = rmp_deserialize(&buf).unwrap();

        assert_eq!(err, Error::new_ext(ReplicationFault, "oh no!"));
    }

    #[test]
    fn error_serialize_no_source() {
        let error = Error::new(ReplicationFault);

        let buf = rmp_serialize(&error).unwrap();

        assert_eq!(hex::encode(&buf), ERROR_NO_SOURCE_HEX);
    }

    #[test]
    fn error_deserialize_no_source() {
        let buf = hex::decode(ERROR_NO_SOURCE_HEX).unwrap();

        let err: Error = rmp_deserialize(&buf).unwrap();

        assert_eq!(err, Error::new(ReplicationFault));
    }
}
