//! Errors reported to completions and error logs.

use crate::bus::BusError;
use thiserror::Error;

/// What failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOrigin {
    /// The reply to a method call
    Reply,
    /// The payload of a signal
    Signal,
}

/// A reply or signal did not have the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {}", parse_failure(.origin, .member))]
pub struct DecodeError {
    /// Object kind that received it ("Client", "EntryGroup", ...)
    pub context: &'static str,
    /// Method or signal name
    pub member: String,
    pub origin: DecodeOrigin,
    /// Decoder message, kept out of the display text
    pub detail: String,
}

impl DecodeError {
    pub fn reply(context: &'static str, member: &str, detail: impl Into<String>) -> Self {
        Self {
            context,
            member: member.to_string(),
            origin: DecodeOrigin::Reply,
            detail: detail.into(),
        }
    }

    pub fn signal(context: &'static str, member: &str, detail: impl Into<String>) -> Self {
        Self {
            context,
            member: member.to_string(),
            origin: DecodeOrigin::Signal,
            detail: detail.into(),
        }
    }
}

fn parse_failure(origin: &DecodeOrigin, member: &str) -> String {
    match origin {
        DecodeOrigin::Reply => format!("Cannot parse response to \"{}\"", member),
        DecodeOrigin::Signal => format!("Cannot parse \"{}\" parameters", member),
    }
}

/// Error delivered to operation completions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
