//! Typed encode/decode of message bodies.
//!
//! Outgoing arguments are encoded from plain Rust tuples into a `zvariant`
//! structure. Incoming bodies are decoded back into tuples; a shape mismatch
//! is reported as an error string, never a panic.

use serde::de::DeserializeOwned;
use std::fmt;
use zbus::zvariant::{self, Structure, Type};

/// Argument tuples that can travel through a [`Payload`].
///
/// Implemented for tuples of D-Bus basic types, strings, byte arrays and
/// object paths.
pub trait WireArgs:
    DeserializeOwned + Type + TryFrom<Structure<'static>, Error = zvariant::Error> + Send + 'static
{
}

impl<T> WireArgs for T where
    T: DeserializeOwned
        + Type
        + TryFrom<Structure<'static>, Error = zvariant::Error>
        + Send
        + 'static
{
}

/// Body of a method call, reply or signal.
pub struct Payload(Repr);

enum Repr {
    Empty,
    /// Received from the bus, decoded lazily from the message body
    Message(zbus::Message),
    /// Built locally from typed arguments
    Fields(Structure<'static>),
}

impl Payload {
    /// A body without arguments.
    pub fn empty() -> Self {
        Self(Repr::Empty)
    }

    /// Encode a tuple of arguments.
    pub fn encode<T>(args: T) -> Self
    where
        Structure<'static>: From<T>,
    {
        Self(Repr::Fields(Structure::from(args)))
    }

    /// Wrap the body of a received message.
    pub fn from_message(message: zbus::Message) -> Self {
        Self(Repr::Message(message))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.0, Repr::Empty)
    }

    /// Decode into the expected tuple shape.
    pub fn decode<T: WireArgs>(self) -> Result<T, String> {
        match self.0 {
            Repr::Empty => Err("payload has no arguments".to_string()),
            Repr::Message(message) => message
                .body()
                .deserialize::<T>()
                .map_err(|e| e.to_string()),
            Repr::Fields(fields) => {
                if fields.signature() != T::SIGNATURE {
                    return Err(format!(
                        "Signature mismatch: got {}, expected {}",
                        fields.signature(),
                        T::SIGNATURE
                    ));
                }
                T::try_from(fields).map_err(|e| e.to_string())
            }
        }
    }

    /// Structure to send on the wire, `None` for an empty body.
    pub(crate) fn into_fields(self) -> Result<Option<Structure<'static>>, String> {
        match self.0 {
            Repr::Empty => Ok(None),
            Repr::Fields(fields) => Ok(Some(fields)),
            Repr::Message(_) => Err("a received message body cannot be sent as arguments".into()),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Empty => write!(f, "Payload(())"),
            Repr::Message(message) => f
                .debug_tuple("Payload")
                .field(&message.body().signature().to_string())
                .finish(),
            Repr::Fields(fields) => f.debug_tuple("Payload").field(fields).finish(),
        }
    }
}
