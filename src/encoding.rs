//! Bincode encoding for the peer wire protocol.
//!
//! Messages are written as a self-describing Bincode object stream: one
//! serialized object per logical send, no explicit length framing. Bincode is
//! Rust-specific, but both ends of every connection run this crate, which is
//! all the stability we need.
//!
//! This wraps the bincode crate to pin down the options: we always use
//! `DefaultOptions` (variable-length integers), never the fixed-length
//! options that the top-level `bincode::serialize` functions confusingly
//! default to.

use crate::error::{Error, Result};

use bincode::Options as _;

/// Returns the Bincode options used for all encoding, initialized once.
fn options() -> &'static bincode::DefaultOptions {
    static OPTIONS: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    OPTIONS.get_or_init(bincode::DefaultOptions::new)
}

/// Serializes a value to a byte vector.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Deserializes a value from a byte slice.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// Serializes a value directly into a writer, e.g. a TCP socket.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(options().serialize_into(writer, value)?)
}

/// Deserializes the next value from a reader, or returns None if the reader
/// is cleanly closed. Connection resets count as clean closes too, since the
/// remote end closes sessions abruptly when reconfiguring.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match options().deserialize_from(reader) {
        Ok(value) => Ok(Some(value)),
        Err(err) => match *err {
            bincode::ErrorKind::Io(ref io_err) => match io_err.kind() {
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => Ok(None),
                _ => Err(Error::from(err)),
            },
            _ => Err(Error::from(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_reader() {
        let values = vec![(1u64, "a".to_string()), (u64::MAX, "b".to_string())];
        let mut buffer = Vec::new();
        for value in &values {
            serialize_into(&mut buffer, value).unwrap();
        }
        let mut reader = buffer.as_slice();
        let mut decoded = Vec::new();
        while let Some(value) = maybe_deserialize_from::<_, (u64, String)>(&mut reader).unwrap() {
            decoded.push(value);
        }
        assert_eq!(decoded, values);
    }

    #[test]
    fn eof_is_clean() {
        let mut reader: &[u8] = &[];
        assert_eq!(maybe_deserialize_from::<_, u64>(&mut reader).unwrap(), None);
    }
}
