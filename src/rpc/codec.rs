//! Tagged MessagePack encoding for RPC frames and cache records.
//!
//! Everything that crosses the wire is one MessagePack value, preceded by a
//! 4-byte big-endian length. Plain data (numbers, strings, byte buffers,
//! sequences, maps) serializes as-is; the record types declared with
//! [`tagged_record!`] wrap their fields in a `{"__data__": {"type", "data"}}`
//! envelope so the receiver can verify what it is reconstructing, and errors
//! travel as `{"__exception__": {"name", "args"}}` (see [`crate::error`]).
//! The on-disk cache index reuses the same envelopes through `serde_json`,
//! giving a textual rendition of the identical shapes.
//!
//! Tuples serialize as sequences. This is observable: a call returning
//! `(Metadata, Vec<PrefetchEntry>)` arrives as a two-element array.

use std::io::{Read, Write};

use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Upper bound on a single frame. Contents transfers are bounded by file
/// size, so this only guards against garbage length prefixes.
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Declares a struct that serializes as a named, tagged record.
///
/// The generated `Serialize`/`Deserialize` impls emit and expect the
/// `__data__` envelope; decoding a record whose name does not match is an
/// error, which the transport reports as a protocol failure.
macro_rules! tagged_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident : $tag:literal {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $name {
            pub(crate) const TYPE_NAME: &'static str = $tag;
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                #[derive(serde::Serialize)]
                struct Fields<'a> {
                    $( $field: &'a $ty, )*
                }

                #[derive(serde::Serialize)]
                struct Body<'a> {
                    #[serde(rename = "type")]
                    type_name: &'static str,
                    data: Fields<'a>,
                }

                #[derive(serde::Serialize)]
                struct Envelope<'a> {
                    #[serde(rename = "__data__")]
                    data: Body<'a>,
                }

                Envelope {
                    data: Body {
                        type_name: $name::TYPE_NAME,
                        data: Fields {
                            $( $field: &self.$field, )*
                        },
                    },
                }
                .serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                #[derive(serde::Deserialize)]
                struct Fields {
                    $( $field: $ty, )*
                }

                #[derive(serde::Deserialize)]
                struct Body {
                    #[serde(rename = "type")]
                    type_name: String,
                    data: Fields,
                }

                #[derive(serde::Deserialize)]
                struct Envelope {
                    #[serde(rename = "__data__")]
                    data: Body,
                }

                let envelope = Envelope::deserialize(deserializer)?;
                if envelope.data.type_name != $name::TYPE_NAME {
                    return Err(<D::Error as serde::de::Error>::custom(format!(
                        "unknown record '{}', expected '{}'",
                        envelope.data.type_name,
                        $name::TYPE_NAME,
                    )));
                }

                let fields = envelope.data.data;
                Ok($name {
                    $( $field: fields.$field, )*
                })
            }
        }
    };
}

pub(crate) use tagged_record;

/// Serialize any value into the dynamic representation used in frames.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    rmpv::ext::to_value(value).map_err(|e| Error::Protocol(format!("failed to encode value: {e}")))
}

/// Reconstruct a typed value from its dynamic representation.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    rmpv::ext::from_value(value).map_err(|e| Error::Protocol(format!("failed to decode value: {e}")))
}

/// Decode the positional arguments of a call as one tuple.
pub fn args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T> {
    from_value(Value::Array(args))
}

/// Write one length-prefixed MessagePack frame.
pub fn write_frame<W: Write>(writer: &mut W, value: &Value) -> Result<()> {
    let mut payload = Vec::new();
    rmpv::encode::write_value(&mut payload, value)
        .map_err(|e| Error::Protocol(format!("failed to encode frame: {e}")))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol("frame too large".to_string()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;

    Ok(())
}

/// Read one length-prefixed MessagePack frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Value> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("oversized frame of {len} bytes")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    rmpv::decode::read_value(&mut payload.as_slice())
        .map_err(|e| Error::Protocol(format!("failed to decode frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorArg, ErrorKind, RemoteError};

    tagged_record! {
        /// Minimal record for codec round-trip tests.
        pub struct Probe : "Probe" {
            pub label: String,
            pub size: u64,
        }
    }

    tagged_record! {
        pub struct OtherProbe : "OtherProbe" {
            pub label: String,
            pub size: u64,
        }
    }

    #[test]
    fn frames_round_trip() {
        let value = Value::Array(vec![
            Value::from("token"),
            Value::Nil,
            Value::from(42),
            Value::Binary(vec![1, 2, 3]),
        ]);

        let mut buf = Vec::new();
        write_frame(&mut buf, &value).unwrap();
        let decoded = read_frame(&mut buf.as_slice()).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn records_round_trip_through_values() {
        let probe = Probe {
            label: "lib".to_string(),
            size: 7,
        };

        let value = to_value(&probe).unwrap();
        let back: Probe = from_value(value).unwrap();

        assert_eq!(back, probe);
    }

    #[test]
    fn records_round_trip_through_json() {
        let probe = Probe {
            label: "lib".to_string(),
            size: 7,
        };

        let text = serde_json::to_string(&probe).unwrap();
        assert!(text.contains("__data__"));

        let back: Probe = serde_json::from_str(&text).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn mismatched_record_name_is_rejected() {
        let probe = Probe {
            label: "lib".to_string(),
            size: 7,
        };

        let value = to_value(&probe).unwrap();
        assert!(from_value::<OtherProbe>(value).is_err());
    }

    #[test]
    fn known_exceptions_round_trip_as_their_kind() {
        let err = RemoteError {
            kind: ErrorKind::NotFound,
            class_name: "NotFound".to_string(),
            args: vec![
                ErrorArg::Int(libc::ENOENT.into()),
                ErrorArg::Str("no such file".to_string()),
            ],
        };

        let back: RemoteError = from_value(to_value(&err).unwrap()).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn unknown_exceptions_fall_back_to_other() {
        let err = RemoteError {
            kind: ErrorKind::Other,
            class_name: "SomeVendorError".to_string(),
            args: vec![ErrorArg::Str("odd".to_string())],
        };

        let back: RemoteError = from_value(to_value(&err).unwrap()).unwrap();
        assert_eq!(back.kind, ErrorKind::Other);
        assert_eq!(back.class_name, "SomeVendorError");
        assert_eq!(back.args, err.args);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let value = Value::from(1);
        let mut buf = Vec::new();
        write_frame(&mut buf, &value).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(read_frame(&mut buf.as_slice()).is_err());
    }
}
