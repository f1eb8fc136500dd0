//! Session token generation and in-band delivery.
//!
//! The remote side generates the token and sends it to the local side over
//! the already-established byte stream (in practice: the remote process's
//! stdout travelling back through SSH). Because that stream also carries
//! ordinary program output, the token is framed with the ASCII control bytes
//! SOH and STX and accompanied by a checksum, so the reader can tell a real
//! handshake apart from output that merely happens to contain control bytes.

use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Marks the start of the token frame.
pub const TOKEN_START: u8 = 0x01; // SOH
/// Marks the end of the token frame.
pub const TOKEN_END: u8 = 0x02; // STX

/// Length of a token in hex characters (128 bits).
pub const TOKEN_LEN: usize = 32;
const CHECKSUM_LEN: usize = 64;

/// Addresses of the three services a session talks to, all tunneled over
/// loopback TCP.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub environment: String,
    pub filesystem: String,
    pub cache: String,
}

impl Endpoints {
    /// Endpoints for services on the given loopback ports.
    pub fn local(environment_port: u16, filesystem_port: u16, cache_port: u16) -> Self {
        Endpoints {
            environment: format!("127.0.0.1:{environment_port}"),
            filesystem: format!("127.0.0.1:{filesystem_port}"),
            cache: format!("127.0.0.1:{cache_port}"),
        }
    }
}

/// Generate a fresh 128-bit session token.
pub fn generate_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Checksum guarding the token against stream corruption.
pub fn token_checksum(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Write the framed token to the startup stream.
pub fn write_token<W: Write>(writer: &mut W, token: &str) -> Result<()> {
    writer.write_all(&[TOKEN_START])?;
    writer.write_all(token.as_bytes())?;
    writer.write_all(token_checksum(token).as_bytes())?;
    writer.write_all(&[TOKEN_END])?;
    writer.flush()?;

    Ok(())
}

/// Read the framed token from the startup stream.
///
/// Bytes preceding the frame are ordinary output from the other side and are
/// handed to `passthrough` unmodified. A checksum mismatch terminates the
/// handshake with a protocol error.
pub fn read_token<R: Read>(reader: &mut R, mut passthrough: impl FnMut(u8)) -> Result<String> {
    let mut byte = [0u8; 1];

    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == TOKEN_START {
            break;
        }
        passthrough(byte[0]);
    }

    let mut frame = Vec::with_capacity(TOKEN_LEN + CHECKSUM_LEN);
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == TOKEN_END {
            break;
        }
        frame.push(byte[0]);
    }

    if frame.len() != TOKEN_LEN + CHECKSUM_LEN {
        return Err(Error::Protocol("handshake failed (malformed token frame)".to_string()));
    }

    let token = String::from_utf8(frame[..TOKEN_LEN].to_vec())
        .map_err(|_| Error::Protocol("handshake failed (token is not valid UTF-8)".to_string()))?;
    let checksum = &frame[TOKEN_LEN..];

    if token_checksum(&token).as_bytes() != checksum {
        return Err(Error::Protocol("handshake failed (invalid token checksum)".to_string()));
    }

    Ok(token)
}
