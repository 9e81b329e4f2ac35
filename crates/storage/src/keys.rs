//! Layout das chaves no engine.
//!
//! | namespace          | chave                          | valor          |
//! |--------------------|--------------------------------|----------------|
//! | primário           | `d!` + id                      | blob           |
//! | índice (ordenado)  | `t!x!` + be_u64(expira) + id   | id             |
//! | índice (reverso)   | `t!k!` + id                    | be_u64(expira) |
//!
//! Big-endian faz a ordem lexicográfica coincidir com a ordem temporal.

use bytes::{BufMut, Bytes, BytesMut};

pub const DATA_PREFIX: &[u8] = b"d!";
pub const INDEX_PREFIX: &[u8] = b"t!";
pub const EXPIRY_PREFIX: &[u8] = b"t!x!";
pub const REVERSE_PREFIX: &[u8] = b"t!k!";

fn prefixed(prefix: &[u8], rest: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + rest.len());
    buf.put_slice(prefix);
    buf.put_slice(rest);
    buf.freeze()
}

pub fn data_key(id: &[u8]) -> Bytes {
    prefixed(DATA_PREFIX, id)
}

pub fn reverse_key(id: &[u8]) -> Bytes {
    prefixed(REVERSE_PREFIX, id)
}

pub fn expiry_key(expires_at: u64, id: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXPIRY_PREFIX.len() + 8 + id.len());
    buf.put_slice(EXPIRY_PREFIX);
    buf.put_u64(expires_at);
    buf.put_slice(id);
    buf.freeze()
}

/// Extrai (expira, id) de uma chave do índice ordenado.
pub fn decode_expiry_key(key: &[u8]) -> Option<(u64, &[u8])> {
    let rest = key.strip_prefix(EXPIRY_PREFIX)?;
    if rest.len() < 8 {
        return None;
    }
    let (ts, id) = rest.split_at(8);
    Some((decode_deadline(ts)?, id))
}

/// Remove o prefixo do namespace primário.
pub fn strip_data_prefix(key: &[u8]) -> Option<&[u8]> {
    key.strip_prefix(DATA_PREFIX)
}

pub fn encode_deadline(expires_at: u64) -> Bytes {
    Bytes::copy_from_slice(&expires_at.to_be_bytes())
}

pub fn decode_deadline(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
