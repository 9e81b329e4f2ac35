//! Envelope que guarda o content-type junto do blob.
//!
//! `ct_len: u16 BE | content_type | bytes`. O store não conhece o formato.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// Content-types reais cabem folgado nisso.
const MAX_CONTENT_TYPE_LEN: usize = 255;

pub fn encode(content_type: &str, data: &[u8]) -> Bytes {
    let content_type = if content_type.is_empty() || content_type.len() > MAX_CONTENT_TYPE_LEN {
        DEFAULT_CONTENT_TYPE
    } else {
        content_type
    };

    let mut buf = BytesMut::with_capacity(2 + content_type.len() + data.len());
    buf.put_u16(content_type.len() as u16);
    buf.put_slice(content_type.as_bytes());
    buf.put_slice(data);
    buf.freeze()
}

/// Separa (content_type, bytes). `None` se o envelope estiver truncado.
pub fn decode(mut raw: Bytes) -> Option<(String, Bytes)> {
    if raw.len() < 2 {
        return None;
    }
    let ct_len = raw.get_u16() as usize;
    if raw.len() < ct_len {
        return None;
    }
    let ct = raw.split_to(ct_len);
    let content_type = String::from_utf8(ct.to_vec()).ok()?;
    Some((content_type, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_content_type_and_payload() {
        let raw = encode("image/png", b"\x89PNG");
        let (ct, data) = decode(raw).unwrap();
        assert_eq!(ct, "image/png");
        assert_eq!(&data[..], b"\x89PNG");
    }

    #[test]
    fn empty_type_falls_back_to_octet_stream() {
        let (ct, data) = decode(encode("", b"")).unwrap();
        assert_eq!(ct, DEFAULT_CONTENT_TYPE);
        assert!(data.is_empty());
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        assert!(decode(Bytes::from_static(b"\x00")).is_none());
        assert!(decode(Bytes::from_static(b"\x00\x09image")).is_none());
    }
}
