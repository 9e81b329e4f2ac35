use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Operação individual dentro de um batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;

/// op_count(u32)
const COUNT_LEN: usize = 4;

/// Conjunto de escritas aplicado atomicamente: vira um único registro no log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<Op>,
    /// Bytes das ops encodadas, mantido a cada put/delete.
    body_len: usize,
}

impl Op {
    fn encoded_len(&self) -> usize {
        match self {
            Op::Put { key, value } => 1 + 4 + key.len() + 4 + value.len(),
            Op::Delete { key } => 1 + 4 + key.len(),
        }
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.push(Op::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.push(Op::Delete { key: key.into() });
        self
    }

    fn push(&mut self, op: Op) {
        self.body_len += op.encoded_len();
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub(crate) fn into_ops(self) -> Vec<Op> {
        self.ops
    }

    /// Tamanho exato do corpo encodado, em O(1).
    pub(crate) fn encoded_len(&self) -> usize {
        COUNT_LEN + self.body_len
    }

    /// Encoda o corpo do registro: op_count(u32) seguido das ops.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                Op::Put { key, value } => {
                    dst.put_u8(TAG_PUT);
                    dst.put_u32_le(key.len() as u32);
                    dst.put_slice(key);
                    dst.put_u32_le(value.len() as u32);
                    dst.put_slice(value);
                }
                Op::Delete { key } => {
                    dst.put_u8(TAG_DELETE);
                    dst.put_u32_le(key.len() as u32);
                    dst.put_slice(key);
                }
            }
        }
    }

    /// Decodifica um corpo já validado pelo CRC. Retorna None se malformado.
    ///
    /// Chaves e valores são copiados para fora de `src`: o buffer do registro
    /// não fica preso na memória por causa de um único valor vivo.
    pub(crate) fn decode(mut src: Bytes) -> Option<WriteBatch> {
        let count = get_u32(&mut src)? as usize;
        let mut batch = WriteBatch {
            ops: Vec::with_capacity(count.min(1024)),
            body_len: 0,
        };
        for _ in 0..count {
            if !src.has_remaining() {
                return None;
            }
            let tag = src.get_u8();
            let key = get_chunk(&mut src)?;
            match tag {
                TAG_PUT => {
                    let value = get_chunk(&mut src)?;
                    batch.push(Op::Put { key, value });
                }
                TAG_DELETE => batch.push(Op::Delete { key }),
                _ => return None,
            }
        }
        if src.has_remaining() {
            return None;
        }
        Some(batch)
    }
}

fn get_u32(src: &mut Bytes) -> Option<u32> {
    if src.remaining() < 4 {
        return None;
    }
    Some(src.get_u32_le())
}

fn get_chunk(src: &mut Bytes) -> Option<Bytes> {
    let len = get_u32(src)? as usize;
    if src.remaining() < len {
        return None;
    }
    Some(Bytes::copy_from_slice(&src.split_to(len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_mixed_batch() {
        let mut batch = WriteBatch::new();
        batch
            .put(Bytes::from_static(b"k1"), Bytes::from_static(b"v1"))
            .delete(Bytes::from_static(b"k2"))
            .put(Bytes::from_static(b""), Bytes::from_static(&[0x00, 0xff]));

        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        assert_eq!(buf.len(), batch.encoded_len());

        let decoded = WriteBatch::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn encoded_len_tracks_every_op() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.encoded_len(), COUNT_LEN);
        for i in 0..1_000u32 {
            if i % 3 == 0 {
                batch.delete(format!("k{i}"));
            } else {
                batch.put(format!("k{i}"), vec![0u8; i as usize % 17]);
            }
        }
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        assert_eq!(buf.len(), batch.encoded_len());

        let decoded = WriteBatch::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.encoded_len(), batch.encoded_len());
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let mut batch = WriteBatch::new();
        batch.put(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        buf.truncate(buf.len() - 2);
        assert!(WriteBatch::decode(buf.freeze()).is_none());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u8(9);
        buf.put_u32_le(1);
        buf.put_u8(b'k');
        assert!(WriteBatch::decode(buf.freeze()).is_none());
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut batch = WriteBatch::new();
        batch.delete(Bytes::from_static(b"k"));
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        buf.put_u8(0xaa);
        assert!(WriteBatch::decode(buf.freeze()).is_none());
    }
}
