//! Encoding of the structured packet bodies the engine produces and consumes: ack blocks,
//!  distributed transaction ids and small string-keyed maps.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;

use crate::protocol::packet::MessageId;
use crate::util::buf::{put_bytes, put_string, try_get_bytes, try_get_string};


/// One (consumer, message) pair in an ACKNOWLEDGE or REDELIVER body
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AckEntry {
    pub consumer_id: u64,
    pub message_id: MessageId,
}
impl AckEntry {
    pub fn new(consumer_id: u64, message_id: MessageId) -> AckEntry {
        AckEntry { consumer_id, message_id }
    }
}

pub fn encode_ack_block(entries: &[AckEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * 16);
    for e in entries {
        buf.put_u64(e.consumer_id);
        buf.put_u64(e.message_id.0);
    }
    buf.freeze()
}

pub fn decode_ack_block(mut body: &[u8]) -> anyhow::Result<Vec<AckEntry>> {
    if body.len() % 16 != 0 {
        bail!("ack block length {} is not a multiple of the entry size", body.len());
    }
    let mut result = Vec::with_capacity(body.len() / 16);
    while !body.is_empty() {
        let consumer_id = TryGetFixedSupport::try_get_u64(&mut body)?;
        let message_id = MessageId(TryGetFixedSupport::try_get_u64(&mut body)?);
        result.push(AckEntry { consumer_id, message_id });
    }
    Ok(result)
}


/// A distributed transaction branch id, assigned by an external transaction manager
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub global_transaction_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_transaction_id: &[u8], branch_qualifier: &[u8]) -> Xid {
        Xid {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.format_id);
        put_bytes(buf, &self.global_transaction_id);
        put_bytes(buf, &self.branch_qualifier);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Xid> {
        let format_id = TryGetFixedSupport::try_get_i32(buf)?;
        let global_transaction_id = try_get_bytes(buf)?;
        let branch_qualifier = try_get_bytes(buf)?;
        Ok(Xid { format_id, global_transaction_id, branch_qualifier })
    }
}

pub fn encode_xid(xid: &Xid) -> Bytes {
    let mut buf = BytesMut::new();
    xid.ser(&mut buf);
    buf.freeze()
}

pub fn decode_xid(mut body: &[u8]) -> anyhow::Result<Xid> {
    Xid::deser(&mut body)
}

pub fn encode_xid_list(xids: &[Xid]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_usize_varint(xids.len());
    for xid in xids {
        xid.ser(&mut buf);
    }
    buf.freeze()
}

/// `expected` is the count announced in the reply properties; a mismatch means a corrupt reply
pub fn decode_xid_list(mut body: &[u8], expected: Option<usize>) -> anyhow::Result<Vec<Xid>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let len = body.try_get_usize_varint()?;
    if let Some(expected) = expected {
        if expected != len {
            bail!("reply announces {} xids, body contains {}", expected, len);
        }
    }
    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(Xid::deser(&mut body)?);
    }
    Ok(result)
}

pub fn encode_int_map(entries: &[(&str, i32)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_usize_varint(entries.len());
    for (k, v) in entries {
        put_string(&mut buf, k);
        buf.put_i32(*v);
    }
    buf.freeze()
}

pub fn decode_int_map(mut body: &[u8]) -> anyhow::Result<FxHashMap<String, i32>> {
    let mut result = FxHashMap::default();
    if body.is_empty() {
        return Ok(result);
    }
    let len = body.try_get_usize_varint()?;
    for _ in 0..len {
        let k = try_get_string(&mut body)?;
        let v = TryGetFixedSupport::try_get_i32(&mut body)?;
        result.insert(k, v);
    }
    Ok(result)
}
