use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;


pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// length prefixed as a varint
pub fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_usize_varint(b.len());
    buf.put_slice(b);
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    let s = String::from_utf8(raw)?;
    Ok(s)
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        result.push(TryGetFixedSupport::try_get_u8(buf)?);
    }
    Ok(result)
}
