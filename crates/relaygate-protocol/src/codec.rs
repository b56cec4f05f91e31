use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest message accepted from a peer, length word included.
pub(crate) const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Checked cursor over one message payload.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow!("unterminated string in message"))?;
        let value = String::from_utf8_lossy(&rest[..end]).to_string();
        self.pos += end + 1;
        Ok(value)
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(anyhow!(
                "message truncated: wanted {n} bytes, {} left",
                self.remaining()
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Length-prefixed value; a length of -1 means NULL.
    pub(crate) fn nullable_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }
}

pub(crate) fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn put_nullable_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            buf.put_i32(v.len() as i32);
            buf.extend_from_slice(v);
        }
        None => buf.put_i32(-1),
    }
}

/// Append a tagged message: type byte, length (including itself), payload.
pub(crate) fn put_message(buf: &mut BytesMut, tag: u8, payload: &[u8]) {
    buf.put_u8(tag);
    buf.put_i32((payload.len() + 4) as i32);
    buf.extend_from_slice(payload);
}

/// Read the length word and payload that follow an already-consumed type byte.
pub(crate) async fn read_payload<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_i32().await?;
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(anyhow!("invalid message length: {len}"));
    }
    let mut buf = vec![0u8; len as usize - 4];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
