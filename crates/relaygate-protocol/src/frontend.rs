use crate::codec::{put_cstring, put_message, put_nullable_bytes, read_payload, PayloadReader};
use crate::messages::{CloseTarget, DescribeTarget, FrontendMessage};
use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Startup packets are small; anything larger is refused before allocating.
pub const MAX_STARTUP_LEN: i32 = 10_000;

pub async fn read_startup<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let len = stream.read_i32().await?;
    if !(8..=MAX_STARTUP_LEN).contains(&len) {
        return Err(anyhow!("invalid startup length: {len}"));
    }
    let protocol = stream.read_i32().await?;
    let mut buf = vec![0u8; len as usize - 8];
    stream.read_exact(&mut buf).await?;
    if protocol == SSL_REQUEST_CODE {
        return Ok(FrontendMessage::SslRequest);
    }
    let params = parse_params(&buf);
    Ok(FrontendMessage::Startup { params })
}

pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<FrontendMessage> {
    let msg_type = match stream.read_u8().await {
        Ok(v) => v,
        Err(_) => return Ok(FrontendMessage::Terminate),
    };
    let buf = read_payload(stream).await?;
    decode_frontend_message(msg_type, &buf)
}

fn decode_frontend_message(msg_type: u8, buf: &[u8]) -> Result<FrontendMessage> {
    let mut r = PayloadReader::new(buf);
    match msg_type {
        b'Q' => Ok(FrontendMessage::Query { sql: r.cstring()? }),
        b'p' => Ok(FrontendMessage::Password {
            password: r.cstring()?,
        }),
        b'P' => {
            let statement_name = r.cstring()?;
            let query = r.cstring()?;
            let count = r.i16()?.max(0) as usize;
            let mut param_oids = Vec::with_capacity(count);
            for _ in 0..count {
                param_oids.push(r.i32()?);
            }
            Ok(FrontendMessage::Parse {
                statement_name,
                query,
                param_oids,
            })
        }
        b'B' => {
            let portal_name = r.cstring()?;
            let statement_name = r.cstring()?;
            let param_format_codes = read_i16_list(&mut r)?;
            let count = r.i16()?.max(0) as usize;
            let mut param_values = Vec::with_capacity(count);
            for _ in 0..count {
                param_values.push(r.nullable_bytes()?);
            }
            let result_format_codes = read_i16_list(&mut r)?;
            Ok(FrontendMessage::Bind {
                portal_name,
                statement_name,
                param_format_codes,
                param_values,
                result_format_codes,
            })
        }
        b'D' => {
            let target = match r.u8()? {
                b'S' => DescribeTarget::Statement,
                b'P' => DescribeTarget::Portal,
                other => return Err(anyhow!("invalid describe target: {}", other as char)),
            };
            Ok(FrontendMessage::Describe {
                target,
                name: r.cstring()?,
            })
        }
        b'E' => Ok(FrontendMessage::Execute {
            portal_name: r.cstring()?,
            max_rows: r.i32()?,
        }),
        b'C' => {
            let target = match r.u8()? {
                b'S' => CloseTarget::Statement,
                b'P' => CloseTarget::Portal,
                other => return Err(anyhow!("invalid close target: {}", other as char)),
            };
            Ok(FrontendMessage::Close {
                target,
                name: r.cstring()?,
            })
        }
        b'S' => Ok(FrontendMessage::Sync),
        b'H' => Ok(FrontendMessage::Flush),
        b'X' => Ok(FrontendMessage::Terminate),
        other => Ok(FrontendMessage::Unsupported { code: other }),
    }
}

fn read_i16_list(r: &mut PayloadReader<'_>) -> Result<Vec<i16>> {
    let count = r.i16()?.max(0) as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(r.i16()?);
    }
    Ok(out)
}

fn parse_params(buf: &[u8]) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut r = PayloadReader::new(buf);
    while r.remaining() > 0 {
        let key = match r.cstring() {
            Ok(key) if !key.is_empty() => key,
            _ => break,
        };
        match r.cstring() {
            Ok(value) => params.insert(key, value),
            Err(_) => break,
        };
    }
    params
}

/// Write one client message, as a client of a physical backend does.
pub async fn write_frontend_message<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &FrontendMessage,
) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_frontend_message(&mut buf, msg)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode several client messages into one buffer, for pipelined extended queries.
pub fn encode_frontend_message(buf: &mut BytesMut, msg: &FrontendMessage) -> Result<()> {
    let mut payload = BytesMut::new();
    match msg {
        FrontendMessage::Startup { params } => {
            payload.put_i32(PROTOCOL_VERSION);
            let mut keys: Vec<&String> = params.keys().collect();
            keys.sort();
            for key in keys {
                put_cstring(&mut payload, key);
                put_cstring(&mut payload, &params[key]);
            }
            payload.put_u8(0);
            buf.put_i32((payload.len() + 4) as i32);
            buf.extend_from_slice(&payload);
            return Ok(());
        }
        FrontendMessage::SslRequest => {
            buf.put_i32(8);
            buf.put_i32(SSL_REQUEST_CODE);
            return Ok(());
        }
        FrontendMessage::Query { sql } => {
            put_cstring(&mut payload, sql);
            put_message(buf, b'Q', &payload);
        }
        FrontendMessage::Password { password } => {
            put_cstring(&mut payload, password);
            put_message(buf, b'p', &payload);
        }
        FrontendMessage::Parse {
            statement_name,
            query,
            param_oids,
        } => {
            put_cstring(&mut payload, statement_name);
            put_cstring(&mut payload, query);
            payload.put_i16(param_oids.len() as i16);
            for oid in param_oids {
                payload.put_i32(*oid);
            }
            put_message(buf, b'P', &payload);
        }
        FrontendMessage::Bind {
            portal_name,
            statement_name,
            param_format_codes,
            param_values,
            result_format_codes,
        } => {
            put_cstring(&mut payload, portal_name);
            put_cstring(&mut payload, statement_name);
            payload.put_i16(param_format_codes.len() as i16);
            for code in param_format_codes {
                payload.put_i16(*code);
            }
            payload.put_i16(param_values.len() as i16);
            for value in param_values {
                put_nullable_bytes(&mut payload, value.as_deref());
            }
            payload.put_i16(result_format_codes.len() as i16);
            for code in result_format_codes {
                payload.put_i16(*code);
            }
            put_message(buf, b'B', &payload);
        }
        FrontendMessage::Describe { target, name } => {
            payload.put_u8(target.wire_byte());
            put_cstring(&mut payload, name);
            put_message(buf, b'D', &payload);
        }
        FrontendMessage::Execute {
            portal_name,
            max_rows,
        } => {
            put_cstring(&mut payload, portal_name);
            payload.put_i32(*max_rows);
            put_message(buf, b'E', &payload);
        }
        FrontendMessage::Close { target, name } => {
            payload.put_u8(target.wire_byte());
            put_cstring(&mut payload, name);
            put_message(buf, b'C', &payload);
        }
        FrontendMessage::Sync => put_message(buf, b'S', &payload),
        FrontendMessage::Flush => put_message(buf, b'H', &payload),
        FrontendMessage::Terminate => put_message(buf, b'X', &payload),
        FrontendMessage::Unsupported { code } => {
            return Err(anyhow!("cannot encode unsupported message {}", *code as char))
        }
    }
    Ok(())
}
