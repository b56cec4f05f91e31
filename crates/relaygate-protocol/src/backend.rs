use crate::codec::{put_cstring, put_message, put_nullable_bytes, read_payload, PayloadReader};
use crate::messages::{parse_command_tag, BackendMessage, RowDescriptionField, TransactionState};
use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};
use relaygate_core::FormatCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, msg: BackendMessage) -> Result<()> {
    let mut buf = BytesMut::new();
    encode_message(&mut buf, &msg);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Write several messages with a single flush.
pub async fn write_messages<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msgs: impl IntoIterator<Item = BackendMessage>,
) -> Result<()> {
    let mut buf = BytesMut::new();
    for msg in msgs {
        encode_message(&mut buf, &msg);
    }
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub fn encode_message(buf: &mut BytesMut, msg: &BackendMessage) {
    let mut payload = BytesMut::new();
    let tag = match msg {
        BackendMessage::AuthenticationOk => {
            payload.put_i32(0);
            b'R'
        }
        BackendMessage::AuthenticationCleartextPassword => {
            payload.put_i32(3);
            b'R'
        }
        BackendMessage::ParameterStatus { key, value } => {
            put_cstring(&mut payload, key);
            put_cstring(&mut payload, value);
            b'S'
        }
        BackendMessage::BackendKeyData { pid, secret } => {
            payload.put_i32(*pid);
            payload.put_i32(*secret);
            b'K'
        }
        BackendMessage::ReadyForQuery { state } => {
            payload.put_u8(state.wire_byte());
            b'Z'
        }
        BackendMessage::ParseComplete => b'1',
        BackendMessage::BindComplete => b'2',
        BackendMessage::CloseComplete => b'3',
        BackendMessage::NoData => b'n',
        BackendMessage::EmptyQueryResponse => b'I',
        BackendMessage::PortalSuspended => b's',
        BackendMessage::ParameterDescription { type_oids } => {
            payload.put_i16(type_oids.len() as i16);
            for oid in type_oids {
                payload.put_i32(*oid);
            }
            b't'
        }
        BackendMessage::RowDescription { fields } => {
            payload.put_i16(fields.len() as i16);
            for field in fields {
                put_cstring(&mut payload, &field.name);
                payload.put_i32(field.table_oid);
                payload.put_i16(field.column_id);
                payload.put_i32(field.type_oid);
                payload.put_i16(field.type_size);
                payload.put_i32(field.type_modifier);
                payload.put_i16(field.format.wire());
            }
            b'T'
        }
        BackendMessage::DataRow { values } => {
            payload.put_i16(values.len() as i16);
            for value in values {
                put_nullable_bytes(&mut payload, value.as_deref());
            }
            b'D'
        }
        BackendMessage::CommandComplete { kind, rows } => {
            put_cstring(&mut payload, &kind.command_tag(*rows));
            b'C'
        }
        BackendMessage::ErrorResponse { code, message } => {
            payload.put_u8(b'S');
            put_cstring(&mut payload, "ERROR");
            payload.put_u8(b'C');
            put_cstring(&mut payload, code);
            payload.put_u8(b'M');
            put_cstring(&mut payload, message);
            payload.put_u8(0);
            b'E'
        }
    };
    put_message(buf, tag, &payload);
}

/// Read one server message, as a client of a physical backend does.
/// Notices and asynchronous notifications are skipped.
pub async fn read_backend_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<BackendMessage> {
    loop {
        let msg_type = stream.read_u8().await?;
        let payload = read_payload(stream).await?;
        if let Some(msg) = decode_backend_message(msg_type, &payload)? {
            return Ok(msg);
        }
    }
}

fn decode_backend_message(msg_type: u8, payload: &[u8]) -> Result<Option<BackendMessage>> {
    let mut r = PayloadReader::new(payload);
    let msg = match msg_type {
        b'R' => match r.i32()? {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            other => return Err(anyhow!("unsupported authentication request: {other}")),
        },
        b'S' => BackendMessage::ParameterStatus {
            key: r.cstring()?,
            value: r.cstring()?,
        },
        b'K' => BackendMessage::BackendKeyData {
            pid: r.i32()?,
            secret: r.i32()?,
        },
        b'Z' => {
            let byte = r.u8()?;
            let state = TransactionState::from_wire(byte)
                .ok_or_else(|| anyhow!("invalid transaction state: {}", byte as char))?;
            BackendMessage::ReadyForQuery { state }
        }
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b'I' => BackendMessage::EmptyQueryResponse,
        b's' => BackendMessage::PortalSuspended,
        b't' => {
            let count = r.i16()?.max(0) as usize;
            let mut type_oids = Vec::with_capacity(count);
            for _ in 0..count {
                type_oids.push(r.i32()?);
            }
            BackendMessage::ParameterDescription { type_oids }
        }
        b'T' => {
            let count = r.i16()?.max(0) as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(RowDescriptionField {
                    name: r.cstring()?,
                    table_oid: r.i32()?,
                    column_id: r.i16()?,
                    type_oid: r.i32()?,
                    type_size: r.i16()?,
                    type_modifier: r.i32()?,
                    format: FormatCode::from_wire(r.i16()?)?,
                });
            }
            BackendMessage::RowDescription { fields }
        }
        b'D' => {
            let count = r.i16()?.max(0) as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.nullable_bytes()?);
            }
            BackendMessage::DataRow { values }
        }
        b'C' => {
            let (kind, rows) = parse_command_tag(&r.cstring()?);
            BackendMessage::CommandComplete { kind, rows }
        }
        b'E' => {
            let mut code = String::from("XX000");
            let mut message = String::new();
            loop {
                let field = r.u8()?;
                if field == 0 {
                    break;
                }
                let value = r.cstring()?;
                match field {
                    b'C' => code = value,
                    b'M' => message = value,
                    _ => {}
                }
            }
            BackendMessage::ErrorResponse { code, message }
        }
        b'N' | b'A' => return Ok(None),
        other => return Err(anyhow!("unexpected backend message: {}", other as char)),
    };
    Ok(Some(msg))
}
