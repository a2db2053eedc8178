use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ConnectionError;
use crate::types::NetMessage;

const MAX_VARINT_BYTES: usize = 5;

/// Reads one length-prefixed CBOR frame.
pub async fn read_message<R>(reader: &mut R, max_len: usize) -> Result<NetMessage, ConnectionError>
where
    R: AsyncReadExt + Unpin,
{
    let len = read_varint(reader).await? as usize;
    if len > max_len {
        return Err(ConnectionError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(codec::from_slice(&buf)?)
}

pub async fn write_message<W>(
    writer: &mut W,
    message: &NetMessage,
    max_len: usize,
) -> Result<(), ConnectionError>
where
    W: AsyncWriteExt + Unpin,
{
    let encoded = codec::to_vec(message)?;
    if encoded.len() > max_len || encoded.len() > u32::MAX as usize {
        return Err(ConnectionError::FrameTooLarge(encoded.len()));
    }
    let mut header = Vec::with_capacity(MAX_VARINT_BYTES);
    write_varint(encoded.len() as u32, &mut header);
    writer.write_all(&header).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_varint<R>(reader: &mut R) -> Result<u32, ConnectionError>
where
    R: AsyncReadExt + Unpin,
{
    let mut result: u32 = 0;
    let mut shift = 0;
    for index in 0..MAX_VARINT_BYTES {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if index == 0 && err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ConnectionError::Closed);
            }
            Err(err) => return Err(err.into()),
        };
        result |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(ConnectionError::FrameTooLarge(u32::MAX as usize))
}

fn write_varint(value: u32, buf: &mut Vec<u8>) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}
