//! Length-prefixed bincode framing, in blocking and async flavours.

use keywarden_core::error::{KeywardenError, KeywardenResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; protects against corrupt length prefixes.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

fn encode<T: Serialize>(msg: &T) -> KeywardenResult<Vec<u8>> {
    let payload = bincode::serialize(msg)
        .map_err(|err| KeywardenError::Rpc(format!("encode frame: {err}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(KeywardenError::Rpc(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    Ok(payload)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> KeywardenResult<T> {
    bincode::deserialize(payload)
        .map_err(|err| KeywardenError::Rpc(format!("decode frame: {err}")))
}

fn check_len(len: usize) -> KeywardenResult<()> {
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(KeywardenError::Rpc(format!(
            "refusing frame of {len} bytes"
        )));
    }
    Ok(())
}

/// Write one frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> KeywardenResult<()> {
    let payload = encode(msg)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> KeywardenResult<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode(&payload)
}

/// Write one frame to an async stream.
pub async fn write_frame_async<W, T>(writer: &mut W, msg: &T) -> KeywardenResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode(msg)?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async stream.
pub async fn read_frame_async<R, T>(reader: &mut R) -> KeywardenResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    check_len(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response, RetrieveResponse};
    use keywarden_core::record::{Record, KEY_LEN};
    use std::io::Cursor;

    #[test]
    fn blocking_round_trip() {
        let request = Request::AutoRetrieve {
            hostname: "h1".into(),
            uuids: vec!["a1".into(), "b2".into()],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();

        let decoded: Request = read_frame(&mut Cursor::new(&buf)).unwrap();
        match decoded {
            Request::AutoRetrieve { hostname, uuids } => {
                assert_eq!(hostname, "h1");
                assert_eq!(uuids, vec!["a1".to_string(), "b2".to_string()]);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn granted_records_keep_exact_key_bytes() {
        let mut resp = RetrieveResponse::default();
        let mut rec = Record::new("a1", (0..KEY_LEN as u8).collect());
        rec.mapped_name = "crypt-a1".into();
        resp.granted.insert("a1".into(), rec.clone());

        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Retrieved(resp)).unwrap();
        let decoded: Response = read_frame(&mut Cursor::new(&buf)).unwrap();
        match decoded {
            Response::Retrieved(resp) => {
                assert_eq!(resp.granted["a1"], rec);
                assert_eq!(resp.granted["a1"].key.len(), KEY_LEN);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn oversize_length_prefix_is_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        let result: KeywardenResult<Request> = read_frame(&mut Cursor::new(&buf));
        assert!(result.is_err());
    }

    #[test]
    fn zero_length_frame_is_refused() {
        let buf = 0u32.to_be_bytes();
        let result: KeywardenResult<Request> = read_frame(&mut Cursor::new(&buf));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = Request::Ping {
            password: Some("pw".into()),
        };
        write_frame_async(&mut client, &request).await.unwrap();
        let decoded: Request = read_frame_async(&mut server).await.unwrap();
        assert!(matches!(decoded, Request::Ping { password: Some(p) } if p == "pw"));

        write_frame_async(&mut server, &Response::Ok).await.unwrap();
        let reply: Response = read_frame_async(&mut client).await.unwrap();
        assert!(matches!(reply, Response::Ok));
    }
}
