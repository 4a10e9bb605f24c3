// Length-delimited message framing over async streams.
//
// A 4-byte big-endian length prefix followed by the payload. `write_message`
// and `read_message` move raw bytes; `send_json` / `recv_json` wrap them with
// serde_json so both the relay and the clients share one encoding path.
//
// `MAX_MESSAGE_SIZE` (16 MB) protects against unbounded allocation from
// malformed or malicious length prefixes.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                    msg.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(msg).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited message.
///
/// Returns `UnexpectedEof` if the stream closes before or during a message and
/// `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize `msg` as JSON and write it as one frame.
pub async fn send_json<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(msg).map_err(io::Error::other)?;
    write_message(writer, &bytes).await
}

/// Read one frame and decode it as JSON.
///
/// Transport errors and decode errors are kept apart: the outer `io::Result`
/// fails when the stream is unusable, the inner one when a single frame did
/// not decode (the stream is still aligned on the next frame).
pub async fn recv_json<R, T>(reader: &mut R) -> io::Result<Result<T, serde_json::Error>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let bytes = read_message(reader).await?;
    Ok(serde_json::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_simple_message() {
        let original = b"hello, relay!";
        let mut buf = Vec::new();
        write_message(&mut buf, original).await.unwrap();

        let mut reader = buf.as_slice();
        let recovered = read_message(&mut reader).await.unwrap();
        assert_eq!(recovered, original);
    }

    #[tokio::test]
    async fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn rejects_oversized_read() {
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut reader = &fake_len[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_unexpected_eof() {
        let short = [0u8, 1];
        let mut reader = &short[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn undecodable_frame_keeps_stream_aligned() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"{not json").await.unwrap();
        send_json(&mut buf, &vec![1u32, 2, 3]).await.unwrap();

        let mut reader = buf.as_slice();
        let first: Result<Vec<u32>, _> = recv_json(&mut reader).await.unwrap();
        assert!(first.is_err());
        let second: Vec<u32> = recv_json(&mut reader).await.unwrap().unwrap();
        assert_eq!(second, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn frames_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for word in ["first", "second", "third"] {
                send_json(&mut a, &word).await.unwrap();
            }
        });
        for expected in ["first", "second", "third"] {
            let got: String = recv_json(&mut b).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }
        writer.await.unwrap();
    }
}
