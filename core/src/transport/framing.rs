// Length-prefixed framing
//
// Each frame is a big-endian u32 length followed by that many bytes. Only
// frames of exactly PACKET_SIZE carry packets; other sizes up to
// MAX_FRAME_SIZE are skipped so the stream stays in sync, and anything
// larger ends the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::packet::PACKET_SIZE;
use crate::pipeline::{BufferPool, PooledBuffer};

/// Largest length prefix accepted before the connection is dropped.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum FrameRead {
    Packet(PooledBuffer),
    /// A frame of the wrong size was read and discarded
    WrongSize(usize),
    /// Peer closed cleanly between frames
    Eof,
}

pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, pool: &BufferPool) -> Result<FrameRead, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Eof),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    if len != PACKET_SIZE {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if skipped != len as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        return Ok(FrameRead::WrongSize(len));
    }

    let mut buf = pool.acquire();
    reader.read_exact(&mut buf[..PACKET_SIZE]).await?;
    Ok(FrameRead::Packet(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let pool = BufferPool::new(2, PACKET_SIZE);
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        let packet: Vec<u8> = (0..PACKET_SIZE).map(|i| i as u8).collect();
        write_frame(&mut a, &packet).await.unwrap();

        match read_frame(&mut b, &pool).await.unwrap() {
            FrameRead::Packet(buf) => assert_eq!(&buf[..], &packet[..]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_size_skipped_then_next_frame_read() {
        let pool = BufferPool::new(2, PACKET_SIZE);
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        write_frame(&mut a, &[7u8; 100]).await.unwrap();
        write_frame(&mut a, &vec![1u8; PACKET_SIZE]).await.unwrap();
        drop(a);

        assert!(matches!(read_frame(&mut b, &pool).await.unwrap(), FrameRead::WrongSize(100)));
        assert!(matches!(read_frame(&mut b, &pool).await.unwrap(), FrameRead::Packet(_)));
        assert!(matches!(read_frame(&mut b, &pool).await.unwrap(), FrameRead::Eof));
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let pool = BufferPool::new(1, PACKET_SIZE);
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, &pool).await,
            Err(TransportError::FrameTooLarge(_))
        ));
        assert!(matches!(
            write_frame(&mut a, &vec![0u8; MAX_FRAME_SIZE + 1]).await,
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let pool = BufferPool::new(1, PACKET_SIZE);
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        a.write_u32(PACKET_SIZE as u32).await.unwrap();
        a.write_all(&[0u8; 10]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, &pool).await, Err(TransportError::Io(_))));
    }
}
