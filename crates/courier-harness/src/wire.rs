//! Frames over a byte stream.
//!
//! Simulated links are plain TCP streams carrying back-to-back frames. The
//! header announces the payload size, so no extra length prefix is needed.

use std::io;

use courier_proto::{Frame, FrameHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FrameHeader::SIZE];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let payload_size = FrameHeader::from_bytes(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .payload_size() as usize;

    buf.resize(FrameHeader::SIZE + payload_size, 0);
    reader.read_exact(&mut buf[FrameHeader::SIZE..]).await?;

    Frame::decode(&buf).map(Some).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_vec().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
