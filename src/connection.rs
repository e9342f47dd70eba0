use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{Error, FrameCodec};
use crate::frame::Frame;

pub struct Connection {
    stream: TcpStream,
    codec: FrameCodec,
    // Data is read from the socket into the read buffer. When a frame is
    // parsed, the corresponding data is removed from the buffer. Commands
    // larger than a single kernel read accumulate across read events.
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection {
            stream,
            codec: FrameCodec,
            // Allocate the buffer with 4kb of capacity.
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Reads a single frame, waiting for more data if the buffered bytes do
    /// not yet form a whole frame. Returns `None` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // The peer hung up while a frame was still in flight.
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection reset by peer",
                )
                .into());
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let mut bytes = BytesMut::new();
        self.codec.encode(frame, &mut bytes)?;

        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Drops any buffered bytes. After a protocol error there is no reliable
    /// way to find the start of the next frame, so the connection resyncs by
    /// discarding what the peer has sent so far.
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}
