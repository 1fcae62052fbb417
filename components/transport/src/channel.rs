use std::io::Cursor;

use bytes::{Buf, BytesMut};
use log::{info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use codec::error::FrameError;
use codec::frame::Frame;

const BUFFER_SIZE: usize = 4 * 1024;

/// Receives `Frame` values from a remote peer.
///
/// The reader fills an internal buffer until enough bytes accumulate to form
/// a full frame, then parses and returns it. Bytes beyond the parsed frame
/// stay buffered for the next call.
pub struct ChannelReader {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    peer_address: String,
}

impl ChannelReader {
    pub fn new(stream: OwnedReadHalf, peer_address: &str) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            peer_address: peer_address.to_owned(),
        }
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Read a single `Frame` value from the underlying stream.
    ///
    /// # Returns
    ///
    /// On success, the received frame is returned. If the `TcpStream` is
    /// closed in a way that doesn't break a frame in half, it returns `None`.
    /// Otherwise, an error is returned.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            // Attempt to parse a frame from the buffered data. If enough data
            // has been buffered, the frame is returned.
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            if self.buffer.spare_capacity_mut().len() < BUFFER_SIZE {
                self.buffer.reserve(BUFFER_SIZE);
            }

            // `0` indicates "end of stream".
            let read = match self.stream.read_buf(&mut self.buffer).await {
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, self.peer_address);
                    n
                }
                Err(_e) => {
                    info!("Failed to read data from {}", self.peer_address);
                    0
                }
            };

            if 0 == read {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data in the read buffer. If
                // there is, the peer closed the socket while sending a frame.
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    warn!("Discarded {} bytes", self.buffer.len());
                    return Err(FrameError::ConnectionReset);
                }
            }
        }
    }

    /// Tries to parse a frame from the buffer. If the buffer contains enough
    /// data, the frame is returned and the data removed from the buffer. If
    /// not enough data has been buffered yet, `Ok(None)` is returned.
    fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        use FrameError::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);

        // `check` is a cheap scan that advances the cursor to the end of the
        // frame, so a successful pass tells us the frame length without
        // allocating anything.
        match Frame::check(&mut buf) {
            Ok(_) => {
                let len = buf.position() as usize;
                buf.set_position(0);

                let frame = Frame::parse(&mut buf)?;

                self.buffer.advance(len);

                Ok(Some(frame))
            }

            // Expected runtime condition: wait for more bytes from the socket.
            Err(Incomplete) => Ok(None),

            // The connection is in an invalid state; the caller closes it.
            Err(e) => Err(e),
        }
    }
}

/// Sends `Frame` values to a remote peer. One writer task per connection
/// serializes outbound frames through this.
pub struct ChannelWriter {
    stream: OwnedWriteHalf,
    peer_address: String,
}

impl ChannelWriter {
    pub fn new(stream: OwnedWriteHalf, peer_address: &str) -> Self {
        Self {
            stream,
            peer_address: peer_address.to_owned(),
        }
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), std::io::Error> {
        let mut buffer = BytesMut::with_capacity(frame.wire_len());
        if let Err(e) = frame.encode(&mut buffer) {
            warn!("Failed to encode frame. Cause: {:?}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
        }

        let bytes_to_write = buffer.len();
        self.stream.write_all(&buffer).await?;
        trace!("Wrote {} bytes to {}", bytes_to_write, self.peer_address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::frame::OperationCode;
    use std::error::Error;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_read_write_round_trip() -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut reader = ChannelReader::new(read_half, &peer.to_string());
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(OperationCode::Noop, frame.opcode);
            assert_eq!(7, frame.opaque);
            // Clean shutdown yields None.
            assert!(reader.read_frame().await.unwrap().is_none());
        });

        let stream = TcpStream::connect(address).await?;
        let (_read_half, write_half) = stream.into_split();
        let mut writer = ChannelWriter::new(write_half, &address.to_string());
        let mut frame = Frame::request(OperationCode::Noop, 0);
        frame.opaque = 7;
        writer.write_frame(&frame).await?;
        drop(writer);

        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_mid_frame_close_is_reset() -> Result<(), Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (read_half, _write_half) = stream.into_split();
            let mut reader = ChannelReader::new(read_half, &peer.to_string());
            let res = reader.read_frame().await;
            assert_eq!(Err(FrameError::ConnectionReset), res);
        });

        let mut stream = TcpStream::connect(address).await?;
        let mut buffer = BytesMut::new();
        let mut frame = Frame::request(OperationCode::Mutation, 0);
        frame.value = Bytes::from_static(b"payload");
        frame.encode(&mut buffer)?;
        // Send only part of the frame, then slam the socket shut.
        stream.write_all(&buffer[..buffer.len() - 3]).await?;
        drop(stream);

        server.await?;
        Ok(())
    }
}
