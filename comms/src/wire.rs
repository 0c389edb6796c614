use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::msg::Msg;

type FrameLen = u32;
const LEN_SIZE: usize = size_of::<FrameLen>();

/// One end of a connection, sending and receiving whole frames over a single stream.
///
/// Received messages borrow the endpoint's inbox, so a message must be dropped before the next
/// one is received.
pub struct Wire<S> {
    stream: S,
    head: Vec<u8>,
    inbox: Vec<u32>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Wire<S> {
    /// Creates a new `Wire` over `stream`.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            head: Vec::new(),
            inbox: Vec::new(),
        }
    }

    /// Sends `msg` as a single frame.
    ///
    /// Float payloads are written straight from the borrowed slice.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// # Returns
    /// An `io::Error` if the message doesn't fit in a frame or the stream fails.
    pub async fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        let Self { stream, head, .. } = self;

        head.clear();
        head.resize(LEN_SIZE, 0);
        let body = msg.encode(head)?;

        let len = head.len() - LEN_SIZE + body.len();
        let len = FrameLen::try_from(len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("a frame of {len} bytes is too long"),
            )
        })?;

        head[..LEN_SIZE].copy_from_slice(&len.to_be_bytes());
        stream.write_all(head).await?;

        if !body.is_empty() {
            stream.write_all(body).await?;
        }

        stream.flush().await
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Returns
    /// The message, borrowing this endpoint's inbox, or an `io::Error` if the stream fails or
    /// the frame is malformed.
    pub async fn recv(&mut self) -> io::Result<Msg<'_>> {
        let mut len_buf = [0; LEN_SIZE];
        self.stream.read_exact(&mut len_buf).await?;
        let len = FrameLen::from_be_bytes(len_buf) as usize;

        self.inbox.resize(len.div_ceil(size_of::<u32>()), 0);
        let frame = &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.inbox)[..len];
        self.stream.read_exact(frame).await?;

        Msg::decode(frame)
    }
}
