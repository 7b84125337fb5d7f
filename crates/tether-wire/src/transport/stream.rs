//! Length-prefixed framing over any async byte stream.
//!
//! Frame format: `[4-byte big-endian length][UTF-8 JSON text]`.

use super::{InboundHandler, Transport, TransportError};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, raw: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(raw.len()).unwrap_or(u32::MAX);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(raw.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. A clean end of stream yields
/// [`TransportError::Closed`].
pub async fn read_frame<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(String::from_utf8(body)?)
}

/// A transport over a split byte stream.
///
/// Outbound messages are queued and written by a background task. Reading
/// starts when the inbound handler is installed, so nothing the peer sends
/// before then is lost.
pub struct StreamTransport {
    runtime: Handle,
    outbound: mpsc::UnboundedSender<String>,
    reader: Mutex<Option<BoxedReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: JoinHandle<()>,
}

impl StreamTransport {
    /// Wrap a reader/writer pair. Must be called from within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Result<Self, TransportError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let runtime =
            Handle::try_current().map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let write_task = runtime.spawn(write_loop(writer, rx));
        Ok(Self {
            runtime,
            outbound: tx,
            reader: Mutex::new(Some(Box::new(reader))),
            read_task: Mutex::new(None),
            write_task,
        })
    }

    /// Wrap a connected TCP socket.
    pub fn from_tcp(stream: TcpStream) -> Result<Self, TransportError> {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(raw) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &raw).await {
            warn!(error = %e, "stream transport write failed, closing");
            break;
        }
    }
}

async fn read_loop(mut reader: BoxedReader, handler: InboundHandler) {
    loop {
        match read_frame(&mut reader).await {
            Ok(raw) => handler(raw),
            Err(TransportError::Closed) => {
                debug!("stream transport closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stream transport read failed");
                break;
            }
        }
    }
}

impl Transport for StreamTransport {
    fn on(&self, handler: InboundHandler) {
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(reader) = reader else {
            warn!("stream transport already has a reader attached");
            return;
        };
        let task = self.runtime.spawn(read_loop(reader, handler));
        *self.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    fn emit(&self, raw: String) -> Result<(), TransportError> {
        if self.write_task.is_finished() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(raw).map_err(|_| TransportError::Closed)
    }

    fn off(&self) {
        if let Some(task) = self.read_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.off();
    }
}
