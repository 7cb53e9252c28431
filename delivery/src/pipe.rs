//! Streams a JSON encoding into a request body while the transport is writing it.

use crate::errors::SendError;
use bytes::Bytes;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const CHUNK_SIZE: usize = 8 * 1024;
const CHANNEL_DEPTH: usize = 4;
// How long to wait for the encoder once the response has been read.
const ENCODER_GRACE: Duration = Duration::from_secs(1);

type Chunk = Result<Bytes, io::Error>;

/// The blocking task producing a streamed request body.
pub(crate) struct EncodeTask {
    handle: JoinHandle<Result<(), serde_json::Error>>,
}

/// Returns a request body that is filled while the transport consumes it.
pub(crate) fn encode_streaming<T>(value: Arc<T>) -> (reqwest::Body, EncodeTask)
where
    T: Serialize + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);

    let handle = tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
            closed: false,
        };
        let result = serde_json::to_writer(&mut writer, value.as_ref())
            .and_then(|()| writer.flush().map_err(serde_json::Error::io));

        match result {
            Ok(()) => Ok(()),
            // The transport stopped reading. That is reported by the transport itself.
            Err(_) if writer.closed => Ok(()),
            Err(err) => {
                let _ = writer
                    .tx
                    .blocking_send(Err(io::Error::other("request body encoding failed")));
                Err(err)
            }
        }
    });

    let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
    (body, EncodeTask { handle })
}

impl EncodeTask {
    /// Reports an encoding failure once the transport call has completed.
    pub async fn finish(self) -> Result<(), SendError> {
        match tokio::time::timeout(ENCODER_GRACE, self.handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(SendError::Encode(err)),
            Ok(Err(join_err)) => Err(SendError::Encode(serde_json::Error::io(io::Error::other(
                join_err,
            )))),
            Err(_) => {
                tracing::debug!("request body encoder still running after response");
                Ok(())
            }
        }
    }

    /// Replaces a transport failure with the encoding failure that caused it, if any.
    pub async fn explain(self, err: SendError) -> SendError {
        if matches!(err, SendError::Cancelled) {
            return err;
        }
        match self.finish().await {
            Err(encode) => encode,
            Ok(()) => err,
        }
    }
}

struct ChannelWriter {
    tx: mpsc::Sender<Chunk>,
    buf: Vec<u8>,
    closed: bool,
}

impl ChannelWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            self.closed = true;
            io::Error::from(io::ErrorKind::BrokenPipe)
        })
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
