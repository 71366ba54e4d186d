//! A [`ninep::transport::Transport`] over any split `AsyncRead`/
//! `AsyncWrite` stream, framed with `tokio_util`'s length-delimited
//! codec the same way the teacher's server loop framed its TCP/Unix
//! connections: a 4-byte little-endian length prefix that counts
//! itself in, consumed on read and re-added on write so the rest of
//! this crate only ever deals in whole frames.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ninep::error::Error;
use ninep::transport::Transport;
use ninep::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_codec()
}

pub struct StreamTransport<R, W> {
    reader: Mutex<FramedRead<R, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> StreamTransport<R, W> {
        StreamTransport {
            reader: Mutex::new(FramedRead::new(reader, codec())),
            writer: Mutex::new(FramedWrite::new(writer, codec())),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, buf: &[u8]) -> Result<()> {
        // `buf` is encode_frame's output (prefix included); the codec
        // writes its own prefix, so only the body is handed to it.
        let body = buf.get(4..).ok_or_else(|| Error::backend("short frame"))?;
        self.writer
            .lock()
            .await
            .send(Bytes::copy_from_slice(body))
            .await
            .map_err(Error::Io)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let next = self.reader.lock().await.next().await;
        match next {
            None => Ok(None),
            Some(Err(e)) => Err(Error::Io(e)),
            Some(Ok(body)) => {
                let mut frame = Vec::with_capacity(body.len() + 4);
                frame.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
                frame.extend_from_slice(&body);
                Ok(Some(frame))
            }
        }
    }
}
