// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::poll_fn, mem, pin::Pin, task::Poll, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::enums::ProtocolVersion,
    client::common::io_with_timeout,
    models::{
        command::Command,
        decode::decode,
        encode::encode_command,
        error::{ClientError, DecodeError},
        value::Value,
    },
};

const READ_CHUNK: usize = 8 * 1024;

/// Growable read buffer feeding the incremental decoder.
///
/// Decoding freezes the buffered bytes so bulk payloads in the decoded
/// value are zero-copy slices; whatever the frame did not consume is
/// reclaimed (without copying while no value holds a slice of it) as
/// the next buffer. The decoder keeps no borrow between calls, so the
/// buffer is free to reallocate and compact.
#[derive(Debug, Default)]
pub(crate) struct ReadBuffer {
    buf: BytesMut,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The unread bytes, for diagnostics; decoding goes through
    /// [`ReadBuffer::try_decode`].
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n.min(self.buf.len()));
    }

    /// Attempts to decode one frame from the buffered bytes.
    pub fn try_decode(
        &mut self,
        version: ProtocolVersion,
    ) -> Result<Option<Value>, DecodeError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let frozen = mem::take(&mut self.buf).freeze();
        match decode(&frozen, version) {
            Ok(Some((value, consumed))) => {
                let rest = frozen.slice(consumed..);
                drop(frozen);
                self.buf = reclaim(rest);
                Ok(Some(value))
            },
            Ok(None) => {
                self.buf = reclaim(frozen);
                Ok(None)
            },
            // Fatal: the connection is about to close, the buffer
            // contents no longer matter.
            Err(e) => Err(e),
        }
    }

    /// Reads until at least `min` new bytes arrived. EOF surfaces as
    /// `ClosedByPeer`; the caller decides whether that is a clean close
    /// or a mid-frame truncation.
    pub async fn fill<S>(
        &mut self,
        stream: &mut S,
        min: usize,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + Unpin,
    {
        self.buf.reserve(min.max(READ_CHUNK));
        let mut appended = 0;
        while appended < min {
            let n = io_with_timeout(
                "read fill",
                stream.read_buf(&mut self.buf),
                deadline,
                cancel,
            )
            .await?;
            if n == 0 {
                return Err(ClientError::ClosedByPeer);
            }
            appended += n;
        }
        Ok(())
    }

    /// Appends whatever the transport already has, without waiting.
    /// Returns the number of bytes appended; zero means the socket had
    /// nothing ready. EOF still surfaces as `ClosedByPeer`.
    pub async fn fill_ready<S>(&mut self, stream: &mut S) -> Result<usize, ClientError>
    where
        S: AsyncRead + Unpin,
    {
        let mut total = 0;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let probe = poll_fn(|cx| {
                let mut read_buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(read_buf.filled().len()))),
                    Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                    // Nothing buffered in the kernel right now; this
                    // probe does not wait for more.
                    Poll::Pending => Poll::Ready(None),
                }
            })
            .await;
            match probe {
                None => return Ok(total),
                Some(Ok(0)) => return Err(ClientError::ClosedByPeer),
                Some(Ok(n)) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    total += n;
                },
                Some(Err(e)) => return Err(ClientError::Io(e)),
            }
        }
    }
}

/// Turns a `Bytes` tail back into the working buffer; zero-copy when
/// nothing else references it, one small copy otherwise.
fn reclaim(rest: Bytes) -> BytesMut {
    rest.try_into_mut()
        .unwrap_or_else(|shared| BytesMut::from(&shared[..]))
}

/// Growable write buffer; commands accumulate and flush as one write.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    buf: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn push_command(&mut self, cmd: &Command) {
        encode_command(cmd, &mut self.buf);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drains the buffer fully or fails; partial writes never linger.
    pub async fn flush<S>(
        &mut self,
        stream: &mut S,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>
    where
        S: AsyncWrite + Unpin,
    {
        if self.buf.is_empty() {
            return Ok(());
        }
        io_with_timeout(
            "write flush",
            stream.write_all_buf(&mut self.buf),
            deadline,
            cancel,
        )
        .await?;
        io_with_timeout("write flush", stream.flush(), deadline, cancel).await?;
        Ok(())
    }

    /// Discards anything not yet flushed.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
