use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest request line accepted, excluding the trailing CRLF.
pub const MAX_LINE_LEN: usize = 224;

/// A body read by [`LineReader::read_body`].
#[derive(Debug, Eq, PartialEq)]
pub enum Body {
    Data(Bytes),
    /// The expected number of bytes arrived, but not followed by CRLF. The
    /// bytes are discarded.
    MissingCrlf,
}

/// Reads CRLF-terminated request lines, and fixed-size bodies, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Data that's been read in but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which a CRLF pair may appear (and before which one
    /// hasn't been seen).
    maybe_crlf_from: usize,
    /// Lines longer than this are rejected.
    max_line_len: usize,
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    pub fn with_max_line_len(reader: T, max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            max_line_len,
            reader,
            pending_error: None,
        }
    }

    /// Reads more data into the buffer, returning how many bytes arrived.
    /// Read errors are stashed and surface as a zero-length read.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }

    /// Reports end-of-stream, or the stashed read error if there was one.
    fn end_of_stream<R>(&mut self) -> io::Result<Option<R>> {
        match self.pending_error.take() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Reads a line, without its CRLF, from the internal buffer and/or
    /// reader. On end-of-stream, returns `None`, discarding any partly-read
    /// line.
    ///
    /// A line longer than the configured maximum fails with
    /// [`io::ErrorKind::InvalidData`]; the connection can't be resynchronised
    /// after that and should be closed.
    ///
    /// This is cancel-safe: its only async operation is a `read_buf` against
    /// the internal reader, whose results are kept in the internal buffer.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data in case a \r arrived
            // at the end of the previous read and its \n at the start of this
            // one. Pipelined lines are drained from the buffer before any
            // further read happens.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let line_len = self.maybe_crlf_from + eoc;
                let line = self.buf.split_to(line_len + 2).freeze();
                self.maybe_crlf_from = 0;

                if line_len > self.max_line_len {
                    return Err(line_too_long());
                }
                return Ok(Some(line.slice(0..line_len)));
            }

            // Two bytes of slack: the buffer may hold a full-length line plus
            // a \r still waiting for its \n.
            if self.buf.len() > self.max_line_len + 1 {
                return Err(line_too_long());
            }

            let n_bytes_read = self.fill().await;

            // Point maybe_crlf_from at the byte before the first byte just
            // read (or 0 if buf was empty).
            self.maybe_crlf_from =
                self.buf.len().saturating_sub(n_bytes_read + 1);

            if n_bytes_read == 0 {
                return self.end_of_stream();
            }
        }
    }

    /// Reads exactly `n_bytes` of body followed by CRLF. Returns `None` on
    /// end-of-stream before the body is complete.
    ///
    /// Cancel-safe in the same way as [`read_line`](Self::read_line).
    pub async fn read_body(
        &mut self,
        n_bytes: usize,
    ) -> io::Result<Option<Body>> {
        let wanted = n_bytes + 2;

        while self.buf.len() < wanted {
            if self.fill().await == 0 {
                return self.end_of_stream();
            }
        }

        let chunk = self.buf.split_to(wanted).freeze();
        self.maybe_crlf_from = 0;

        if &chunk[n_bytes..] == b"\r\n" {
            Ok(Some(Body::Data(chunk.slice(0..n_bytes))))
        } else {
            Ok(Some(Body::MissingCrlf))
        }
    }
}

fn line_too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "request line too long")
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self::with_max_line_len(value, MAX_LINE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test_reassembles_lines() {
        // When properly read, each nth line should read b"test:{n}".
        let tests: &[&[u8]] = &[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined: simple
            b"test:4\r\ntest:5\r\n",
            // Pipelined: split LF
            b"test:6\r",
            b"\ntest:7\r\n",
            // Pipelined: split CRLF
            b"test:8",
            b"\r\ntest:9\r\n",
        ];

        // The buffer is large enough never to fill; yielding between writes
        // keeps the reads fragmented as listed.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_bodies_between_lines() {
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in [
                &b"log 1 5\r\nhel"[..],
                b"lo\r\n",
                b"log 1 3\r\nabcXY",
                b"next\r\n",
            ] {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "log 1 5");
        assert_eq!(
            lr.read_body(5).await.unwrap(),
            Some(Body::Data(Bytes::from_static(b"hello")))
        );
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "log 1 3");
        assert_eq!(lr.read_body(3).await.unwrap(), Some(Body::MissingCrlf));
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "next");
        assert!(lr.read_body(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_long_lines() {
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            client.write_all(b"ok\r\n").await.unwrap();
            client.write_all(&[b'a'; 64]).await.unwrap();
            client.write_all(b"\r\n").await.unwrap();
        });

        let mut lr = LineReader::with_max_line_len(server, 16);

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "ok");
        let err = lr.read_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
