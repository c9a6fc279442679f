//! Line-oriented reader for the `\r\n`-terminated text protocols
//! (APRS-IS upstream, downstream clients).

use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use bytes::Bytes;
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

use aprsgate_types::MAX_LINE_LENGTH;

// one maximum-length line plus room to batch reads
const RECEIVE_BUFFER_SIZE: usize = 2 * MAX_LINE_LENGTH;

#[derive(Debug, thiserror::Error)]
#[error("line read error")]
pub enum Error {
    Io(#[from] std::io::Error),
    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    MaxLineLengthExceeded,
}

pin_project! {
    /// Splits a byte stream into lines at `\r` or `\n`.
    ///
    /// `\r\n` produces an empty line between the two terminators; empty
    /// lines are skipped. Lines longer than the protocol maximum are an
    /// error, after which the reader resynchronizes at the next
    /// terminator.
    #[derive(Debug)]
    pub struct LineReader<R> {
        #[pin]
        reader: R,
        receive_buffer: ReceiveBuffer,
    }
}

impl<R> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            receive_buffer: ReceiveBuffer::default(),
        }
    }
}

impl<R: AsyncRead> Stream for LineReader<R> {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            match this.receive_buffer.next_line() {
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        return Poll::Ready(Some(Ok(Bytes::copy_from_slice(line))));
                    }
                }
                Ok(None) => {
                    this.receive_buffer.prepare_read();
                    let mut read_buf = ReadBuf::new(
                        &mut this.receive_buffer.buffer[this.receive_buffer.write_pos..],
                    );
                    match this.reader.poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                        Poll::Ready(Ok(())) => {
                            let num_bytes_read = read_buf.filled().len();
                            if num_bytes_read == 0 {
                                return Poll::Ready(None);
                            }
                            this.receive_buffer.write_pos += num_bytes_read;
                        }
                    }
                }
                Err(error) => return Poll::Ready(Some(Err(error))),
            }
        }
    }
}

#[derive(Debug)]
struct ReceiveBuffer {
    buffer: [u8; RECEIVE_BUFFER_SIZE],
    read_pos: usize,
    write_pos: usize,
    discarding: bool,
}

impl ReceiveBuffer {
    fn next_line(&mut self) -> Result<Option<&[u8]>, Error> {
        let newline = self.buffer[self.read_pos..self.write_pos]
            .iter()
            .position(|byte| *byte == b'\r' || *byte == b'\n')
            .map(|index| index + self.read_pos);

        if let Some(newline) = newline {
            let start = self.read_pos;
            self.read_pos = newline + 1;

            if self.discarding {
                // tail of an oversized line, skip it
                self.discarding = false;
                return Ok(Some(&[]));
            }
            if newline - start > MAX_LINE_LENGTH {
                return Err(Error::MaxLineLengthExceeded);
            }
            return Ok(Some(&self.buffer[start..newline]));
        }

        if self.write_pos - self.read_pos > MAX_LINE_LENGTH {
            // no terminator within the protocol maximum
            self.read_pos = self.write_pos;
            self.discarding = true;
            return Err(Error::MaxLineLengthExceeded);
        }

        Ok(None)
    }

    fn prepare_read(&mut self) {
        if self.read_pos > 0 {
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self {
            buffer: [0; RECEIVE_BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
            discarding: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use crate::source::line::{
        Error,
        LineReader,
    };

    #[tokio::test]
    async fn it_splits_crlf_lines_and_skips_empty_ones() {
        let input = b"first line\r\nsecond\n\r\nthird\r\n";
        let mut reader = LineReader::new(&input[..]);

        assert_eq!(&reader.try_next().await.unwrap().unwrap()[..], b"first line");
        assert_eq!(&reader.try_next().await.unwrap().unwrap()[..], b"second");
        assert_eq!(&reader.try_next().await.unwrap().unwrap()[..], b"third");
        assert_eq!(reader.try_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_trailing_unterminated_line_is_dropped() {
        let input = b"complete\r\nincomplete";
        let mut reader = LineReader::new(&input[..]);

        assert_eq!(&reader.try_next().await.unwrap().unwrap()[..], b"complete");
        assert_eq!(reader.try_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_lines_error_and_the_reader_recovers() {
        let mut input = vec![b'x'; 600];
        input.extend_from_slice(b"\r\nafter\r\n");
        let mut reader = LineReader::new(&input[..]);

        assert!(matches!(
            reader.try_next().await,
            Err(Error::MaxLineLengthExceeded)
        ));
        assert_eq!(&reader.try_next().await.unwrap().unwrap()[..], b"after");
    }

    #[tokio::test]
    async fn eight_bit_data_passes_through() {
        let input = b"N0CALL>APRS:>temp 21\xb0C\r\n";
        let mut reader = LineReader::new(&input[..]);
        assert_eq!(
            &reader.try_next().await.unwrap().unwrap()[..],
            b"N0CALL>APRS:>temp 21\xb0C"
        );
    }
}
