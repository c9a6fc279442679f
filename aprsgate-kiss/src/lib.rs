//! KISS framing
//!
//! KISS is the framing protocol spoken between a host and a TNC, over
//! serial or TCP. Frames are delimited by `FEND` bytes; a command byte
//! follows the opening delimiter (port in the high nibble, command in the
//! low nibble), and `FEND`/`FESC` occurrences inside the payload are
//! escaped with two-byte sequences. Data frames carry one raw AX.25 frame.
//!
//! This is a byte-oriented protocol; nothing here may pass through a
//! text-stripping layer.

pub mod ax25;

use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

/// frame delimiter
pub const FEND: u8 = 0xc0;
/// escape introducer
pub const FESC: u8 = 0xdb;
/// escaped `FEND`
pub const TFEND: u8 = 0xdc;
/// escaped `FESC`
pub const TFESC: u8 = 0xdd;

const RECEIVE_BUFFER_SIZE: usize = 1024;

/// an AX.25 frame for a full 8-element path tops out well below this
const MAX_PAYLOAD_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("kiss decode error")]
pub enum Error {
    Io(#[from] std::io::Error),
    #[error("frame exceeds {MAX_PAYLOAD_SIZE} bytes")]
    FrameTooLong,
}

/// KISS command, the low nibble of the byte following the opening `FEND`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Data,
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    FullDuplex,
    SetHardware,
    Return,
    Unknown(u8),
}

impl Command {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0f {
            0 => Command::Data,
            1 => Command::TxDelay,
            2 => Command::Persistence,
            3 => Command::SlotTime,
            4 => Command::TxTail,
            5 => Command::FullDuplex,
            6 => Command::SetHardware,
            15 => Command::Return,
            other => Command::Unknown(other),
        }
    }

    pub fn as_nibble(&self) -> u8 {
        match self {
            Command::Data => 0,
            Command::TxDelay => 1,
            Command::Persistence => 2,
            Command::SlotTime => 3,
            Command::TxTail => 4,
            Command::FullDuplex => 5,
            Command::SetHardware => 6,
            Command::Return => 15,
            Command::Unknown(other) => *other & 0x0f,
        }
    }
}

/// One decoded KISS frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub port: u8,
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(port: u8, payload: Bytes) -> Self {
        Self {
            port,
            command: Command::Data,
            payload,
        }
    }

    /// Encode with delimiters and payload escaping.
    pub fn encode_into(&self, buffer: &mut BytesMut) {
        buffer.reserve(self.payload.len() + 4);
        buffer.put_u8(FEND);
        buffer.put_u8((self.port << 4) | self.command.as_nibble());
        for byte in &self.payload {
            match *byte {
                FEND => buffer.put_slice(&[FESC, TFEND]),
                FESC => buffer.put_slice(&[FESC, TFESC]),
                byte => buffer.put_u8(byte),
            }
        }
        buffer.put_u8(FEND);
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        self.encode_into(&mut buffer);
        buffer.freeze()
    }
}

pin_project! {
    /// Incremental KISS frame reader over any [`AsyncRead`].
    ///
    /// Bytes between frames are discarded; empty frames (back-to-back
    /// `FEND`s, used as keep-alive padding by some TNCs) are skipped.
    #[derive(Debug)]
    pub struct FrameReader<R> {
        #[pin]
        reader: R,
        receive_buffer: [u8; RECEIVE_BUFFER_SIZE],
        receive_buffer_len: usize,
        receive_buffer_pos: usize,
        decoder: Decoder,
    }
}

impl<R> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            receive_buffer: [0; RECEIVE_BUFFER_SIZE],
            receive_buffer_len: 0,
            receive_buffer_pos: 0,
            decoder: Decoder::default(),
        }
    }
}

impl<R: AsyncRead> Stream for FrameReader<R> {
    type Item = Result<Frame, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            while this.receive_buffer_pos < this.receive_buffer_len {
                let byte = this.receive_buffer[*this.receive_buffer_pos];
                *this.receive_buffer_pos += 1;

                match this.decoder.push(byte) {
                    Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                    Ok(None) => {}
                    Err(error) => return Poll::Ready(Some(Err(error))),
                }
            }

            let mut read_buf = ReadBuf::new(this.receive_buffer);
            match this.reader.poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                Poll::Ready(Ok(())) => {
                    let num_bytes_read = read_buf.filled().len();
                    if num_bytes_read == 0 {
                        return Poll::Ready(None);
                    }
                    *this.receive_buffer_len = num_bytes_read;
                    *this.receive_buffer_pos = 0;
                }
            }
        }
    }
}

/// Byte-at-a-time KISS frame decoder, usable without an async reader (the
/// UDP source feeds whole datagrams through it).
#[derive(Debug, Default)]
pub struct Decoder {
    state: DecoderState,
}

#[derive(Debug, Default)]
enum DecoderState {
    /// between frames, waiting for a `FEND`
    #[default]
    Idle,
    /// after the opening `FEND`, waiting for the command byte
    Command,
    InFrame {
        port: u8,
        command: Command,
        payload: BytesMut,
        escaped: bool,
    },
}

impl Decoder {
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, Error> {
        match &mut self.state {
            DecoderState::Idle => {
                if byte == FEND {
                    self.state = DecoderState::Command;
                }
                Ok(None)
            }
            DecoderState::Command => {
                if byte != FEND {
                    self.state = DecoderState::InFrame {
                        port: byte >> 4,
                        command: Command::from_nibble(byte),
                        payload: BytesMut::new(),
                        escaped: false,
                    };
                }
                Ok(None)
            }
            DecoderState::InFrame {
                port,
                command,
                payload,
                escaped,
            } => {
                if *escaped {
                    match byte {
                        TFEND => payload.put_u8(FEND),
                        TFESC => payload.put_u8(FESC),
                        // invalid escape, keep the byte as-is
                        byte => payload.put_u8(byte),
                    }
                    *escaped = false;
                    Ok(None)
                }
                else if byte == FESC {
                    *escaped = true;
                    Ok(None)
                }
                else if byte == FEND {
                    let frame = Frame {
                        port: *port,
                        command: *command,
                        payload: std::mem::take(payload).freeze(),
                    };
                    self.state = DecoderState::Command;
                    Ok(Some(frame))
                }
                else if payload.len() >= MAX_PAYLOAD_SIZE {
                    self.state = DecoderState::Idle;
                    Err(Error::FrameTooLong)
                }
                else {
                    payload.put_u8(byte);
                    Ok(None)
                }
            }
        }
    }

    /// Decode all complete frames contained in one buffer, dropping
    /// malformed content. Used for KISS-in-UDP datagrams.
    pub fn decode_buffer(buffer: &[u8]) -> Vec<Frame> {
        let mut decoder = Decoder::default();
        let mut frames = Vec::new();
        for byte in buffer {
            if let Ok(Some(frame)) = decoder.push(*byte) {
                frames.push(frame);
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::TryStreamExt;

    use crate::{
        Command,
        Decoder,
        FEND,
        Frame,
        FrameReader,
    };

    #[test]
    fn it_escapes_and_unescapes() {
        let frame = Frame::data(0, Bytes::from_static(&[0x01, 0xc0, 0x02, 0xdb, 0x03]));
        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            &[0xc0, 0x00, 0x01, 0xdb, 0xdc, 0x02, 0xdb, 0xdd, 0x03, 0xc0]
        );

        let frames = Decoder::decode_buffer(&encoded);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn it_carries_port_and_command() {
        let frame = Frame {
            port: 2,
            command: Command::TxDelay,
            payload: Bytes::from_static(&[50]),
        };
        let frames = Decoder::decode_buffer(&frame.encode());
        assert_eq!(frames[0].port, 2);
        assert_eq!(frames[0].command, Command::TxDelay);
    }

    #[test]
    fn it_skips_garbage_between_frames() {
        let mut buffer = vec![0x41, 0x42, 0x43];
        buffer.extend_from_slice(&Frame::data(0, Bytes::from_static(b"hello")).encode());
        let frames = Decoder::decode_buffer(&buffer);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn it_skips_empty_frames() {
        // back-to-back FENDs between two data frames
        let mut buffer = Frame::data(0, Bytes::from_static(b"a")).encode().to_vec();
        buffer.push(FEND);
        buffer.push(FEND);
        buffer.extend_from_slice(&Frame::data(0, Bytes::from_static(b"b")).encode());

        let frames = Decoder::decode_buffer(&buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].payload[..], b"a");
        assert_eq!(&frames[1].payload[..], b"b");
    }

    #[tokio::test]
    async fn it_reads_frames_from_a_stream() {
        let mut buffer = Frame::data(0, Bytes::from_static(b"first")).encode().to_vec();
        buffer.extend_from_slice(&Frame::data(1, Bytes::from_static(b"second")).encode());

        let mut reader = FrameReader::new(&buffer[..]);
        let first = reader.try_next().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        let second = reader.try_next().await.unwrap().unwrap();
        assert_eq!(second.port, 1);
        assert_eq!(reader.try_next().await.unwrap(), None);
    }
}
