use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::crypt::{bz2_compress, bz2_decompress};
use crate::destination::link::Link;
use crate::error::RnsError;

/// System message type carrying stream data. User types stay below 0xF000.
pub const STREAM_DATA_MSGTYPE: u16 = 0xFF00;

pub const STREAM_ID_MAX: u16 = 0x3FFF;
const HEADER_EOF: u16 = 0x8000;
const HEADER_COMPRESSED: u16 = 0x4000;

/// One slice of a byte stream: a u16 header packing the stream id with EOF
/// and compression flags, followed by the (possibly bz2) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDataMessage {
    pub stream_id: u16,
    pub data: Vec<u8>,
    pub eof: bool,
}

impl StreamDataMessage {
    pub fn new(stream_id: u16, data: &[u8], eof: bool) -> Self {
        Self { stream_id, data: data.to_vec(), eof }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut header = self.stream_id & STREAM_ID_MAX;
        if self.eof {
            header |= HEADER_EOF;
        }

        // Ship compressed only when it actually helps.
        let mut body = self.data.clone();
        if let Ok(compressed) = bz2_compress(&self.data) {
            if !self.data.is_empty() && compressed.len() < self.data.len() {
                header |= HEADER_COMPRESSED;
                body = compressed;
            }
        }

        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&header.to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < 2 {
            return Err(RnsError::Malformed);
        }

        let header = u16::from_be_bytes([raw[0], raw[1]]);
        let stream_id = header & STREAM_ID_MAX;
        let eof = (header & HEADER_EOF) != 0;
        let compressed = (header & HEADER_COMPRESSED) != 0;

        let data = if compressed { bz2_decompress(&raw[2..])? } else { raw[2..].to_vec() };

        Ok(Self { stream_id, data, eof })
    }
}

pub type ReadyCallback = Box<dyn FnMut(usize)>;

/// Receive-side state of one stream, shared between the channel dispatcher
/// and the reader handle.
pub struct StreamRx {
    buffer: VecDeque<u8>,
    eof: bool,
    ready_callback: Option<ReadyCallback>,
}

impl StreamRx {
    pub(crate) fn new() -> Self {
        Self { buffer: VecDeque::new(), eof: false, ready_callback: None }
    }

    pub(crate) fn push(&mut self, message: &StreamDataMessage) {
        self.buffer.extend(message.data.iter().copied());
        if message.eof {
            self.eof = true;
        }
    }

    pub(crate) fn take_callback(&mut self) -> Option<ReadyCallback> {
        self.ready_callback.take()
    }

    pub(crate) fn restore_callback(&mut self, callback: ReadyCallback) {
        self.ready_callback = Some(callback);
    }

    pub(crate) fn available(&self) -> usize {
        self.buffer.len()
    }
}

/// Read half of a stream over a channel. Compatible with line-oriented use:
/// `readline` hands back `\n`-terminated slices as they complete.
pub struct RawChannelReader {
    stream_id: u16,
    state: Rc<RefCell<StreamRx>>,
}

impl RawChannelReader {
    pub fn new(stream_id: u16, channel: &mut crate::channel::Channel) -> Self {
        let state = channel.attach_stream(stream_id & STREAM_ID_MAX);
        Self { stream_id: stream_id & STREAM_ID_MAX, state }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Bytes currently buffered.
    pub fn ready(&self) -> usize {
        self.state.borrow().available()
    }

    /// Registers a callback invoked with the available byte count whenever
    /// new stream data lands.
    pub fn set_ready_callback<F>(&self, callback: F)
    where
        F: FnMut(usize) + 'static,
    {
        self.state.borrow_mut().ready_callback = Some(Box::new(callback));
    }

    /// Pulls up to `buf.len()` bytes; 0 at EOF or when nothing is buffered.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let count = buf.len().min(state.buffer.len());
        for slot in buf.iter_mut().take(count) {
            *slot = state.buffer.pop_front().unwrap_or(0);
        }
        count
    }

    /// Returns the next `\n`-terminated line (delimiter included), or the
    /// trailing unterminated slice once EOF has been signalled.
    pub fn readline(&self) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();

        if let Some(position) = state.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = state.buffer.drain(..=position).collect();
            return Some(line);
        }

        if state.eof && !state.buffer.is_empty() {
            let rest: Vec<u8> = state.buffer.drain(..).collect();
            return Some(rest);
        }

        None
    }

    pub fn at_eof(&self) -> bool {
        let state = self.state.borrow();
        state.eof && state.buffer.is_empty()
    }

    pub fn close(self, channel: &mut crate::channel::Channel) {
        channel.detach_stream(self.stream_id);
    }
}

/// Write half of a stream over a channel. Writes frame into stream data
/// messages and stop early when the channel window is full; callers retry
/// the remainder after pumping the core.
pub struct RawChannelWriter {
    stream_id: u16,
}

impl RawChannelWriter {
    pub fn new(stream_id: u16) -> Self {
        Self { stream_id: stream_id & STREAM_ID_MAX }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Queues as much of `data` as the channel window allows and reports the
    /// number of bytes consumed.
    pub fn write(&self, link: &mut Link, data: &[u8]) -> Result<usize, RnsError> {
        // Compression can only shrink the body, so sizing chunks on the raw
        // length keeps every message within the channel MDU.
        let chunk_size = link.channel_mut().max_data_len() - 2;
        let mut written = 0;

        for chunk in data.chunks(chunk_size) {
            if !link.channel_ready() {
                break;
            }

            let message = StreamDataMessage::new(self.stream_id, chunk, false);
            match link.channel_send(STREAM_DATA_MSGTYPE, message.pack()) {
                Ok(_) => written += chunk.len(),
                Err(RnsError::Capacity) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(written)
    }

    /// Everything is sent as it is written.
    pub fn flush(&self, _link: &mut Link) -> Result<(), RnsError> {
        Ok(())
    }

    /// Signals EOF to the reading side.
    pub fn close(&self, link: &mut Link) -> Result<(), RnsError> {
        let message = StreamDataMessage::new(self.stream_id, &[], true);
        link.channel_send(STREAM_DATA_MSGTYPE, message.pack())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RawChannelReader, StreamDataMessage, STREAM_DATA_MSGTYPE};
    use crate::channel::Channel;

    #[test]
    fn stream_message_roundtrip() {
        let message = StreamDataMessage::new(7, b"stream payload", true);
        let decoded = StreamDataMessage::unpack(&message.pack()).expect("unpack");

        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.data, b"stream payload");
        assert!(decoded.eof);
    }

    #[test]
    fn compressible_payload_shrinks_on_the_wire() {
        let data = vec![b'A'; 4096];
        let message = StreamDataMessage::new(1, &data, false);

        let packed = message.pack();
        assert!(packed.len() < data.len());

        let decoded = StreamDataMessage::unpack(&packed).expect("unpack");
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn reader_reassembles_and_reads_lines() {
        let mut channel = Channel::new(400);
        let reader = RawChannelReader::new(3, &mut channel);

        let first = super::super::Envelope {
            msgtype: STREAM_DATA_MSGTYPE,
            sequence: 0,
            data: StreamDataMessage::new(3, b"line one\nline ", false).pack(),
        };
        let second = super::super::Envelope {
            msgtype: STREAM_DATA_MSGTYPE,
            sequence: 1,
            data: StreamDataMessage::new(3, b"two", true).pack(),
        };

        channel.receive(&first.pack()).expect("receive");
        channel.receive(&second.pack()).expect("receive");

        assert_eq!(reader.readline().expect("line"), b"line one\n");
        assert_eq!(reader.readline().expect("rest"), b"line two");
        assert!(reader.at_eof());
    }

    #[test]
    fn reader_ready_counts_buffered_bytes() {
        let mut channel = Channel::new(400);
        let reader = RawChannelReader::new(9, &mut channel);

        let envelope = super::super::Envelope {
            msgtype: STREAM_DATA_MSGTYPE,
            sequence: 0,
            data: StreamDataMessage::new(9, b"abcdef", false).pack(),
        };
        channel.receive(&envelope.pack()).expect("receive");

        assert_eq!(reader.ready(), 6);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.ready(), 2);
    }
}
