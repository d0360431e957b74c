// Length-prefixed framing.
//
// Wire format, all integers big-endian:
//
//     [4 bytes: i32 payload length][1 byte: tag][payload]
//
// Two flavors share the header codec:
// - `write_frame` / `read_frame` for blocking `Read`/`Write` streams (tests,
//   the admin console before its reactor starts).
// - `FrameReader` / `FrameWriter` for non-blocking sockets. Each keeps its
//   phase (header or body) and byte offset between calls, so a frame can
//   arrive or leave across any number of readiness events. A reader never
//   reads past the end of the frame it is assembling, which lets a reactor
//   pause a socket right after one frame and hand it to another reactor with
//   nothing buffered on the side.
//
// The maximum payload size (default `MAX_MESSAGE_SIZE`, 16 MB) bounds the
// allocation a malformed length prefix can force. Body buffers are reserved
// fallibly; an allocation failure is reported as a protocol error.

use std::io::{self, Read, Write};

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::{Envelope, Tag};

/// Header size: 4 length bytes plus the tag byte.
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a single payload.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("tag {0} is outside the reserved range")]
    TagOutOfRange(u8),
    #[error("negative payload length {0}")]
    NegativeLength(i32),
    #[error("payload too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("could not allocate a {0} byte payload buffer")]
    AllocationFailed(usize),
    #[error("end of stream")]
    Eof,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Errors caused by the bytes the peer sent, as opposed to the transport.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::TagOutOfRange(_)
                | FrameError::NegativeLength(_)
                | FrameError::TooLarge { .. }
                | FrameError::AllocationFailed(_)
        )
    }
}

pub fn encode_header(tag: Tag, len: usize) -> Result<[u8; HEADER_LEN], FrameError> {
    let wire_len = i32::try_from(len).map_err(|_| FrameError::TooLarge {
        len,
        max: i32::MAX as usize,
    })?;
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&wire_len.to_be_bytes());
    header[4] = tag.as_u8();
    Ok(header)
}

pub fn decode_header(
    header: &[u8; HEADER_LEN],
    max_len: usize,
) -> Result<(Tag, usize), FrameError> {
    let tag = Tag::try_from(header[4])?;
    let len = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if len < 0 {
        return Err(FrameError::NegativeLength(len));
    }
    let len = len as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    Ok((tag, len))
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError> {
    let max = MAX_MESSAGE_SIZE as usize;
    if envelope.len() > max {
        return Err(FrameError::TooLarge {
            len: envelope.len(),
            max,
        });
    }
    let header = encode_header(envelope.tag(), envelope.len())?;
    writer.write_all(&header)?;
    writer.write_all(envelope.payload())?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking stream.
///
/// Returns `FrameError::Eof` if the stream closes before or during the frame.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Envelope, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(reader, &mut header)?;
    let (tag, len) = decode_header(&header, max_len)?;
    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|_| FrameError::AllocationFailed(len))?;
    payload.resize(len, 0);
    read_exact(reader, &mut payload)?;
    Ok(Envelope::new(tag, payload))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(e)
        }
    })
}

// ---------------------------------------------------------------------------
// Incremental reader
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPhase {
    Idle,
    ReadingMeta,
    ReadingBody,
}

#[derive(Debug)]
pub enum ReadProgress {
    Complete(Envelope),
    /// The source would block. The reader may be idle or mid-frame.
    Pending,
}

#[derive(Debug)]
enum ReadState {
    Meta {
        header: [u8; HEADER_LEN],
        filled: usize,
    },
    Body {
        tag: Tag,
        body: Vec<u8>,
        filled: usize,
    },
}

impl ReadState {
    fn idle() -> Self {
        ReadState::Meta {
            header: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Assembles frames from a non-blocking source, one at a time.
#[derive(Debug)]
pub struct FrameReader {
    state: ReadState,
    max_len: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE as usize)
    }
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: ReadState::idle(),
            max_len,
        }
    }

    /// Read until a frame completes or the source would block.
    ///
    /// Any error leaves the reader idle; the caller is expected to tear the
    /// connection down.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<ReadProgress, FrameError> {
        let result = self.pump(reader);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn pump<R: Read>(&mut self, reader: &mut R) -> Result<ReadProgress, FrameError> {
        loop {
            let target: &mut [u8] = match &mut self.state {
                ReadState::Meta { header, filled } => &mut header[*filled..],
                ReadState::Body { body, filled, .. } => &mut body[*filled..],
            };
            let n = match reader.read(target) {
                Ok(0) => return Err(FrameError::Eof),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadProgress::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FrameError::Io(e)),
            };
            if let Some(envelope) = self.advance(n)? {
                return Ok(ReadProgress::Complete(envelope));
            }
        }
    }

    fn advance(&mut self, n: usize) -> Result<Option<Envelope>, FrameError> {
        match std::mem::replace(&mut self.state, ReadState::idle()) {
            ReadState::Meta { header, filled } => {
                let filled = filled + n;
                if filled < HEADER_LEN {
                    self.state = ReadState::Meta { header, filled };
                    return Ok(None);
                }
                let (tag, len) = decode_header(&header, self.max_len)?;
                if len == 0 {
                    return Ok(Some(Envelope::empty(tag)));
                }
                let mut body = Vec::new();
                body.try_reserve_exact(len)
                    .map_err(|_| FrameError::AllocationFailed(len))?;
                body.resize(len, 0);
                self.state = ReadState::Body {
                    tag,
                    body,
                    filled: 0,
                };
                Ok(None)
            }
            ReadState::Body { tag, body, filled } => {
                let filled = filled + n;
                if filled < body.len() {
                    self.state = ReadState::Body { tag, body, filled };
                    return Ok(None);
                }
                Ok(Some(Envelope::new(tag, body)))
            }
        }
    }

    pub fn phase(&self) -> ReadPhase {
        match &self.state {
            ReadState::Meta { filled: 0, .. } => ReadPhase::Idle,
            ReadState::Meta { .. } => ReadPhase::ReadingMeta,
            ReadState::Body { .. } => ReadPhase::ReadingBody,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == ReadPhase::Idle
    }

    /// Bytes accumulated in the current phase.
    pub fn transferred(&self) -> usize {
        match &self.state {
            ReadState::Meta { filled, .. } | ReadState::Body { filled, .. } => *filled,
        }
    }

    /// Payload length of the frame being assembled, once the header is in.
    pub fn declared_len(&self) -> Option<usize> {
        match &self.state {
            ReadState::Meta { .. } => None,
            ReadState::Body { body, .. } => Some(body.len()),
        }
    }

    pub fn reset(&mut self) {
        self.state = ReadState::idle();
    }
}

// ---------------------------------------------------------------------------
// Incremental writer
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritePhase {
    Idle,
    WritingMeta,
    WritingBody,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteProgress {
    /// The loaded frame is fully written.
    Complete,
    /// The sink would block mid-frame.
    Pending,
    /// Nothing was loaded.
    Idle,
}

#[derive(Debug)]
enum WriteState {
    Idle,
    Meta {
        header: [u8; HEADER_LEN],
        written: usize,
        payload: Bytes,
    },
    Body {
        payload: Bytes,
        written: usize,
    },
}

/// Transmits one frame at a time to a non-blocking sink.
#[derive(Debug)]
pub struct FrameWriter {
    state: WriteState,
    max_len: usize,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE as usize)
    }
}

impl FrameWriter {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: WriteState::Idle,
            max_len,
        }
    }

    /// Load the next frame. The writer must be idle.
    pub fn load(&mut self, envelope: &Envelope) -> Result<(), FrameError> {
        debug_assert!(self.is_idle(), "FrameWriter::load while a frame is in flight");
        if envelope.len() > self.max_len {
            return Err(FrameError::TooLarge {
                len: envelope.len(),
                max: self.max_len,
            });
        }
        let header = encode_header(envelope.tag(), envelope.len())?;
        self.state = WriteState::Meta {
            header,
            written: 0,
            payload: envelope.payload().clone(),
        };
        Ok(())
    }

    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<WriteProgress> {
        if self.is_idle() {
            return Ok(WriteProgress::Idle);
        }
        loop {
            let pending: &[u8] = match &self.state {
                WriteState::Idle => return Ok(WriteProgress::Complete),
                WriteState::Meta {
                    header, written, ..
                } => &header[*written..],
                WriteState::Body { payload, written } => &payload[*written..],
            };
            let n = match writer.write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.advance(n);
        }
    }

    fn advance(&mut self, n: usize) {
        self.state = match std::mem::replace(&mut self.state, WriteState::Idle) {
            WriteState::Meta {
                header,
                written,
                payload,
            } => {
                let written = written + n;
                if written < HEADER_LEN {
                    WriteState::Meta {
                        header,
                        written,
                        payload,
                    }
                } else if payload.is_empty() {
                    WriteState::Idle
                } else {
                    WriteState::Body {
                        payload,
                        written: 0,
                    }
                }
            }
            WriteState::Body { payload, written } => {
                let written = written + n;
                if written < payload.len() {
                    WriteState::Body { payload, written }
                } else {
                    WriteState::Idle
                }
            }
            WriteState::Idle => WriteState::Idle,
        };
    }

    pub fn phase(&self) -> WritePhase {
        match &self.state {
            WriteState::Idle => WritePhase::Idle,
            WriteState::Meta { .. } => WritePhase::WritingMeta,
            WriteState::Body { .. } => WritePhase::WritingBody,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, WriteState::Idle)
    }

    /// Bytes written in the current phase.
    pub fn transferred(&self) -> usize {
        match &self.state {
            WriteState::Idle => 0,
            WriteState::Meta { written, .. } | WriteState::Body { written, .. } => *written,
        }
    }

    pub fn reset(&mut self) {
        self.state = WriteState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Source that hands out at most `chunk` bytes per call and reports
    /// `WouldBlock` between chunks, like a slow non-blocking socket.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        stall: bool,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
                stall: false,
            }
        }

        fn drained(&self) -> bool {
            self.pos == self.data.len()
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.stall || self.drained() {
                self.stall = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.stall = true;
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Sink that accepts at most `chunk` bytes per call, alternating with
    /// `WouldBlock`.
    struct Sink {
        out: Vec<u8>,
        chunk: usize,
        stall: bool,
    }

    impl Sink {
        fn new(chunk: usize) -> Self {
            Self {
                out: Vec::new(),
                chunk,
                stall: false,
            }
        }
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.stall {
                self.stall = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.stall = true;
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::new(Tag::Session, b"first".to_vec()),
            Envelope::empty(Tag::Goodbye),
            Envelope::new(Tag::Lobby, vec![0xAB; 1000]),
        ]
    }

    fn wire(envelopes: &[Envelope]) -> Vec<u8> {
        let mut out = Vec::new();
        for envelope in envelopes {
            write_frame(&mut out, envelope).unwrap();
        }
        out
    }

    fn drain(reader: &mut FrameReader, source: &mut Trickle) -> Vec<Envelope> {
        let mut out = Vec::new();
        for _ in 0..100_000 {
            match reader.read_from(source).unwrap() {
                ReadProgress::Complete(envelope) => out.push(envelope),
                ReadProgress::Pending if source.drained() && reader.is_idle() => return out,
                ReadProgress::Pending => {}
            }
        }
        panic!("reader did not finish");
    }

    #[test]
    fn header_layout() {
        let header = encode_header(Tag::Lobby, 0x0102_0304).unwrap();
        assert_eq!(header, [0x01, 0x02, 0x03, 0x04, 4]);
    }

    #[test]
    fn blocking_roundtrip() {
        let envelopes = sample_envelopes();
        let mut cursor = Cursor::new(wire(&envelopes));
        for expected in &envelopes {
            let got = read_frame(&mut cursor, MAX_MESSAGE_SIZE as usize).unwrap();
            assert_eq!(&got, expected);
        }
        assert!(matches!(
            read_frame(&mut cursor, MAX_MESSAGE_SIZE as usize),
            Err(FrameError::Eof)
        ));
    }

    #[test]
    fn truncated_frame_is_eof() {
        let mut bytes = wire(&[Envelope::new(Tag::Session, vec![1u8; 10])]);
        bytes.truncate(8);
        let result = read_frame(&mut Cursor::new(bytes), MAX_MESSAGE_SIZE as usize);
        assert!(matches!(result, Err(FrameError::Eof)));
    }

    #[test]
    fn oversize_write_rejected() {
        let big = Envelope::new(Tag::Session, vec![0u8; MAX_MESSAGE_SIZE as usize + 1]);
        let result = write_frame(&mut Vec::new(), &big);
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn reader_assembles_across_any_chunking() {
        let envelopes = sample_envelopes();
        let bytes = wire(&envelopes);
        for chunk in [1, 2, 3, 4, 5, 6, 7, 64, 4096] {
            let mut source = Trickle::new(bytes.clone(), chunk);
            let mut reader = FrameReader::default();
            let got = drain(&mut reader, &mut source);
            assert_eq!(got, envelopes, "chunk size {chunk}");
        }
    }

    #[test]
    fn reader_reports_phases() {
        let bytes = wire(&[Envelope::new(Tag::Session, b"hello".to_vec())]);
        let mut reader = FrameReader::default();
        assert_eq!(reader.phase(), ReadPhase::Idle);

        let mut head = Trickle::new(bytes[..3].to_vec(), 3);
        assert!(matches!(
            reader.read_from(&mut head).unwrap(),
            ReadProgress::Pending
        ));
        assert_eq!(reader.phase(), ReadPhase::ReadingMeta);
        assert_eq!(reader.transferred(), 3);

        // The first call finishes the header, the second starts the body.
        let mut rest = Trickle::new(bytes[3..7].to_vec(), 2);
        assert!(matches!(
            reader.read_from(&mut rest).unwrap(),
            ReadProgress::Pending
        ));
        assert_eq!(reader.phase(), ReadPhase::ReadingBody);
        assert_eq!(reader.declared_len(), Some(5));
        assert_eq!(reader.transferred(), 0);
        assert!(matches!(
            reader.read_from(&mut rest).unwrap(),
            ReadProgress::Pending
        ));
        assert_eq!(reader.transferred(), 2);

        let mut tail = Trickle::new(bytes[7..].to_vec(), 16);
        match reader.read_from(&mut tail).unwrap() {
            ReadProgress::Complete(envelope) => assert_eq!(&envelope.payload()[..], b"hello"),
            ReadProgress::Pending => panic!("frame should be complete"),
        }
        assert!(reader.is_idle());
    }

    #[test]
    fn reader_never_consumes_past_frame_end() {
        let envelopes = sample_envelopes();
        let bytes = wire(&envelopes);
        let first_len = HEADER_LEN + envelopes[0].len();
        let mut source = Trickle::new(bytes, 4096);
        let mut reader = FrameReader::default();
        loop {
            if let ReadProgress::Complete(_) = reader.read_from(&mut source).unwrap() {
                break;
            }
        }
        assert_eq!(source.pos, first_len);
    }

    #[test]
    fn out_of_range_tag_is_protocol_error() {
        let mut bytes = wire(&[Envelope::new(Tag::Session, b"x".to_vec())]);
        bytes[4] = 0;
        let mut reader = FrameReader::default();
        let err = reader
            .read_from(&mut Trickle::new(bytes.clone(), 64))
            .unwrap_err();
        assert!(matches!(err, FrameError::TagOutOfRange(0)));
        assert!(err.is_protocol_violation());
        assert!(reader.is_idle());

        bytes[4] = 200;
        let err = reader.read_from(&mut Trickle::new(bytes, 64)).unwrap_err();
        assert!(matches!(err, FrameError::TagOutOfRange(200)));
    }

    #[test]
    fn negative_and_oversize_lengths_rejected() {
        let mut negative = (-1i32).to_be_bytes().to_vec();
        negative.push(Tag::Session.as_u8());
        let err = FrameReader::default()
            .read_from(&mut Trickle::new(negative, 64))
            .unwrap_err();
        assert!(matches!(err, FrameError::NegativeLength(-1)));

        let bytes = wire(&[Envelope::new(Tag::Session, vec![0u8; 100])]);
        let err = FrameReader::new(99)
            .read_from(&mut Trickle::new(bytes, 64))
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 100, max: 99 }));
    }

    #[test]
    fn zero_byte_read_is_eof() {
        let mut reader = FrameReader::default();
        let err = reader.read_from(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, FrameError::Eof));
        assert!(!err.is_protocol_violation());
    }

    #[test]
    fn writer_survives_partial_writes() {
        let envelopes = sample_envelopes();
        for chunk in [1, 2, 5, 9, 4096] {
            let mut sink = Sink::new(chunk);
            let mut writer = FrameWriter::default();
            for envelope in &envelopes {
                writer.load(envelope).unwrap();
                loop {
                    match writer.write_to(&mut sink).unwrap() {
                        WriteProgress::Complete => break,
                        WriteProgress::Pending => continue,
                        WriteProgress::Idle => panic!("writer lost its frame"),
                    }
                }
                assert!(writer.is_idle());
            }
            assert_eq!(sink.out, wire(&envelopes), "chunk size {chunk}");
        }
    }

    #[test]
    fn shared_payload_written_by_two_writers() {
        let envelope = Envelope::new(Tag::Lobby, (0..200u8).collect::<Vec<_>>());
        let mut a = FrameWriter::default();
        let mut b = FrameWriter::default();
        a.load(&envelope).unwrap();
        b.load(&envelope.clone()).unwrap();
        let mut sink_a = Sink::new(3);
        let mut sink_b = Sink::new(7);
        let mut done = (false, false);
        while !(done.0 && done.1) {
            if !done.0 {
                done.0 = a.write_to(&mut sink_a).unwrap() == WriteProgress::Complete;
            }
            if !done.1 {
                done.1 = b.write_to(&mut sink_b).unwrap() == WriteProgress::Complete;
            }
        }
        assert_eq!(sink_a.out, sink_b.out);
        assert_eq!(sink_a.out, wire(&[envelope]));
    }

    #[test]
    fn idle_writer_reports_idle() {
        let mut writer = FrameWriter::default();
        assert_eq!(
            writer.write_to(&mut Sink::new(8)).unwrap(),
            WriteProgress::Idle
        );
        writer.load(&Envelope::empty(Tag::Goodbye)).unwrap();
        assert_eq!(writer.phase(), WritePhase::WritingMeta);
    }
}
