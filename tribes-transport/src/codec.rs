use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, warn};

use tribes_core::ext::read_u32;

pub const START_DATA: [u8; 7] = [70, 76, 84, 50, 48, 48, 50];
pub const END_DATA: [u8; 7] = [84, 76, 70, 50, 48, 48, 51];
pub const ACK_DATA: [u8; 3] = [6, 2, 3];
pub const FAIL_ACK_DATA: [u8; 3] = [11, 0, 5];

const HEADER_LEN: usize = START_DATA.len() + 4;
const OVERHEAD: usize = HEADER_LEN + END_DATA.len();

pub const ACK_COMMAND: [u8; OVERHEAD + 3] = frame_const(ACK_DATA);
pub const FAIL_ACK_COMMAND: [u8; OVERHEAD + 3] = frame_const(FAIL_ACK_DATA);

const fn frame_const(payload: [u8; 3]) -> [u8; OVERHEAD + 3] {
    let mut out = [0u8; OVERHEAD + 3];
    let mut i = 0;
    while i < START_DATA.len() {
        out[i] = START_DATA[i];
        i += 1;
    }
    out[HEADER_LEN - 1] = payload.len() as u8;
    let mut j = 0;
    while j < payload.len() {
        out[HEADER_LEN + j] = payload[j];
        j += 1;
    }
    let mut k = 0;
    while k < END_DATA.len() {
        out[HEADER_LEN + payload.len() + k] = END_DATA[k];
        k += 1;
    }
    out
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Ack {
    Ack,
    FailAck,
}

/// Classifies an extracted payload as one of the acknowledgement sentinels.
pub fn ack_kind(payload: &[u8]) -> Option<Ack> {
    if payload == ACK_DATA {
        Some(Ack::Ack)
    } else if payload == FAIL_ACK_DATA {
        Some(Ack::FailAck)
    } else {
        None
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io error {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame trailer, expected {:?}", END_DATA)]
    InvalidTrailer,
    #[error("frame of {0} bytes exceeds the maximum of {1}")]
    TooLarge(usize, usize),
}

fn find_start(src: &[u8]) -> Option<usize> {
    src.windows(START_DATA.len()).position(|w| w == START_DATA)
}

/// `START | u32 length | payload | END`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Length of the frame at the head of `src`, if one is fully available.
    fn complete_frame_len(&self, src: &[u8]) -> Result<Option<usize>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let body_len = read_u32(src, START_DATA.len()) as usize;
        if body_len > self.max_frame_length {
            return Err(FrameError::TooLarge(body_len, self.max_frame_length));
        }
        let total = OVERHEAD + body_len;
        if src.len() < total {
            return Ok(None);
        }
        if src[HEADER_LEN + body_len..total] != END_DATA {
            return Err(FrameError::InvalidTrailer);
        }
        Ok(Some(total))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match find_start(src) {
            None => {
                if src.len() > START_DATA.len() {
                    error!("discarded {} bytes without a frame header", src.len());
                    src.clear();
                }
                return Ok(None);
            }
            Some(0) => {}
            Some(offset) => {
                warn!("skipped {} bytes before frame header", offset);
                src.advance(offset);
            }
        }
        match self.complete_frame_len(src)? {
            None => {
                if src.len() >= HEADER_LEN {
                    let body_len = read_u32(src, START_DATA.len()) as usize;
                    src.reserve(OVERHEAD + body_len - src.len());
                }
                Ok(None)
            }
            Some(total) => {
                let mut frame = src.split_to(total);
                frame.advance(HEADER_LEN);
                frame.truncate(total - OVERHEAD);
                Ok(Some(frame.freeze()))
            }
        }
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_length || u32::try_from(item.len()).is_err() {
            return Err(FrameError::TooLarge(item.len(), self.max_frame_length));
        }
        dst.reserve(OVERHEAD + item.len());
        dst.put_slice(&START_DATA);
        dst.put_u32(item.len() as u32);
        dst.put_slice(item);
        dst.put_slice(&END_DATA);
        Ok(())
    }
}

pub fn create_data_package(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(OVERHEAD + payload.len());
    FrameCodec::default().encode(payload, &mut dst)?;
    Ok(dst.freeze())
}

/// Accumulates stream chunks and hands out complete frame payloads in arrival order.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    codec: FrameCodec,
}

impl FrameBuffer {
    pub fn new(codec: FrameCodec) -> Self {
        Self { buf: BytesMut::new(), codec }
    }

    /// Returns false when the accumulated bytes held no frame header and were dropped.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > START_DATA.len() && find_start(&self.buf).is_none() {
            error!("discarded {} bytes, invalid frame header", self.buf.len());
            self.buf.clear();
            return false;
        }
        true
    }

    pub fn has_package(&self) -> bool {
        self.count_packages() > 0
    }

    /// Counts the complete frames currently buffered without consuming them.
    pub fn count_packages(&self) -> usize {
        let mut count = 0;
        let mut pos = match find_start(&self.buf) {
            Some(pos) => pos,
            None => return 0,
        };
        while let Ok(Some(len)) = self.codec.complete_frame_len(&self.buf[pos..]) {
            count += 1;
            pos += len;
            match find_start(&self.buf[pos..]) {
                Some(offset) => pos += offset,
                None => break,
            }
        }
        count
    }

    pub fn extract_package(&mut self) -> Result<Option<Bytes>, FrameError> {
        let result = self.codec.decode(&mut self.buf);
        if result.is_err() {
            self.buf.clear();
        }
        result
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    use crate::codec::{
        ack_kind, create_data_package, Ack, FrameBuffer, FrameCodec, FrameError, ACK_COMMAND, ACK_DATA,
        FAIL_ACK_COMMAND, START_DATA,
    };

    #[test]
    fn test_ack_commands() -> anyhow::Result<()> {
        assert_eq!(
            ACK_COMMAND,
            [70, 76, 84, 50, 48, 48, 50, 0, 0, 0, 3, 6, 2, 3, 84, 76, 70, 50, 48, 48, 51]
        );
        assert_eq!(&create_data_package(&ACK_DATA)?[..], &ACK_COMMAND[..]);
        let mut buffer = FrameBuffer::default();
        buffer.append(&FAIL_ACK_COMMAND);
        let payload = buffer.extract_package()?.ok_or(anyhow::anyhow!("no package"))?;
        assert_eq!(ack_kind(&payload), Some(Ack::FailAck));
        assert_eq!(ack_kind(b"abc"), None);
        Ok(())
    }

    #[test]
    fn test_arbitrary_chunking() -> anyhow::Result<()> {
        let messages: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; i as usize * 13]).collect();
        let mut stream = Vec::new();
        for message in &messages {
            stream.extend_from_slice(&create_data_package(message)?);
        }
        for chunk_size in [1, 2, 7, 11, 64, 1000, stream.len()] {
            let mut buffer = FrameBuffer::default();
            let mut received = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                assert!(buffer.append(chunk));
                while let Some(payload) = buffer.extract_package()? {
                    received.push(payload.to_vec());
                }
            }
            assert_eq!(received, messages, "chunk size {}", chunk_size);
            assert!(buffer.is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_count_packages() -> anyhow::Result<()> {
        let mut buffer = FrameBuffer::default();
        let first = create_data_package(b"first")?;
        let second = create_data_package(b"second")?;
        buffer.append(&first);
        buffer.append(&second[..5]);
        assert_eq!(buffer.count_packages(), 1);
        buffer.append(&second[5..]);
        assert_eq!(buffer.count_packages(), 2);
        assert!(buffer.has_package());
        assert_eq!(&buffer.extract_package()?.ok_or(anyhow::anyhow!("first"))?[..], b"first");
        assert_eq!(&buffer.extract_package()?.ok_or(anyhow::anyhow!("second"))?[..], b"second");
        assert!(!buffer.has_package());
        Ok(())
    }

    #[test]
    fn test_discard_garbage() -> anyhow::Result<()> {
        let mut buffer = FrameBuffer::default();
        assert!(!buffer.append(b"this is not a frame"));
        assert!(buffer.is_empty());
        assert!(buffer.append(&START_DATA[..3]));
        let mut skipped = b"xx".to_vec();
        skipped.extend_from_slice(&create_data_package(b"payload")?);
        let mut src = BytesMut::from(&skipped[..]);
        let payload = FrameCodec::default().decode(&mut src)?;
        assert_eq!(payload.as_deref(), Some(&b"payload"[..]));
        Ok(())
    }

    #[test]
    fn test_invalid_trailer() -> anyhow::Result<()> {
        let mut frame = create_data_package(b"payload")?.to_vec();
        let last = frame.len() - 1;
        frame[last] = 0;
        let mut buffer = FrameBuffer::default();
        buffer.append(&frame);
        assert!(matches!(buffer.extract_package(), Err(FrameError::InvalidTrailer)));
        assert!(buffer.is_empty());
        Ok(())
    }
}
