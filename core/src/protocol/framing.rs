//! Length-field frame assembler.
//!
//! TCP delivers an arbitrary byte stream: one application frame may arrive
//! split across several reads, and several frames may coalesce into one.
//! The assembler buffers incoming chunks and re-emits complete frames as
//! delimited by a fixed-width big-endian length field at a configured offset.

use crate::config::FramingConfig;
use crate::{RemotingError, Result};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{error, warn};

/// Reassembles discrete frames from a stream of byte chunks.
///
/// One instance exists per connection; it is not shared across peers. A
/// frame whose declared length exceeds the configured maximum is treated as
/// stream corruption: the entire cache is discarded and an error reported.
/// No attempt is made to resynchronize within the discarded bytes.
pub struct FrameAssembler {
    max_frame_length: usize,
    length_field_offset: usize,
    length_field_width: usize,
    initial_bytes_to_strip: usize,
    cache: BytesMut,
}

impl FrameAssembler {
    /// Create an assembler from validated framing parameters.
    pub fn new(config: FramingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_frame_length: config.max_frame_length,
            length_field_offset: config.length_field_offset,
            length_field_width: config.length_field_width,
            initial_bytes_to_strip: config.initial_bytes_to_strip,
            cache: BytesMut::new(),
        })
    }

    /// Append `chunk` to the internal cache, then emit every complete frame
    /// the cache now holds, in arrival order.
    ///
    /// Emitted frames are independently owned copies; they never borrow from
    /// `chunk`. Partial trailing data stays buffered for the next call.
    pub fn pack(&mut self, chunk: &[u8], mut on_frame: impl FnMut(Bytes)) -> Result<()> {
        if chunk.len() > self.max_frame_length {
            // Refuse without touching the cache: buffered partial frames are
            // still decodable from subsequent well-formed input.
            error!(
                "input length {} > max frame length {}, discarding input",
                chunk.len(),
                self.max_frame_length
            );
            return Err(RemotingError::FrameTooLarge {
                length: chunk.len(),
                max: self.max_frame_length,
            });
        }

        self.cache.extend_from_slice(chunk);
        self.drain(&mut on_frame)
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.cache.len()
    }

    fn drain(&mut self, on_frame: &mut impl FnMut(Bytes)) -> Result<()> {
        let header_len = self.length_field_offset + self.length_field_width;

        loop {
            if self.cache.len() <= header_len {
                // Not enough to read the length field; wait for more input.
                break;
            }

            let declared = self.read_length_field()?;
            if declared > self.max_frame_length {
                // Stream corruption: the remainder of the cache is
                // unrecoverable, drop it all.
                self.cache.clear();
                error!(
                    "frame length {} > max frame length {}, discarding cache",
                    declared, self.max_frame_length
                );
                return Err(RemotingError::FrameTooLarge {
                    length: declared,
                    max: self.max_frame_length,
                });
            }

            if self.cache.len() - header_len < declared {
                // Frame incomplete; wait for more input.
                break;
            }

            let mut frame = self.cache.split_to(header_len + declared);
            if self.initial_bytes_to_strip > 0 {
                frame.advance(self.initial_bytes_to_strip);
            }
            on_frame(frame.freeze());
        }

        Ok(())
    }

    fn read_length_field(&self) -> Result<usize> {
        let start = self.length_field_offset;
        let field = &self.cache[start..start + self.length_field_width];
        match self.length_field_width {
            1 => Ok(field[0] as usize),
            2 => Ok(u16::from_be_bytes([field[0], field[1]]) as usize),
            4 => Ok(u32::from_be_bytes([field[0], field[1], field[2], field[3]]) as usize),
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(field);
                Ok(u64::from_be_bytes(raw) as usize)
            }
            width => {
                warn!("unsupported length field width {}", width);
                Err(RemotingError::UnsupportedLengthFieldWidth(width))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(strip: usize) -> FrameAssembler {
        FrameAssembler::new(FramingConfig {
            max_frame_length: 8 * 1024 * 1024,
            length_field_offset: 0,
            length_field_width: 4,
            initial_bytes_to_strip: strip,
        })
        .unwrap()
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    fn collect(assembler: &mut FrameAssembler, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        assembler.pack(chunk, |f| frames.push(f)).unwrap();
        frames
    }

    #[test]
    fn full_frame_without_strip() {
        let mut asm = assembler(0);
        let input = frame(b"abcdefghij");
        let frames = collect(&mut asm, &input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }

    #[test]
    fn full_frame_with_strip() {
        let mut asm = assembler(4);
        let input = frame(b"abcdefghij");
        let frames = collect(&mut asm, &input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"abcdefghij");
    }

    #[test]
    fn header_then_payload() {
        let mut asm = assembler(0);
        let input = frame(b"abcdefghij");

        assert!(collect(&mut asm, &input[..4]).is_empty());
        let frames = collect(&mut asm, &input[4..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }

    #[test]
    fn split_at_every_boundary() {
        let input = frame(b"abcdefghij");
        for split in 1..input.len() {
            let mut asm = assembler(4);
            assert!(collect(&mut asm, &input[..split]).is_empty(), "split {}", split);
            let frames = collect(&mut asm, &input[split..]);
            assert_eq!(frames.len(), 1, "split {}", split);
            assert_eq!(&frames[0][..], b"abcdefghij", "split {}", split);
        }
    }

    #[test]
    fn coalesced_frames_emit_in_order() {
        let mut asm = assembler(4);
        let mut input = frame(b"first");
        input.extend_from_slice(&frame(b"second"));
        input.extend_from_slice(&frame(b"third"));

        let frames = collect(&mut asm, &input);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
    }

    #[test]
    fn arbitrary_splits_match_single_pack() {
        let mut input = frame(b"first");
        input.extend_from_slice(&frame(b"the second frame"));
        input.extend_from_slice(&frame(b"3"));

        let mut whole = assembler(4);
        let expected = collect(&mut whole, &input);

        for chunk_size in [1, 2, 3, 5, 7, 11] {
            let mut asm = assembler(4);
            let mut frames = Vec::new();
            for chunk in input.chunks(chunk_size) {
                asm.pack(chunk, |f| frames.push(f)).unwrap();
            }
            assert_eq!(frames, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn oversized_declared_length_discards_cache() {
        let mut asm = FrameAssembler::new(FramingConfig {
            max_frame_length: 16,
            length_field_offset: 0,
            length_field_width: 4,
            initial_bytes_to_strip: 4,
        })
        .unwrap();

        let mut input = 1000u32.to_be_bytes().to_vec();
        input.extend_from_slice(b"junk");
        let err = asm.pack(&input, |_| panic!("no frame expected")).unwrap_err();
        assert!(matches!(
            err,
            RemotingError::FrameTooLarge { length: 1000, max: 16 }
        ));
        assert_eq!(asm.buffered(), 0);

        // The stream recovers: a subsequent valid frame parses normally.
        let frames = collect(&mut asm, &frame(b"ok"));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"ok");
    }

    #[test]
    fn oversized_input_leaves_cache_untouched() {
        let mut asm = FrameAssembler::new(FramingConfig {
            max_frame_length: 8,
            length_field_offset: 0,
            length_field_width: 4,
            initial_bytes_to_strip: 4,
        })
        .unwrap();

        // Buffer a partial valid frame first.
        let valid = frame(b"abcd");
        assert!(collect(&mut asm, &valid[..6]).is_empty());
        let buffered = asm.buffered();

        let err = asm.pack(&[0u8; 9], |_| panic!("no frame expected")).unwrap_err();
        assert!(matches!(err, RemotingError::FrameTooLarge { length: 9, max: 8 }));
        assert_eq!(asm.buffered(), buffered);

        // The partial frame still completes.
        let frames = collect(&mut asm, &valid[6..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"abcd");
    }

    #[test]
    fn two_byte_length_field() {
        let mut asm = FrameAssembler::new(FramingConfig {
            max_frame_length: 1024,
            length_field_offset: 0,
            length_field_width: 2,
            initial_bytes_to_strip: 2,
        })
        .unwrap();

        let mut input = 5u16.to_be_bytes().to_vec();
        input.extend_from_slice(b"hello");
        let frames = collect(&mut asm, &input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
    }

    #[test]
    fn length_field_at_nonzero_offset() {
        let mut asm = FrameAssembler::new(FramingConfig {
            max_frame_length: 1024,
            length_field_offset: 2,
            length_field_width: 4,
            initial_bytes_to_strip: 0,
        })
        .unwrap();

        let mut input = vec![0xAA, 0xBB];
        input.extend_from_slice(&4u32.to_be_bytes());
        input.extend_from_slice(b"body");
        let frames = collect(&mut asm, &input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }
}
