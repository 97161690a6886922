//! On-disk frame plumbing: the per-data-frame size preface, the header
//! skippable frame, and the read side that transparently skips unknown
//! skippable frames.

use std::io::{Read, Write};

use crate::{
    HEADER_SNIFF_MAX, SIZE_PREFACE_FRAME_SIZE, SKIPPABLE_MAGIC_AUX, SKIPPABLE_MAGIC_MASK,
    SKIPPABLE_MAGIC_SIZE_PREFACE,
    buffer::Buffer,
    codec::{self, FrameSize},
    error::Result,
};

/// Outcome of pulling the next frame from a compressed stream.
#[derive(Debug)]
pub(crate) enum NextFrame {
    /// A data frame was loaded into the scratch buffer.
    Data(FrameSize),
    /// Clean end of stream.
    Eof,
    /// The stream is not size-prefaced zstd. The eight header bytes already
    /// consumed are handed back so a streaming decoder can replay them.
    Raw([u8; 8]),
}

/// Reads the next data frame into `comp`, skipping any skippable frames that
/// are not a size preface.
///
/// A size-preface frame tells us the byte length of the following data
/// frame, so the compressed payload can be loaded in one read without
/// parsing the zstd frame header first. Frames are delivered in file order.
///
/// # Errors
///
/// Fails on short reads or an invalid zstd frame header.
pub(crate) fn read_frame<R: Read>(src: &mut R, comp: &mut Buffer) -> Result<NextFrame> {
    let mut hdr = [0u8; 8];

    loop {
        // A zero-byte read at a frame boundary is clean EOF.
        let n = src.read(&mut hdr)?;
        if n == 0 {
            return Ok(NextFrame::Eof);
        }
        src.read_exact(&mut hdr[n..])?;

        let magic = u32::from_le_bytes(hdr[0..4].try_into().expect("slice is 4 bytes"));
        let declared = u32::from_le_bytes(hdr[4..8].try_into().expect("slice is 4 bytes"));

        if magic == SKIPPABLE_MAGIC_SIZE_PREFACE && declared == 4 {
            let mut sz = [0u8; 4];
            src.read_exact(&mut sz)?;
            let csize = u32::from_le_bytes(sz) as usize;

            comp.grow(csize);
            src.read_exact(&mut comp.space()[..csize])?;
            comp.rewind();

            let size = codec::frame_content_size(comp.filled())?;
            if size == FrameSize::Known(0) {
                // An empty data frame ends the stream.
                return Ok(NextFrame::Eof);
            }
            return Ok(NextFrame::Data(size));
        }

        if (magic & !0xF) == SKIPPABLE_MAGIC_MASK {
            // Some other skippable frame; consume its payload and restart.
            let mut remaining = declared as u64;
            let mut sink = [0u8; 8192];
            while remaining > 0 {
                let want = usize::min(sink.len(), remaining as usize);
                src.read_exact(&mut sink[..want])?;
                remaining -= want as u64;
            }
            continue;
        }

        return Ok(NextFrame::Raw(hdr));
    }
}

/// Writes the pzstd-style skippable frame announcing the byte length of the
/// next data frame.
pub(crate) fn write_size_preface<W: Write>(dst: &mut W, comp_sz: u32) -> Result<()> {
    let mut buf = [0u8; SIZE_PREFACE_FRAME_SIZE];
    buf[0..4].copy_from_slice(&SKIPPABLE_MAGIC_SIZE_PREFACE.to_le_bytes());
    buf[4..8].copy_from_slice(&4u32.to_le_bytes());
    buf[8..12].copy_from_slice(&comp_sz.to_le_bytes());
    dst.write_all(&buf)?;

    Ok(())
}

/// Builds the header skippable frame: `"BGZ2"` followed by up to
/// [`HEADER_SNIFF_MAX`] plaintext bytes of the first block, enough for
/// content sniffing without decompression.
///
/// Returns the frame bytes and their total length.
pub(crate) fn header_frame(first_block: &[u8]) -> ([u8; 12 + HEADER_SNIFF_MAX], usize) {
    let len = usize::min(HEADER_SNIFF_MAX, first_block.len());
    let mut buf = [0u8; 12 + HEADER_SNIFF_MAX];
    buf[0..4].copy_from_slice(&SKIPPABLE_MAGIC_AUX.to_le_bytes());
    buf[4..8].copy_from_slice(&((len + 4) as u32).to_le_bytes());
    buf[8..12].copy_from_slice(b"BGZ2");
    buf[12..12 + len].copy_from_slice(&first_block[..len]);

    (buf, 12 + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::compress_block;

    fn prefaced_frame(payload: &[u8]) -> Vec<u8> {
        let mut comp = Buffer::new();
        compress_block(payload, &mut comp, 3).unwrap();
        let mut out = Vec::new();
        write_size_preface(&mut out, comp.sz() as u32).unwrap();
        out.extend_from_slice(comp.filled());
        out
    }

    #[test]
    fn read_prefaced_frame() {
        let bytes = prefaced_frame(b"frame payload");
        let mut src = std::io::Cursor::new(bytes);
        let mut comp = Buffer::new();

        match read_frame(&mut src, &mut comp).unwrap() {
            NextFrame::Data(FrameSize::Known(13)) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
        match read_frame(&mut src, &mut comp).unwrap() {
            NextFrame::Eof => {}
            other => panic!("expected eof, got {other:?}"),
        }
    }

    #[test]
    fn unknown_skippable_frames_are_transparent() {
        let mut bytes = Vec::new();
        // Reserved skippable magic with an arbitrary payload
        bytes.extend_from_slice(&0x184D_2A57u32.to_le_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(b"abcde");
        bytes.extend(prefaced_frame(b"after the skip"));

        let mut src = std::io::Cursor::new(bytes);
        let mut comp = Buffer::new();
        match read_frame(&mut src, &mut comp).unwrap() {
            NextFrame::Data(FrameSize::Known(14)) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn bare_zstd_stream_switches_to_raw() {
        let mut comp = Buffer::new();
        compress_block(b"no preface here", &mut comp, 3).unwrap();

        let mut src = std::io::Cursor::new(comp.filled().to_vec());
        let mut scratch = Buffer::new();
        match read_frame(&mut src, &mut scratch).unwrap() {
            NextFrame::Raw(hdr) => assert_eq!(&hdr[..], &comp.filled()[..8]),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn header_frame_layout() {
        let (buf, len) = header_frame(b"@HD\tVN:1.6");
        assert_eq!(len, 12 + 10);
        assert_eq!(&buf[0..4], &SKIPPABLE_MAGIC_AUX.to_le_bytes());
        assert_eq!(&buf[4..8], &14u32.to_le_bytes());
        assert_eq!(&buf[8..12], b"BGZ2");
        assert_eq!(&buf[12..22], b"@HD\tVN:1.6");

        // Sniff bytes are capped at 16
        let (_, len) = header_frame(&[0u8; 100]);
        assert_eq!(len, 12 + HEADER_SNIFF_MAX);
    }
}
