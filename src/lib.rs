//! Block-compressed Zstd container with random access by uncompressed
//! offset and parallel encode/decode pipelines.
//!
//! A bgzf2 file is a valid Zstd bitstream: any stock zstd decoder applied
//! to it reproduces the payload. On top of that it carries skippable
//! metadata frames that make the container self-indexing and splittable:
//!
//! - a pzstd-style size preface before every data frame, announcing its
//!   compressed length so frames can be read and dispatched to worker
//!   threads without parsing zstd headers;
//! - an optional header frame with a few plaintext bytes for content
//!   sniffing;
//! - a trailing seekable index listing compressed and uncompressed sizes
//!   of every frame, binary-searchable by uncompressed offset;
//! - an optional genomic index mapping `(tid, beg, end)` intervals to
//!   uncompressed offsets, placed right before the seekable index.
//!
//! # Getting Started
//!
//! - [`Bgzf2`] is the file handle with the classic open/read/write/seek
//!   surface and mode-string parsing.
//! - [`Writer`] and [`Reader`] are the underlying pipelines, usable
//!   directly over anything implementing the std io traits.
//! - [`ThreadPool`] is a shared worker pool; attach it to any handle with
//!   `thread_pool` to parallelize compression or decompression.
//! - [`SeekTable`] and [`GenomicIndex`] hold the two indices.
//!
//! Bgzf2 uses bindings from the [zstd_safe] crate.
//!
//! [zstd_safe]: https://docs.rs/zstd-safe/latest/zstd_safe/

#![cfg_attr(docsrs, feature(doc_cfg))]

mod buffer;
mod codec;
mod error;
mod frame;
mod gindex;
mod handle;
mod reader;
pub mod seek_table;
mod seekable;
mod tpool;
mod writer;

pub use error::{Error, Result};
pub use gindex::{GenomicIndex, QUERY_EOF};
pub use handle::Bgzf2;
pub use reader::{EofStatus, Reader};
pub use seek_table::SeekTable;
pub use seekable::{OffsetFrom, Seekable};
pub use tpool::ThreadPool;
pub use writer::Writer;
// Re-export as it's part of the API.
pub use zstd_safe::CompressionLevel;

use zstd_safe::zstd_sys::ZSTD_MAGIC_SKIPPABLE_START;

/// Default target size of one uncompressed block.
pub const BGZF2_DEFAULT_BLOCK_SIZE: usize = 256_000;
/// Default compression level.
pub const BGZF2_DEFAULT_LEVEL: CompressionLevel = 5;
/// Upper bound on the advertised uncompressed size of a single frame,
/// enforced before allocation to bound memory against hostile inputs.
pub const BGZF2_MAX_BLOCK_SIZE: u64 = 1 << 30;
/// The integrity sentinel of the seekable index footer.
pub const SEEKABLE_MAGIC_NUMBER: u32 = 0x8F92_EAB1;
/// The trailer sentinel of the genomic index frame.
pub const GENOMIC_MAGIC_NUMBER: u32 = 0x8F92_EABB;
/// The maximum number of entries in a seekable index.
pub const SEEKABLE_MAX_FRAMES: u32 = 0x0800_0000;

/// Skippable magic of the pzstd next-frame-size preface.
pub(crate) const SKIPPABLE_MAGIC_SIZE_PREFACE: u32 = ZSTD_MAGIC_SKIPPABLE_START;
/// Skippable magic of the bgzf2 auxiliary frames (header, genomic index).
pub(crate) const SKIPPABLE_MAGIC_AUX: u32 = ZSTD_MAGIC_SKIPPABLE_START | 0xB;
/// Skippable magic of the seekable index frame.
pub(crate) const SKIPPABLE_MAGIC_SEEKABLE: u32 = ZSTD_MAGIC_SKIPPABLE_START | 0xE;
/// All magics in `SKIPPABLE_MAGIC_MASK..=SKIPPABLE_MAGIC_MASK | 0xF` are
/// skippable frames.
pub(crate) const SKIPPABLE_MAGIC_MASK: u32 = ZSTD_MAGIC_SKIPPABLE_START;
/// Skippable magic number (4 bytes) + frame size field (4 bytes).
pub(crate) const SKIPPABLE_HEADER_SIZE: usize = 8;
/// The size of the seek table integrity field.
pub(crate) const SEEK_TABLE_INTEGRITY_SIZE: usize = 9;
/// On-disk size of one size-preface frame.
pub(crate) const SIZE_PREFACE_FRAME_SIZE: usize = 12;
/// Plaintext bytes of the first block carried in the header frame.
pub(crate) const HEADER_SNIFF_MAX: usize = 16;

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    /// Deterministic pseudo-random bytes (xorshift) for large inputs.
    fn test_bytes(n: usize, seed: u64) -> Vec<u8> {
        let mut x = seed | 1;
        (0..n)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    fn write_all(data: &[u8], block_size: usize, level: CompressionLevel) -> Vec<u8> {
        let mut w = Writer::new(Vec::new(), level);
        w.set_block_size(block_size).unwrap();
        w.write(data, true).unwrap();
        w.finish().unwrap()
    }

    fn read_all(file: &[u8]) -> Vec<u8> {
        let mut r = Reader::new(Cursor::new(file.to_vec()));
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn tiny_cycle() {
        let file = write_all(b"hello world", 4, 5);
        assert_eq!(read_all(&file), b"hello world");

        let mut src = Cursor::new(file);
        let (st, _) = SeekTable::from_seekable(&mut src).unwrap();
        // Header frame plus three data frames of 4, 4 and 3 bytes, each
        // with its size preface
        assert_eq!(st.num_entries(), 7);
        assert_eq!(st.size_decomp(), 11);

        let mut r = Reader::new(src);
        assert_eq!(r.check_eof().unwrap(), EofStatus::Present);
    }

    #[test]
    fn seek_into_patterned_data() {
        let data: Vec<u8> = (0..1_000_000).map(|i| (i % 256) as u8).collect();
        let file = write_all(&data, 65_536, 5);

        let mut r = Reader::new(Cursor::new(file));
        r.seek(500_000).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(r.read(&mut buf).unwrap(), 5);
        assert_eq!(buf, [0x20, 0x21, 0x22, 0x23, 0x24]);

        // Sequential reading continues from there
        let mut buf = [0u8; 3];
        r.read(&mut buf).unwrap();
        assert_eq!(buf, [0x25, 0x26, 0x27]);
    }

    #[test]
    fn random_access_consistency() {
        let data = test_bytes(10_000, 42);
        let file = write_all(&data, 512, 3);
        let mut r = Reader::new(Cursor::new(file));

        for upos in [0u64, 1, 511, 512, 513, 5000, 9998, 9999] {
            r.seek(upos).unwrap();
            let mut buf = [0u8; 32];
            let n = r.read(&mut buf).unwrap();
            let expect = &data[upos as usize..(upos as usize + 32).min(data.len())];
            assert_eq!(&buf[..n], expect, "upos {upos}");
        }
    }

    #[test]
    fn seek_past_eof_fails_without_moving() {
        let data = test_bytes(1000, 7);
        let file = write_all(&data, 100, 1);
        let mut r = Reader::new(Cursor::new(file));

        let mut buf = [0u8; 10];
        r.read(&mut buf).unwrap();
        assert!(r.seek(1000).unwrap_err().is_out_of_range());
        assert!(r.seek(u64::MAX).unwrap_err().is_out_of_range());

        // The read position did not advance
        r.read(&mut buf).unwrap();
        assert_eq!(buf, data[10..20]);
    }

    #[test]
    fn eof_is_idempotent() {
        let file = write_all(b"tail", 16, 1);
        let mut r = Reader::new(Cursor::new(file));
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.peek().unwrap(), None);
        assert_eq!(r.check_eof().unwrap(), EofStatus::Present);
    }

    #[test]
    fn index_soundness() {
        let data = test_bytes(50_000, 3);
        let file = write_all(&data, 4096, 5);

        let mut src = Cursor::new(file.clone());
        let (st, index_sz) = SeekTable::from_seekable(&mut src).unwrap();
        assert_eq!(st.size_comp() + index_sz, file.len() as u64);
        assert_eq!(st.size_decomp(), data.len() as u64);
    }

    #[test]
    fn stock_zstd_decoder_reads_the_file() {
        let data = test_bytes(30_000, 11);
        let file = write_all(&data, 4000, 9);
        let out = zstd::stream::decode_all(Cursor::new(file)).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unknown_skippable_frames_do_not_change_output() {
        let data = test_bytes(5000, 9);
        let file = write_all(&data, 1000, 2);

        // Splice a reserved skippable frame in front of the second size
        // preface
        let mut src = Cursor::new(file.clone());
        let (st, _) = SeekTable::from_seekable(&mut src).unwrap();
        let cut = st.query(1000).unwrap().cpos as usize;

        let mut spliced = file[..cut].to_vec();
        spliced.extend_from_slice(&0x184D_2A57u32.to_le_bytes());
        spliced.extend_from_slice(&7u32.to_le_bytes());
        spliced.extend_from_slice(b"ignored");
        spliced.extend_from_slice(&file[cut..]);

        assert_eq!(read_all(&spliced), data);
    }

    #[test]
    fn pzstd_only_stream_reads_but_cannot_seek() {
        // Size-prefaced frames with no trailing seekable index
        let data = test_bytes(9000, 21);
        let mut file = Vec::new();
        let mut comp = buffer::Buffer::new();
        for chunk in data.chunks(3000) {
            codec::compress_block(chunk, &mut comp, 4).unwrap();
            frame::write_size_preface(&mut file, comp.sz() as u32).unwrap();
            file.extend_from_slice(comp.filled());
        }

        assert_eq!(read_all(&file), data);

        let mut r = Reader::new(Cursor::new(file.clone()));
        assert!(r.seek(100).unwrap_err().is_index_missing());

        let mut r = Reader::new(Cursor::new(file));
        assert_eq!(r.check_eof().unwrap(), EofStatus::Absent);
    }

    #[test]
    fn bare_zstd_stream_downgrades_to_streaming() {
        let data = test_bytes(20_000, 5);
        let file = zstd::stream::encode_all(Cursor::new(&data[..]), 3).unwrap();
        assert_eq!(read_all(&file), data);
    }

    #[test]
    fn getline_and_peek() {
        let file = write_all(b"alpha\nbeta\r\ngamma", 64, 1);
        let mut r = Reader::new(Cursor::new(file));

        assert_eq!(r.peek().unwrap(), Some(b'a'));

        let mut line = Vec::new();
        assert_eq!(r.getline(b'\n', &mut line).unwrap(), Some(5));
        assert_eq!(line, b"alpha");
        assert_eq!(r.getline(b'\n', &mut line).unwrap(), Some(4));
        assert_eq!(line, b"beta"); // trailing \r stripped
        assert_eq!(r.getline(b'\n', &mut line).unwrap(), Some(5));
        assert_eq!(line, b"gamma");
        assert_eq!(r.getline(b'\n', &mut line).unwrap(), None);
    }

    #[test]
    fn zero_copy_reads_cover_the_stream() {
        let data = test_bytes(3000, 13);
        let file = write_all(&data, 500, 1);
        let mut r = Reader::new(Cursor::new(file));

        let mut out = Vec::new();
        loop {
            let chunk = r.read_zero_copy(700).unwrap();
            if chunk.is_empty() {
                break;
            }
            // Never longer than requested, never empty before EOF
            assert!(chunk.len() <= 700);
            out.extend_from_slice(chunk);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn mt_write_then_read_matches() {
        let data = test_bytes(10 << 20, 77);
        let pool = Arc::new(ThreadPool::new(8));

        let mut w = Writer::new(Vec::new(), 1);
        w.set_block_size(256_000).unwrap();
        w.thread_pool(&pool, 0).unwrap();
        for chunk in data.chunks(4096) {
            w.write(chunk, true).unwrap();
        }
        let file = w.finish().unwrap();

        // Single-threaded decode sees the same bytes
        assert_eq!(read_all(&file), data);

        // As does the multi-threaded pipeline, from the same shared pool
        let mut r = Reader::new(Cursor::new(file));
        r.thread_pool(&pool, 0).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        r.finish().unwrap();
    }

    #[test]
    fn mt_read_with_seek() {
        let data = test_bytes(10 << 20, 123);
        let pool = Arc::new(ThreadPool::new(8));

        let mut w = Writer::new(Vec::new(), 1);
        w.thread_pool(&pool, 0).unwrap();
        for chunk in data.chunks(4096) {
            w.write(chunk, true).unwrap();
        }
        let file = w.finish().unwrap();

        let pool = Arc::new(ThreadPool::new(4));
        let mut r = Reader::new(Cursor::new(file));
        r.thread_pool(&pool, 0).unwrap();

        r.seek(9_999_999).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], data[9_999_999]);

        // Seek backwards and keep reading
        r.seek(1_000_000).unwrap();
        let mut buf = [0u8; 16];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[1_000_000..1_000_016]);

        assert_eq!(r.check_eof().unwrap(), EofStatus::Present);
        assert!(r.seek(data.len() as u64).unwrap_err().is_out_of_range());
        r.finish().unwrap();
    }

    #[test]
    fn genomic_query_cycle() {
        let mut w = Writer::new(Vec::new(), 5);
        w.set_block_size(1 << 20).unwrap();
        w.write(b"records for tid 0, first frame", true).unwrap();
        w.idx_add(0, 100, 200).unwrap();
        w.flush().unwrap();
        w.write(b"records for tid 0, second frame", true).unwrap();
        w.idx_add(0, 300, 400).unwrap();
        w.flush().unwrap();
        w.write(b"records for tid 1", true).unwrap();
        w.idx_add(1, 50, 60).unwrap();
        let file = w.finish().unwrap();

        let mut r = Reader::new(Cursor::new(file));
        assert_eq!(r.query(0, 150, 150).unwrap(), 0);
        assert_eq!(r.query(0, 500, 600).unwrap(), 30 + 31);
        assert_eq!(r.query(2, 0, 0).unwrap(), QUERY_EOF);

        // The resolved offset seeks to the frame holding the range
        let upos = r.query(0, 350, 350).unwrap();
        r.seek(upos).unwrap();
        let mut buf = [0u8; 7];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"records");
    }

    #[test]
    fn genomic_index_monotonic_per_tid() {
        let mut w = Writer::new(Vec::new(), 1);
        w.set_block_size(8).unwrap();
        for i in 0..20i64 {
            let rec = [b'r'; 8];
            w.flush_try(rec.len()).unwrap();
            w.write(&rec, false).unwrap();
            w.idx_add((i % 2) as i32, i * 10, i * 10 + 5).unwrap();
        }
        let file = w.finish().unwrap();

        let mut src = Cursor::new(file);
        let (_, index_sz) = SeekTable::from_seekable(&mut src).unwrap();
        let gi = GenomicIndex::from_seekable(&mut src, index_sz)
            .unwrap()
            .expect("genomic index present");

        // Query offsets never move backwards within one tid
        let mut prev = [None::<u64>; 2];
        for i in 0..20i64 {
            let off = gi.query((i % 2) as i32, i * 10, i * 10).unwrap();
            if let Some(p) = prev[(i % 2) as usize] {
                assert!(off >= p);
            }
            prev[(i % 2) as usize] = Some(off);
        }
    }

    #[test]
    fn handle_cycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bgz2");

        let mut out = Bgzf2::open(&path, "w7").unwrap();
        out.set_block_size(1024).unwrap();
        let data = test_bytes(100_000, 31);
        out.write(&data, true).unwrap();
        out.close().unwrap();

        let mut src = Bgzf2::open(&path, "r").unwrap();
        assert_eq!(src.check_eof().unwrap(), EofStatus::Present);
        src.seek(50_000).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(src.read(&mut buf).unwrap(), 100);
        assert_eq!(&buf[..], &data[50_000..50_100]);
        src.close().unwrap();
    }

    proptest! {
        #[test]
        fn cycle(data in proptest::collection::vec(any::<u8>(), 0..2048),
                 block_size in 1usize..512,
                 level in 1..10i32) {
            let file = write_all(&data, block_size, level);
            prop_assert_eq!(read_all(&file), data);
        }

        #[test]
        fn cycle_stock_decoder(data in proptest::collection::vec(any::<u8>(), 1..1024),
                               block_size in 1usize..256) {
            let file = write_all(&data, block_size, 3);
            let out = zstd::stream::decode_all(Cursor::new(file)).unwrap();
            prop_assert_eq!(out, data);
        }

        #[test]
        fn seek_matches_slice(seed in 1u64..1024, upos in 0u64..4096) {
            let data = test_bytes(4096, seed);
            let file = write_all(&data, 257, 1);
            let mut r = Reader::new(Cursor::new(file));
            r.seek(upos).unwrap();
            let mut buf = [0u8; 64];
            let n = r.read(&mut buf).unwrap();
            let expect = &data[upos as usize..(upos as usize + 64).min(data.len())];
            prop_assert_eq!(&buf[..n], expect);
        }
    }
}
