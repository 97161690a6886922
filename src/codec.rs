//! One-block compression and decompression with per-thread cached contexts.
//!
//! High compression levels allocate large working state inside the zstd
//! context. Each thread that touches the codec keeps one `CCtx` and one
//! `DCtx` for its whole lifetime, reset between blocks, so the hot path
//! never re-allocates them. No context is ever visible outside its owning
//! thread.

use core::cell::RefCell;

use zstd_safe::{CCtx, CParameter, CompressionLevel, DCtx, InBuffer, OutBuffer, ResetDirective};

use crate::{
    BGZF2_MAX_BLOCK_SIZE,
    buffer::Buffer,
    error::{Error, Result},
};

/// Decompressed size of a data frame, as advertised by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameSize {
    Known(u64),
    Unknown,
}

thread_local! {
    static CCTX: RefCell<Option<CCtx<'static>>> = const { RefCell::new(None) };
    static DCTX: RefCell<Option<DCtx<'static>>> = const { RefCell::new(None) };
}

/// Compresses `uncomp` into `comp` as a single zstd frame with the content
/// size and checksum flags set.
///
/// `comp` is grown to `ZSTD_compressBound` of the input before compressing.
/// On success `comp.sz` is the compressed length, which is also returned.
///
/// # Errors
///
/// Fails if the context cannot be allocated or zstd reports an error.
pub(crate) fn compress_block(
    uncomp: &[u8],
    comp: &mut Buffer,
    level: CompressionLevel,
) -> Result<usize> {
    comp.grow(zstd_safe::compress_bound(uncomp.len()));

    CCTX.with(|cell| -> Result<usize> {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            *cell = Some(CCtx::try_create().ok_or_else(Error::resource_exhausted)?);
        }
        let cctx = cell.as_mut().expect("context initialized above");

        cctx.reset(ResetDirective::SessionOnly)?;
        cctx.set_parameter(CParameter::CompressionLevel(level))?;
        cctx.set_parameter(CParameter::ChecksumFlag(true))?;
        cctx.set_parameter(CParameter::ContentSizeFlag(true))?;

        let alloc = comp.alloc();
        let n = cctx.compress2(&mut comp.space()[..alloc], uncomp)?;
        comp.set_sz(n);
        comp.rewind();

        Ok(n)
    })
}

/// Decompresses the single frame in `comp` into `uncomp`.
///
/// With a known content size this is a one-shot decompression into a
/// pre-sized buffer; a length mismatch between the advertised and the
/// produced size is reported as corruption. With an unknown size the output
/// grows dynamically while streaming.
///
/// On success `uncomp` holds the decompressed block with `pos` reset to 0.
///
/// # Errors
///
/// Fails if zstd reports an error, the produced length differs from a known
/// content size, or the advertised size exceeds [`BGZF2_MAX_BLOCK_SIZE`].
pub(crate) fn decompress_block(
    comp: &[u8],
    uncomp: &mut Buffer,
    size: FrameSize,
) -> Result<usize> {
    match size {
        FrameSize::Known(advertised) => {
            if advertised > BGZF2_MAX_BLOCK_SIZE {
                return Err(Error::resource_exhausted());
            }
            let advertised = advertised as usize;
            uncomp.grow(advertised);

            let n = DCTX.with(|cell| -> Result<usize> {
                let mut cell = cell.borrow_mut();
                if cell.is_none() {
                    *cell = Some(DCtx::try_create().ok_or_else(Error::resource_exhausted)?);
                }
                let dctx = cell.as_mut().expect("context initialized above");
                dctx.reset(ResetDirective::SessionOnly)?;

                Ok(dctx.decompress(&mut uncomp.space()[..advertised], comp)?)
            })?;

            if n != advertised {
                return Err(Error::codec("frame content size mismatch"));
            }
            uncomp.set_sz(advertised);
            uncomp.rewind();

            Ok(advertised)
        }
        FrameSize::Unknown => decompress_streaming(comp, uncomp),
    }
}

/// Streaming decompression with dynamic output growth, for frames that do
/// not advertise their content size (plain pzstd output).
fn decompress_streaming(comp: &[u8], uncomp: &mut Buffer) -> Result<usize> {
    uncomp.grow(usize::max(comp.len() * 4, 8192));

    DCTX.with(|cell| -> Result<usize> {
        let mut cell = cell.borrow_mut();
        if cell.is_none() {
            *cell = Some(DCtx::try_create().ok_or_else(Error::resource_exhausted)?);
        }
        let dctx = cell.as_mut().expect("context initialized above");
        dctx.reset(ResetDirective::SessionOnly)?;

        let mut in_buf = InBuffer::around(comp);
        let mut out_pos = 0;
        let mut hint = 1;

        // Consume the whole input, growing the output proportionally to the
        // compression ratio observed so far.
        while in_buf.pos() < comp.len() {
            let cap = uncomp.alloc();
            let mut out_buf = OutBuffer::around(&mut uncomp.space()[out_pos..cap]);
            hint = dctx.decompress_stream(&mut out_buf, &mut in_buf)?;
            out_pos += out_buf.pos();

            if in_buf.pos() < comp.len() && out_pos == cap {
                let ratio = (comp.len() as f64 + 1.0) / (in_buf.pos() as f64 + 1.0);
                let guess = (ratio * 1.05 * cap as f64 + 1000.0) as usize;
                uncomp.grow(usize::max(guess, cap + 10_000));
            }
        }

        // All input consumed, but the engine may still hold flushable output.
        while hint != 0 {
            if out_pos == uncomp.alloc() {
                let cap = uncomp.alloc();
                uncomp.grow(cap * 3 / 2 + 100_000);
            }
            let cap = uncomp.alloc();
            let mut out_buf = OutBuffer::around(&mut uncomp.space()[out_pos..cap]);
            hint = dctx.decompress_stream(&mut out_buf, &mut in_buf)?;
            if out_buf.pos() == 0 && hint != 0 {
                // Wants more input with none left
                return Err(Error::codec("truncated zstd frame"));
            }
            out_pos += out_buf.pos();
        }

        uncomp.set_sz(out_pos);
        uncomp.rewind();

        Ok(out_pos)
    })
}

/// The content size advertised by the zstd frame starting at `src`.
pub(crate) fn frame_content_size(src: &[u8]) -> Result<FrameSize> {
    match zstd_safe::get_frame_content_size(src) {
        Ok(Some(n)) => Ok(FrameSize::Known(n)),
        Ok(None) => Ok(FrameSize::Unknown),
        Err(_) => Err(Error::codec("invalid zstd frame header")),
    }
}
