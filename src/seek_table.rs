//! The trailing seekable index.
//!
//! The index is a skippable frame listing the compressed and uncompressed
//! size of every frame in the file, in file order. Skippable frames (size
//! prefaces, the header frame, the genomic index) are listed with an
//! uncompressed size of zero; they are required to keep the cumulative
//! compressed offsets correct. The serialized layout is byte-compatible
//! with the community zstd seekable convention.

use crate::{
    SEEK_TABLE_INTEGRITY_SIZE, SEEKABLE_MAGIC_NUMBER, SEEKABLE_MAX_FRAMES, SKIPPABLE_HEADER_SIZE,
    SKIPPABLE_MAGIC_SEEKABLE,
    error::{Error, Result},
    seekable::{OffsetFrom, Seekable},
};

/// The size of each frame entry in the seek table.
const SIZE_PER_FRAME: usize = 8;

/// One frame of the file, with cumulative offsets in both spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Cumulative uncompressed position prior to this frame.
    pub pos: u64,
    /// Cumulative compressed position prior to this frame.
    pub cpos: u64,
    /// On-disk size of this frame.
    pub comp: u32,
    /// Contribution of this frame to the logical stream.
    pub uncomp: u32,
}

/// Holds the per-frame size information of a bgzf2 file.
///
/// Built up frame by frame during compression and emitted as the last frame
/// of the file; parsed from the end of the file to answer
/// uncompressed-offset queries with a binary search.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SeekTable {
    entries: Vec<Entry>,
}

impl SeekTable {
    /// Creates a new, empty seek table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame to this seek table.
    ///
    /// Skippable frames are logged with `uncomp == 0`.
    ///
    /// # Errors
    ///
    /// Fails if the number of entries reaches [`SEEKABLE_MAX_FRAMES`].
    pub fn log_frame(&mut self, comp: u32, uncomp: u32) -> Result<()> {
        if self.entries.len() >= SEEKABLE_MAX_FRAMES as usize {
            return Err(Error::resource_exhausted());
        }

        let (pos, cpos) = match self.entries.last() {
            Some(e) => (e.pos + u64::from(e.uncomp), e.cpos + u64::from(e.comp)),
            None => (0, 0),
        };
        self.entries.push(Entry {
            pos,
            cpos,
            comp,
            uncomp,
        });

        Ok(())
    }

    /// The number of entries, counting skippable frames.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// The total size of the logical (decompressed) stream.
    pub fn size_decomp(&self) -> u64 {
        self.entries
            .last()
            .map_or(0, |e| e.pos + u64::from(e.uncomp))
    }

    /// The total compressed size covered by the index, i.e. the byte length
    /// of the file minus the trailing index frame itself.
    pub fn size_comp(&self) -> u64 {
        self.entries
            .last()
            .map_or(0, |e| e.cpos + u64::from(e.comp))
    }

    /// The serialized length of the index frame, including the skippable
    /// header and the integrity footer.
    pub fn encoded_len(&self) -> usize {
        SKIPPABLE_HEADER_SIZE + self.entries.len() * SIZE_PER_FRAME + SEEK_TABLE_INTEGRITY_SIZE
    }

    /// Serializes the index frame.
    ///
    /// Layout: skippable header (magic, payload length), `N` little-endian
    /// `(comp, uncomp)` pairs, then the footer `N`, one descriptor byte and
    /// the integrity sentinel. No per-entry checksums are written; the data
    /// frames already carry xxh64 checksums.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&SKIPPABLE_MAGIC_SEEKABLE.to_le_bytes());
        let payload = (self.entries.len() * SIZE_PER_FRAME + SEEK_TABLE_INTEGRITY_SIZE) as u32;
        buf.extend_from_slice(&payload.to_le_bytes());

        for e in &self.entries {
            buf.extend_from_slice(&e.comp.to_le_bytes());
            buf.extend_from_slice(&e.uncomp.to_le_bytes());
        }

        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf.push(0); // descriptor: no checksums, reserved bits zero
        buf.extend_from_slice(&SEEKABLE_MAGIC_NUMBER.to_le_bytes());

        buf
    }

    /// Parses the seek table from the end of a bgzf2 file.
    ///
    /// Returns the table and the on-disk size of the index frame. The read
    /// position of `src` is left unspecified.
    ///
    /// # Errors
    ///
    /// Fails with a not-seekable error on pipes, an index-missing error when
    /// the integrity sentinel is absent, and an index-corrupt error when the
    /// sentinel is present but the descriptor, header magic or length do not
    /// validate.
    pub fn from_seekable(src: &mut impl Seekable) -> Result<(Self, u64)> {
        let mut footer = [0u8; SEEK_TABLE_INTEGRITY_SIZE];
        src.set_offset(OffsetFrom::End(-(SEEK_TABLE_INTEGRITY_SIZE as i64)))?;
        src.read_exact(&mut footer)?;

        if u32::from_le_bytes(footer[5..9].try_into().expect("slice is 4 bytes"))
            != SEEKABLE_MAGIC_NUMBER
        {
            return Err(Error::index_missing());
        }
        // Reserved descriptor bits must be zero
        if footer[4] & 0x7C != 0 {
            return Err(Error::index_corrupt());
        }
        let with_checksum = footer[4] & 0x80 != 0;
        let num_frames = u32::from_le_bytes(footer[0..4].try_into().expect("slice is 4 bytes"));
        if num_frames > SEEKABLE_MAX_FRAMES {
            return Err(Error::index_corrupt());
        }

        let size_per_frame = if with_checksum { 12 } else { SIZE_PER_FRAME };
        let frame_size = SKIPPABLE_HEADER_SIZE
            + num_frames as usize * size_per_frame
            + SEEK_TABLE_INTEGRITY_SIZE;

        src.set_offset(OffsetFrom::End(-(frame_size as i64)))?;
        let mut hdr = [0u8; SKIPPABLE_HEADER_SIZE];
        src.read_exact(&mut hdr)?;
        if u32::from_le_bytes(hdr[0..4].try_into().expect("slice is 4 bytes"))
            != SKIPPABLE_MAGIC_SEEKABLE
        {
            return Err(Error::index_corrupt());
        }
        if u32::from_le_bytes(hdr[4..8].try_into().expect("slice is 4 bytes"))
            != (frame_size - SKIPPABLE_HEADER_SIZE) as u32
        {
            return Err(Error::index_corrupt());
        }

        let mut raw = vec![0u8; num_frames as usize * size_per_frame];
        src.read_exact(&mut raw)?;

        let mut entries = Vec::with_capacity(num_frames as usize);
        let mut pos = 0u64;
        let mut cpos = 0u64;
        for chunk in raw.chunks_exact(size_per_frame) {
            let comp = u32::from_le_bytes(chunk[0..4].try_into().expect("slice is 4 bytes"));
            let uncomp = u32::from_le_bytes(chunk[4..8].try_into().expect("slice is 4 bytes"));
            entries.push(Entry {
                pos,
                cpos,
                comp,
                uncomp,
            });
            pos += u64::from(uncomp);
            cpos += u64::from(comp);
        }

        Ok((Self { entries }, frame_size as u64))
    }

    /// Finds the entry covering uncompressed position `upos`.
    ///
    /// The returned entry is the first skippable frame preceding the
    /// covering data frame, so a reader positioned at its `cpos` picks up
    /// the size preface and reads with the correct framing.
    ///
    /// # Errors
    ///
    /// Fails with an out-of-range error when `upos` is at or past the end of
    /// the logical stream.
    pub(crate) fn query(&self, upos: u64) -> Result<&Entry> {
        let n = self.entries.len();
        if n == 0 {
            return Err(Error::out_of_range());
        }
        let idx = &self.entries;

        // Approximate location by binary search on cumulative position
        let mut start = 0;
        let mut end = n - 1;
        let mut mid = (end + 1) / 2;
        while mid != start {
            if idx[mid].pos >= upos {
                end = mid;
            } else {
                start = mid;
            }
            mid = (start + end) / 2;
        }

        // Land on a data frame
        while mid + 1 < n && idx[mid].uncomp == 0 {
            mid += 1;
        }

        if idx[mid].pos + u64::from(idx[mid].uncomp) <= upos {
            // The covering frame is the next data frame, if any
            if mid + 1 < n {
                mid += 1;
            }
            while mid + 1 < n && idx[mid].uncomp == 0 {
                mid += 1;
            }
            if idx[mid].pos + u64::from(idx[mid].uncomp) <= upos {
                return Err(Error::out_of_range());
            }
        }

        // Walk back to include the skippable frames holding this frame's
        // meta-data, the size preface in particular
        while mid > 0 && idx[mid - 1].uncomp == 0 {
            mid -= 1;
        }

        Ok(&idx[mid])
    }
}
