//! The optional genomic index.
//!
//! Maps `(tid, beg, end)` intervals to the uncompressed offset at which the
//! covering frame starts; combined with the seekable index this turns a
//! genomic range into a file position. The payload bytes themselves are
//! never interpreted here, the caller decides what a record is and reports
//! one interval per record while writing.
//!
//! Caller tids are shifted by one so that tid 0 is reserved for unmapped
//! records.

use crate::{
    GENOMIC_MAGIC_NUMBER, SKIPPABLE_HEADER_SIZE, SKIPPABLE_MAGIC_AUX,
    error::{Error, Result},
    seekable::{OffsetFrom, Seekable},
};

/// The value returned by a query that resolves past all indexed data.
///
/// Seeking to it makes subsequent reads hit end-of-stream cleanly.
pub const QUERY_EOF: u64 = u64::MAX;

const ENTRY_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GEntry {
    /// Shifted tid, kept for the serialized form.
    tid: u32,
    /// Inclusive interval within the reference.
    beg: i64,
    end: i64,
    /// Uncompressed offset at which the covering frame starts.
    frame_start: u64,
}

/// Genomic interval index, one ordered entry list per reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenomicIndex {
    chrs: Vec<Vec<GEntry>>,
}

impl GenomicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no record has been added.
    pub fn is_empty(&self) -> bool {
        self.chrs.is_empty()
    }

    /// Records the interval of one record.
    ///
    /// `frame_pos` is the uncompressed offset of the current frame start and
    /// `sub_off` the offset of the record within the frame, as tracked by
    /// the last flush attempt. A new entry is started when the current frame
    /// has none for this tid; otherwise the last entry's interval is widened
    /// to include the record.
    ///
    /// # Errors
    ///
    /// Fails if `tid < -1`.
    pub(crate) fn add_record(
        &mut self,
        tid: i32,
        beg: i64,
        end: i64,
        frame_pos: u64,
        sub_off: u64,
    ) -> Result<()> {
        // Unmapped becomes tid 0
        let tid = tid + 1;
        if tid < 0 {
            return Err(Error::out_of_range());
        }
        let tid = tid as usize;

        let (beg, end) = if tid == 0 { (0, 0) } else { (beg, end) };

        if tid >= self.chrs.len() {
            self.chrs.resize_with(tid + 1, Vec::new);
        }

        let entries = &mut self.chrs[tid];
        let start_new = entries
            .last()
            .is_none_or(|last| last.frame_start != frame_pos);
        if start_new {
            entries.push(GEntry {
                tid: tid as u32,
                beg,
                end,
                frame_start: frame_pos + sub_off,
            });
        }

        let last = entries.last_mut().expect("entry pushed above");
        last.beg = last.beg.min(beg);
        last.end = last.end.max(end);

        Ok(())
    }

    /// Resolves a genomic range to the uncompressed offset to seek to.
    ///
    /// Returns the frame start of the first entry of `tid` whose interval
    /// ends at or after `beg`. When the tid has no coverage there, the first
    /// covered position of any later tid is returned instead, and
    /// [`QUERY_EOF`] when there is none.
    ///
    /// # Errors
    ///
    /// Fails if `tid < -1`.
    pub fn query(&self, tid: i32, beg: i64, _end: i64) -> Result<u64> {
        let tid = tid + 1;
        if tid < 0 {
            return Err(Error::out_of_range());
        }
        let mut tid = tid as usize;

        // Linear scan per tid for now; entries are ordered by frame_start
        if let Some(entries) = self.chrs.get(tid) {
            for e in entries {
                if e.end >= beg {
                    return Ok(e.frame_start);
                }
            }
        }

        // No coverage at or after beg, use the next covered position
        tid += 1;
        while tid < self.chrs.len() {
            if let Some(e) = self.chrs[tid].first() {
                return Ok(e.frame_start);
            }
            tid += 1;
        }

        Ok(QUERY_EOF)
    }

    /// Serializes the index as an auxiliary skippable frame.
    ///
    /// The trailer repeats the total frame length so the frame can be found
    /// by seeking backwards from the seekable index.
    pub fn serialize(&self) -> Vec<u8> {
        let entries: usize = self.chrs.iter().map(Vec::len).sum();
        let payload = 1 + 4 + self.chrs.len() * 5 + entries * ENTRY_SIZE + 8;
        let mut buf = Vec::with_capacity(SKIPPABLE_HEADER_SIZE + payload);

        buf.extend_from_slice(&SKIPPABLE_MAGIC_AUX.to_le_bytes());
        buf.extend_from_slice(&(payload as u32).to_le_bytes());
        buf.push(0); // flags: uncompressed
        buf.extend_from_slice(&(self.chrs.len() as u32).to_le_bytes());

        for entries in &self.chrs {
            buf.push(0); // per-reference flags
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for e in entries {
                buf.extend_from_slice(&e.tid.to_le_bytes());
                buf.extend_from_slice(&(e.beg as u32).to_le_bytes());
                buf.extend_from_slice(&(e.end as u32).to_le_bytes());
                buf.extend_from_slice(&e.frame_start.to_le_bytes());
            }
        }

        // Trailer: total length including trailer, then the sentinel
        let total = (buf.len() + 8) as u32;
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&GENOMIC_MAGIC_NUMBER.to_le_bytes());

        buf
    }

    /// Looks for a genomic index immediately before the seekable index and
    /// parses it.
    ///
    /// `seek_table_size` is the on-disk size of the trailing seekable index
    /// frame. Returns `None` when no genomic index is present.
    ///
    /// # Errors
    ///
    /// Fails with a not-seekable error on pipes and an index-corrupt error
    /// when the trailer sentinel is present but the frame does not validate.
    pub fn from_seekable(
        src: &mut impl Seekable,
        seek_table_size: u64,
    ) -> Result<Option<Self>> {
        let mut trailer = [0u8; 8];
        match src.set_offset(OffsetFrom::End(-((seek_table_size + 8) as i64))) {
            Ok(()) => {}
            Err(e) if e.is_not_seekable() => return Err(e),
            // File too short to hold any genomic index
            Err(_) => return Ok(None),
        }
        src.read_exact(&mut trailer)?;

        if u32::from_le_bytes(trailer[4..8].try_into().expect("slice is 4 bytes"))
            != GENOMIC_MAGIC_NUMBER
        {
            return Ok(None);
        }

        let total = u32::from_le_bytes(trailer[0..4].try_into().expect("slice is 4 bytes")) as u64;
        if total < (SKIPPABLE_HEADER_SIZE + 13) as u64 {
            return Err(Error::index_corrupt());
        }
        src.set_offset(OffsetFrom::End(-((seek_table_size + total) as i64)))
            .map_err(|_| Error::index_corrupt())?;

        let mut buf = vec![0u8; total as usize];
        src.read_exact(&mut buf)?;

        Self::parse(&buf)
    }

    fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let read_u32 = |off: usize| -> Result<u32> {
            let bytes = buf
                .get(off..off + 4)
                .ok_or_else(Error::index_corrupt)?
                .try_into()
                .expect("slice is 4 bytes");
            Ok(u32::from_le_bytes(bytes))
        };

        if read_u32(0)? != SKIPPABLE_MAGIC_AUX {
            return Err(Error::index_corrupt());
        }

        // buf[8] is the index flag byte
        let nchr = read_u32(9)? as usize;
        let mut chrs = Vec::new();
        chrs.try_reserve(nchr)
            .map_err(|_| Error::resource_exhausted())?;

        let mut off = 13;
        for _ in 0..nchr {
            if off + 5 > buf.len() {
                return Err(Error::index_corrupt());
            }
            let nframe = read_u32(off + 1)? as usize;
            off += 5;

            let mut entries = Vec::new();
            entries
                .try_reserve(nframe)
                .map_err(|_| Error::resource_exhausted())?;
            for _ in 0..nframe {
                if off + ENTRY_SIZE > buf.len() {
                    return Err(Error::index_corrupt());
                }
                entries.push(GEntry {
                    tid: read_u32(off)?,
                    beg: i64::from(read_u32(off + 4)?),
                    end: i64::from(read_u32(off + 8)?),
                    frame_start: u64::from(read_u32(off + 12)?)
                        | (u64::from(read_u32(off + 16)?) << 32),
                });
                off += ENTRY_SIZE;
            }
            chrs.push(entries);
        }

        Ok(Some(Self { chrs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Index for three frames: tid 0 at 100..200 and 300..400, tid 1 at
    /// 50..60, with frames starting at uncompressed offsets 0, 4000, 8000.
    fn sample() -> GenomicIndex {
        let mut gi = GenomicIndex::new();
        gi.add_record(0, 100, 200, 0, 0).unwrap();
        gi.add_record(0, 300, 400, 4000, 0).unwrap();
        gi.add_record(1, 50, 60, 8000, 0).unwrap();
        gi
    }

    #[test]
    fn query_resolves_ranges() {
        let gi = sample();
        assert_eq!(gi.query(0, 150, 150).unwrap(), 0);
        assert_eq!(gi.query(0, 250, 260).unwrap(), 4000);
        // Beyond tid 0 coverage falls through to the tid 1 frame
        assert_eq!(gi.query(0, 500, 600).unwrap(), 8000);
        assert_eq!(gi.query(1, 55, 55).unwrap(), 8000);
        // A tid past the index resolves to EOF
        assert_eq!(gi.query(2, 0, 0).unwrap(), QUERY_EOF);
        assert!(gi.query(-2, 0, 0).is_err());
    }

    #[test]
    fn records_in_one_frame_widen() {
        let mut gi = GenomicIndex::new();
        gi.add_record(3, 100, 110, 0, 0).unwrap();
        gi.add_record(3, 90, 95, 0, 0).unwrap();
        gi.add_record(3, 150, 180, 0, 0).unwrap();
        gi.add_record(3, 200, 220, 5000, 0).unwrap();

        assert_eq!(gi.chrs[4].len(), 2);
        assert_eq!(gi.chrs[4][0].beg, 90);
        assert_eq!(gi.chrs[4][0].end, 180);
        assert_eq!(gi.chrs[4][1].frame_start, 5000);
    }

    #[test]
    fn unmapped_records_are_normalized() {
        let mut gi = GenomicIndex::new();
        gi.add_record(-1, 123, 456, 0, 0).unwrap();
        assert_eq!(gi.chrs[0][0].beg, 0);
        assert_eq!(gi.chrs[0][0].end, 0);
    }

    #[test]
    fn sub_block_offset_is_applied() {
        let mut gi = GenomicIndex::new();
        gi.add_record(0, 10, 20, 4000, 250).unwrap();
        assert_eq!(gi.chrs[1][0].frame_start, 4250);
    }

    #[test]
    fn serde_cycle() {
        let gi = sample();
        let frame = gi.serialize();

        // Lay the frame out as it appears on disk, followed by a fake
        // seekable index of 33 bytes.
        let mut file = frame.clone();
        file.extend_from_slice(&[0u8; 33]);
        let mut src = std::io::Cursor::new(file);

        let parsed = GenomicIndex::from_seekable(&mut src, 33).unwrap().unwrap();
        assert_eq!(parsed, gi);
    }

    #[test]
    fn absent_index_is_silent() {
        let mut src = std::io::Cursor::new(vec![0u8; 64]);
        assert!(GenomicIndex::from_seekable(&mut src, 33).unwrap().is_none());

        // Too-short file as well
        let mut src = std::io::Cursor::new(vec![0u8; 4]);
        assert!(GenomicIndex::from_seekable(&mut src, 33).unwrap().is_none());
    }

    #[test]
    fn corrupt_frame_is_fatal() {
        let gi = sample();
        let mut file = gi.serialize();
        // Break the frame magic while keeping the trailer intact
        file[0] ^= 0xFF;
        file.extend_from_slice(&[0u8; 33]);
        let mut src = std::io::Cursor::new(file);
        assert!(
            GenomicIndex::from_seekable(&mut src, 33)
                .unwrap_err()
                .is_index_corrupt()
        );
    }
}
