//! The encoder pipeline.
//!
//! Caller bytes fill the current uncompressed buffer; a full buffer or an
//! explicit flush turns it into one frame. Without a pool attached the
//! frame is compressed and written synchronously. With a pool, the buffer
//! is copied into a pooled job and dispatched to the workers, and a
//! dedicated writer thread commits completed jobs to the file in submission
//! order: size preface, seekable-index entry, compressed payload.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use zstd_safe::CompressionLevel;

use crate::{
    BGZF2_DEFAULT_BLOCK_SIZE, SIZE_PREFACE_FRAME_SIZE,
    buffer::Buffer,
    codec,
    error::{Error, Result},
    frame,
    gindex::GenomicIndex,
    seek_table::SeekTable,
    tpool::{OrderedQueue, ThreadPool, dispatch},
};

/// Work-load for one compression job.
#[derive(Default)]
struct EncodeJob {
    uncomp: Buffer,
    comp: Buffer,
    first_block: bool,
    err: Option<Error>,
}

#[derive(Default)]
struct JobState {
    free: Vec<EncodeJob>,
    pending: usize,
}

struct WriterShared {
    jobs: Mutex<JobState>,
    drained: Condvar,
}

struct MtWriter<W> {
    pool: Arc<ThreadPool>,
    queue: Arc<OrderedQueue<EncodeJob>>,
    shared: Arc<WriterShared>,
    io: Option<JoinHandle<(Result<()>, W)>>,
}

enum Sink<W> {
    Direct(W),
    Threaded(MtWriter<W>),
    Closed,
}

/// Writes a bgzf2 stream.
///
/// Data is accumulated into blocks of [`Writer::set_block_size`] bytes,
/// each emitted as an independently compressed zstd frame preceded by a
/// size preface. The first flush also writes the header skippable frame.
/// [`Writer::finish`] appends the genomic index (when records were added)
/// and the trailing seekable index.
pub struct Writer<W> {
    sink: Sink<W>,
    level: CompressionLevel,
    block_size: usize,
    first_block: bool,
    uncomp: Buffer,
    comp: Buffer,
    /// Uncompressed offset of the current frame start.
    frame_pos: u64,
    /// Offset within the current buffer of the last flush attempt.
    last_flush_try: u64,
    seek_table: Arc<Mutex<SeekTable>>,
    gindex: GenomicIndex,
}

impl<W: Write> Writer<W> {
    /// Creates a writer emitting to `out` with the given compression level.
    pub fn new(out: W, level: CompressionLevel) -> Self {
        let mut uncomp = Buffer::new();
        uncomp.grow(BGZF2_DEFAULT_BLOCK_SIZE);

        Self {
            sink: Sink::Direct(out),
            level,
            block_size: BGZF2_DEFAULT_BLOCK_SIZE,
            first_block: true,
            uncomp,
            comp: Buffer::new(),
            frame_pos: 0,
            last_flush_try: 0,
            seek_table: Arc::new(Mutex::new(SeekTable::new())),
            gindex: GenomicIndex::new(),
        }
    }

    /// Copies `buf` into the stream, flushing blocks as they fill.
    ///
    /// With `can_split` the bytes may span two blocks. Without it, a write
    /// that would cross a block boundary first flushes the current block;
    /// if it exceeds the block size on its own, the buffer is grown so the
    /// record stays whole.
    ///
    /// Returns the number of bytes accepted, which is always `buf.len()`.
    pub fn write(&mut self, buf: &[u8], can_split: bool) -> Result<usize> {
        let mut remaining = buf;
        let accepted = buf.len();

        while !remaining.is_empty() {
            if self.uncomp.is_exhausted() {
                self.flush()?;
            }

            let space = self.uncomp.sz() - self.uncomp.pos();
            if space >= remaining.len() || can_split {
                let n = self.uncomp.push(remaining);
                remaining = &remaining[n..];
            } else {
                // Whole record does not fit; flush and size the next block
                // to hold it
                self.flush()?;
                self.uncomp
                    .grow(usize::max(remaining.len(), self.block_size));
            }
        }

        Ok(accepted)
    }

    /// Emits the current partial block and starts a new frame.
    ///
    /// The very first flush also writes the header skippable frame.
    pub fn flush(&mut self) -> Result<()> {
        if self.uncomp.pos() == 0 {
            return Ok(());
        }

        let first = std::mem::take(&mut self.first_block);
        let block_len = self.uncomp.pos() as u64;

        if matches!(self.sink, Sink::Threaded(_)) {
            self.write_block_mt(first)?;
        } else {
            self.write_block(first)?;
        }

        self.frame_pos += block_len;
        self.last_flush_try = 0;

        Ok(())
    }

    /// Flushes now if the next `size` bytes would overflow the current
    /// block, so records stay whole for genomic indexing.
    pub fn flush_try(&mut self, size: usize) -> Result<()> {
        if self.uncomp.pos() + size > self.uncomp.sz() {
            return self.flush();
        }
        self.last_flush_try = self.uncomp.pos() as u64;

        Ok(())
    }

    /// Flushes, then grows the uncompressed block target to `sz` bytes.
    pub fn set_block_size(&mut self, sz: usize) -> Result<()> {
        let sz = sz.max(1);
        self.block_size = sz;
        self.flush()?;
        self.uncomp.grow(sz);

        Ok(())
    }

    /// Records the genomic interval of the record about to be written.
    ///
    /// Call once per record, after [`Writer::flush_try`] with the record's
    /// size so the sub-block offset is exact. `tid` is the caller's
    /// reference id; `-1` marks unmapped records.
    pub fn idx_add(&mut self, tid: i32, beg: i64, end: i64) -> Result<()> {
        self.gindex
            .add_record(tid, beg, end, self.frame_pos, self.last_flush_try)
    }

    /// Attaches a shared worker pool and starts the dedicated writer
    /// thread. `qsize` bounds the in-flight jobs, 0 for auto.
    pub fn thread_pool(&mut self, pool: &Arc<ThreadPool>, qsize: usize) -> Result<()>
    where
        W: Send + 'static,
    {
        if !matches!(self.sink, Sink::Direct(_)) {
            return Err(Error::invalid_mode());
        }
        let Sink::Direct(out) = std::mem::replace(&mut self.sink, Sink::Closed) else {
            unreachable!("checked above");
        };

        let qsize = if qsize == 0 { pool.size() * 2 } else { qsize };
        let queue = Arc::new(OrderedQueue::new(qsize));
        let shared = Arc::new(WriterShared {
            jobs: Mutex::new(JobState::default()),
            drained: Condvar::new(),
        });

        let q = Arc::clone(&queue);
        let sh = Arc::clone(&shared);
        let st = Arc::clone(&self.seek_table);
        let io = std::thread::Builder::new()
            .name("bgzf2-writer-io".into())
            .spawn(move || writer_io(out, &q, &sh, &st))
            .map_err(Error::from)?;

        self.sink = Sink::Threaded(MtWriter {
            pool: Arc::clone(pool),
            queue,
            shared,
            io: Some(io),
        });

        Ok(())
    }

    /// Flushes and waits for all asynchronous work to be committed.
    pub fn drain(&mut self) -> Result<()> {
        self.flush()?;

        if let Sink::Threaded(mt) = &self.sink {
            // First wait for the worker queue to quiesce, then for the
            // writer thread to finish committing delivered jobs.
            mt.queue.wait_empty();
            let mut jobs = mt.shared.jobs.lock().expect("job mutex poisoned");
            while jobs.pending > 0 {
                jobs = mt.shared.drained.wait(jobs).expect("job mutex poisoned");
            }
        }

        Ok(())
    }

    /// Drains, writes the genomic and seekable index frames and returns the
    /// underlying writer.
    ///
    /// Closing is best-effort: the indices are written even when earlier
    /// asynchronous work failed, and the first error observed is returned.
    pub fn finish(mut self) -> Result<W> {
        let mut status = self.drain();

        let mut out = match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Direct(out) => out,
            Sink::Threaded(mut mt) => {
                mt.queue.shutdown();
                let io = mt.io.take().expect("io thread running");
                match io.join() {
                    Ok((st, out)) => {
                        if status.is_ok() {
                            status = st;
                        }
                        out
                    }
                    Err(_) => return Err(Error::cancelled()),
                }
            }
            Sink::Closed => return Err(Error::cancelled()),
        };

        let index_status = write_indices(&mut out, &self.seek_table, &self.gindex);
        if status.is_ok() {
            status = index_status;
        }

        status.map(|()| out)
    }

    /// A snapshot view of the seekable index built so far.
    pub fn seek_table(&self) -> SeekTable {
        self.seek_table
            .lock()
            .expect("seek table mutex poisoned")
            .clone()
    }

    /// Compresses and writes the current block within the calling thread.
    fn write_block(&mut self, first: bool) -> Result<()> {
        codec::compress_block(self.uncomp.written(), &mut self.comp, self.level)?;
        let csize = self.comp.sz() as u32;

        let Sink::Direct(out) = &mut self.sink else {
            return Err(Error::cancelled());
        };
        let mut st = self.seek_table.lock().expect("seek table mutex poisoned");

        if first {
            let (hdr, len) = frame::header_frame(self.uncomp.written());
            st.log_frame(len as u32, 0)?;
            out.write_all(&hdr[..len])?;
        }

        frame::write_size_preface(out, csize)?;
        st.log_frame(SIZE_PREFACE_FRAME_SIZE as u32, 0)?;
        st.log_frame(csize, self.uncomp.pos() as u32)?;
        drop(st);

        out.write_all(self.comp.filled())?;
        self.uncomp.rewind();

        Ok(())
    }

    /// Copies the current block into a pooled job and dispatches it, so the
    /// caller can keep writing immediately.
    fn write_block_mt(&mut self, first: bool) -> Result<()> {
        let Sink::Threaded(mt) = &self.sink else {
            return Err(Error::cancelled());
        };

        let mut job = {
            let mut jobs = mt.shared.jobs.lock().expect("job mutex poisoned");
            jobs.pending += 1;
            jobs.free.pop().unwrap_or_default()
        };
        job.first_block = first;
        job.err = None;
        let n = self.uncomp.pos();
        job.uncomp.grow(n);
        job.uncomp.space()[..n].copy_from_slice(self.uncomp.written());
        job.uncomp.rewind();

        let level = self.level;
        let dispatched = dispatch(&mt.queue, &mt.pool, move || {
            if let Err(e) = codec::compress_block(job.uncomp.filled(), &mut job.comp, level) {
                job.err = Some(e);
            }
            job
        });

        if let Err(e) = dispatched {
            let mut jobs = mt.shared.jobs.lock().expect("job mutex poisoned");
            jobs.pending -= 1;
            return Err(e);
        }

        self.uncomp.rewind();

        Ok(())
    }
}

impl<W> Drop for Writer<W> {
    fn drop(&mut self) {
        if let Sink::Threaded(mut mt) = std::mem::replace(&mut self.sink, Sink::Closed) {
            mt.queue.shutdown();
            if let Some(io) = mt.io.take() {
                let _ = io.join();
            }
        }
    }
}

/// The dedicated writer thread.
///
/// Takes compressed jobs off the result queue in submission order and
/// commits them: header frame for the first block, size preface, index
/// entries, payload. Index mutations happen under the seek-table lock so
/// cumulative offsets stay monotonic.
fn writer_io<W: Write>(
    mut out: W,
    queue: &OrderedQueue<EncodeJob>,
    shared: &WriterShared,
    seek_table: &Mutex<SeekTable>,
) -> (Result<()>, W) {
    let mut status: Result<()> = Ok(());
    let mut completed: u32 = 0;

    while let Some(mut job) = queue.next_result_wait() {
        if status.is_ok() {
            status = write_job(&mut out, &mut job, seek_table, &mut completed);
            if status.is_err() {
                // Stop accepting new work but keep consuming results so the
                // main thread can drain
                queue.shutdown();
            }
        }

        let mut jobs = shared.jobs.lock().expect("job mutex poisoned");
        jobs.pending -= 1;
        jobs.free.push(job);
        drop(jobs);
        shared.drained.notify_all();
    }

    if status.is_ok() {
        status = out.flush().map_err(Error::from);
    }

    (status, out)
}

fn write_job<W: Write>(
    out: &mut W,
    job: &mut EncodeJob,
    seek_table: &Mutex<SeekTable>,
    completed: &mut u32,
) -> Result<()> {
    if let Some(e) = job.err.take() {
        return Err(e);
    }
    let csize = job.comp.sz() as u32;

    let mut st = seek_table.lock().expect("seek table mutex poisoned");
    if job.first_block {
        let (hdr, len) = frame::header_frame(job.uncomp.filled());
        st.log_frame(len as u32, 0)?;
        out.write_all(&hdr[..len])?;
    }
    frame::write_size_preface(out, csize)?;
    st.log_frame(SIZE_PREFACE_FRAME_SIZE as u32, 0)?;
    st.log_frame(csize, job.uncomp.sz() as u32)?;
    drop(st);

    out.write_all(job.comp.filled())?;

    *completed += 1;
    // Spread fsync cost over the run instead of paying it all at close
    if *completed % 32 == 0 {
        out.flush()?;
    }

    Ok(())
}

/// Appends the genomic index (when present) and the seekable index.
///
/// The genomic index frame is itself recorded in the seekable index with an
/// uncompressed size of zero, keeping the cumulative compressed offsets
/// correct.
fn write_indices<W: Write>(
    out: &mut W,
    seek_table: &Mutex<SeekTable>,
    gindex: &GenomicIndex,
) -> Result<()> {
    let mut st = seek_table.lock().expect("seek table mutex poisoned");

    if !gindex.is_empty() {
        let frame = gindex.serialize();
        st.log_frame(frame.len() as u32, 0)?;
        out.write_all(&frame)?;
    }

    out.write_all(&st.serialize())?;
    out.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SEEKABLE_MAGIC_NUMBER;

    #[test]
    fn tiny_blocks_split_as_expected() {
        let mut w = Writer::new(Vec::new(), 5);
        w.set_block_size(4).unwrap();
        w.write(b"hello world", true).unwrap();
        let st = w.seek_table();
        let out = w.finish().unwrap();

        // Header + 3 data frames of 4, 4 and 3 bytes, each with a preface
        assert_eq!(st.num_entries(), 1 + 3 * 2);
        assert_eq!(st.size_decomp(), 11);
        assert_eq!(st.size_comp() as usize + st.encoded_len(), out.len());
        assert_eq!(&out[out.len() - 4..], &SEEKABLE_MAGIC_NUMBER.to_le_bytes());
    }

    #[test]
    fn unsplittable_record_grows_block() {
        let mut w = Writer::new(Vec::new(), 1);
        w.set_block_size(8).unwrap();
        w.write(b"abcd", false).unwrap();
        // 12 bytes cannot split: the 4 buffered bytes flush first, then the
        // record goes into one grown block
        w.write(b"0123456789ab", false).unwrap();
        w.flush().unwrap();

        let st = w.seek_table();
        w.finish().unwrap();
        // header, then two prefaced data frames of 4 and 12 bytes
        assert_eq!(st.num_entries(), 5);
        assert_eq!(st.size_decomp(), 16);
    }

    #[test]
    fn flush_try_keeps_records_whole() {
        let mut w = Writer::new(Vec::new(), 3);
        w.set_block_size(10).unwrap();
        w.write(b"12345678", true).unwrap();
        // The next 5 bytes would cross the boundary, so this flushes
        w.flush_try(5).unwrap();
        w.write(b"abcde", true).unwrap();
        w.flush().unwrap();

        let st = w.seek_table();
        w.finish().unwrap();
        assert_eq!(st.num_entries(), 5);
        assert_eq!(st.size_decomp(), 13);
    }

    #[test]
    fn empty_stream_still_gets_an_index() {
        let out = Writer::new(Vec::new(), 5).finish().unwrap();
        let mut src = std::io::Cursor::new(out);
        let (st, _) = SeekTable::from_seekable(&mut src).unwrap();
        assert_eq!(st.num_entries(), 0);
    }
}
