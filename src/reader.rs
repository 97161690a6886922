//! The decoder pipeline.
//!
//! Without a pool, blocks are read and decompressed on the calling thread.
//! With a pool attached, a dedicated reader thread pulls compressed frames
//! ahead of time and dispatches decode jobs to the workers; the consumer
//! swaps finished blocks into the handle's buffer in file order. Seeks,
//! EOF checks and shutdown travel to the reader thread over a command
//! channel guarded by a single mutex and condition variable.

use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use zstd_safe::{DCtx, InBuffer, OutBuffer};

use crate::{
    SEEKABLE_MAGIC_NUMBER,
    buffer::Buffer,
    codec::{self, FrameSize},
    error::{Error, Result},
    frame::{self, NextFrame},
    gindex::GenomicIndex,
    seek_table::SeekTable,
    tpool::{OrderedQueue, Reserve, ThreadPool},
};

/// Result of probing for the seekable-index sentinel at the end of the
/// file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofStatus {
    /// The sentinel is absent; the file may be truncated.
    Absent,
    /// The sentinel is present.
    Present,
    /// The source cannot be checked, e.g. a pipe.
    CannotCheck,
}

/// Why a seek performed by the reader thread failed.
#[derive(Debug, Clone, Copy)]
enum FailCode {
    NotSeekable,
    IndexMissing,
    IndexCorrupt,
    OutOfRange,
    Io,
}

impl FailCode {
    fn from_error(e: &Error) -> Self {
        if e.is_not_seekable() {
            Self::NotSeekable
        } else if e.is_index_missing() {
            Self::IndexMissing
        } else if e.is_index_corrupt() {
            Self::IndexCorrupt
        } else if e.is_out_of_range() {
            Self::OutOfRange
        } else {
            Self::Io
        }
    }

    fn into_error(self) -> Error {
        match self {
            Self::NotSeekable => Error::not_seekable(),
            Self::IndexMissing => Error::index_missing(),
            Self::IndexCorrupt => Error::index_corrupt(),
            Self::OutOfRange => Error::out_of_range(),
            Self::Io => std::io::Error::other("io error in reader thread").into(),
        }
    }
}

/// Command channel states for messaging with the reader thread.
#[derive(Debug, Clone, Copy)]
enum Command {
    None,
    Seek(u64),
    SeekDone,
    SeekFail(FailCode),
    HasEof,
    HasEofDone(EofStatus),
    Close,
}

struct CommandState {
    command: Command,
    /// Residual offset into the first block delivered after a seek.
    pending_pos: u64,
}

/// Work-load for one decompression job.
#[derive(Default)]
struct DecodeJob {
    comp: Buffer,
    uncomp: Buffer,
    known_size: bool,
    hit_eof: bool,
    err: Option<Error>,
}

/// Indices loaded once by the reader thread before streaming starts.
struct Indices {
    seek_table: std::result::Result<(SeekTable, u64), FailCode>,
    gindex: std::result::Result<Option<GenomicIndex>, FailCode>,
}

struct ReaderShared {
    command: Mutex<CommandState>,
    cond: Condvar,
    indices: Mutex<Option<Arc<Indices>>>,
    indices_cond: Condvar,
    jobs: Mutex<Vec<DecodeJob>>,
}

struct MtReader<R> {
    queue: Arc<OrderedQueue<DecodeJob>>,
    shared: Arc<ReaderShared>,
    io: Option<JoinHandle<R>>,
}

/// Streaming fallback for input that is plain zstd without size prefaces.
struct StreamDecoder {
    dctx: DCtx<'static>,
    in_buf: Vec<u8>,
    pos: usize,
    len: usize,
    at_boundary: bool,
}

impl StreamDecoder {
    fn new(replay: &[u8; 8]) -> Result<Self> {
        let dctx = DCtx::try_create().ok_or_else(Error::resource_exhausted)?;
        let mut in_buf = vec![0u8; usize::max(DCtx::in_size(), replay.len())];
        in_buf[..replay.len()].copy_from_slice(replay);

        Ok(Self {
            dctx,
            in_buf,
            pos: 0,
            len: replay.len(),
            at_boundary: false,
        })
    }
}

/// Reads a bgzf2 stream.
///
/// Reading is lazy: no I/O happens before the first read, seek or query.
/// Input that turns out to be plain zstd (no size prefaces) downgrades to
/// streaming decompression; random access then reports the index as
/// missing.
pub struct Reader<R> {
    src: Option<R>,
    uncomp: Buffer,
    comp: Buffer,
    hit_eof: bool,
    stream: Option<StreamDecoder>,
    seek_table: Option<(SeekTable, u64)>,
    gindex: Option<GenomicIndex>,
    mt: Option<MtReader<R>>,
}

impl<R> Reader<R> {
    /// Signals the reader thread to shut down, returning its join handle.
    fn shutdown_mt(&mut self) -> Option<JoinHandle<R>> {
        let mut mt = self.mt.take()?;
        {
            let mut cs = mt.shared.command.lock().expect("command mutex poisoned");
            cs.command = Command::Close;
            mt.shared.cond.notify_all();
        }
        mt.queue.wake_dispatch();
        mt.queue.shutdown();

        mt.io.take()
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Creates a reader over `src`.
    pub fn new(src: R) -> Self {
        Self {
            src: Some(src),
            uncomp: Buffer::new(),
            comp: Buffer::new(),
            hit_eof: false,
            stream: None,
            seek_table: None,
            gindex: None,
            mt: None,
        }
    }

    /// Copies up to `buf.len()` decoded bytes into `buf`.
    ///
    /// Returns the number of bytes read, 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.hit_eof {
            return Ok(0);
        }

        let mut decoded = 0;
        while decoded < buf.len() {
            if self.uncomp.is_exhausted() && self.refill()? == 0 {
                break;
            }

            let pos = self.uncomp.pos();
            let n = usize::min(self.uncomp.sz() - pos, buf.len() - decoded);
            buf[decoded..decoded + n].copy_from_slice(&self.uncomp.filled()[pos..pos + n]);
            self.uncomp.set_pos(pos + n);
            decoded += n;
        }

        Ok(decoded)
    }

    /// Borrows up to `n` decoded bytes straight out of the internal buffer.
    ///
    /// The returned slice is between 1 and `n` bytes long, or empty at end
    /// of stream. The borrow is valid until the next operation on this
    /// reader.
    pub fn read_zero_copy(&mut self, n: usize) -> Result<&[u8]> {
        if self.hit_eof || n == 0 {
            return Ok(&[]);
        }
        if self.uncomp.is_exhausted() && self.refill()? == 0 {
            return Ok(&[]);
        }

        let pos = self.uncomp.pos();
        let take = usize::min(n, self.uncomp.sz() - pos);
        self.uncomp.set_pos(pos + take);

        Ok(&self.uncomp.filled()[pos..pos + take])
    }

    /// Reads one delimited record into `out`.
    ///
    /// The delimiter is consumed but not stored. A trailing `\r` is
    /// stripped when the delimiter is `\n`. Returns the record length, or
    /// `None` at end of stream.
    pub fn getline(&mut self, delim: u8, out: &mut Vec<u8>) -> Result<Option<usize>> {
        out.clear();
        if self.hit_eof {
            return Ok(None);
        }

        let mut found = false;
        while !found {
            if self.uncomp.is_exhausted() && self.refill()? == 0 {
                break;
            }

            let pos = self.uncomp.pos();
            match self.uncomp.filled()[pos..].iter().position(|&b| b == delim) {
                Some(i) => {
                    out.extend_from_slice(&self.uncomp.filled()[pos..pos + i]);
                    self.uncomp.set_pos(pos + i + 1);
                    found = true;
                }
                None => {
                    out.extend_from_slice(&self.uncomp.filled()[pos..]);
                    let sz = self.uncomp.sz();
                    self.uncomp.set_pos(sz);
                }
            }
        }

        if !found && out.is_empty() {
            return Ok(None);
        }
        if delim == b'\n' && out.last() == Some(&b'\r') {
            out.pop();
        }

        Ok(Some(out.len()))
    }

    /// Returns the next byte without consuming it, or `None` at end of
    /// stream.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        if self.hit_eof {
            return Ok(None);
        }
        if self.uncomp.is_exhausted() && self.refill()? == 0 {
            return Ok(None);
        }

        Ok(Some(self.uncomp.unread()[0]))
    }

    /// Repositions to uncompressed offset `upos`.
    ///
    /// Loads the seekable index on first use.
    ///
    /// # Errors
    ///
    /// Fails with an out-of-range error for `upos` at or past the end of
    /// the logical stream, without advancing the read position.
    pub fn seek(&mut self, upos: u64) -> Result<()> {
        if self.mt.is_some() {
            return self.seek_mt(upos);
        }

        self.load_seek_table()?;
        let (st, _) = self.seek_table.as_ref().expect("loaded above");
        let entry = *st.query(upos)?;

        let src = self.src.as_mut().ok_or_else(Error::cancelled)?;
        src.seek(SeekFrom::Start(entry.cpos))?;
        self.stream = None;
        self.hit_eof = false;
        self.uncomp.set_sz(0);
        self.uncomp.set_pos(0);

        if self.decode_block()? == 0 {
            return Err(Error::out_of_range());
        }
        self.uncomp.set_pos((upos - entry.pos) as usize);

        Ok(())
    }

    /// Resolves a genomic range to an uncompressed offset suitable for
    /// [`Reader::seek`].
    ///
    /// Loads the indices on first use. Returns [`crate::QUERY_EOF`] when
    /// the range lies beyond all indexed data.
    pub fn query(&mut self, tid: i32, beg: i64, end: i64) -> Result<u64> {
        if self.mt.is_some() {
            return self.query_mt(tid, beg, end);
        }

        self.load_seek_table()?;
        if self.gindex.is_none() {
            let index_sz = self.seek_table.as_ref().expect("loaded above").1;
            let src = self.src.as_mut().ok_or_else(Error::cancelled)?;
            let saved = src.stream_position()?;
            let loaded = GenomicIndex::from_seekable(src, index_sz)?;
            src.seek(SeekFrom::Start(saved))?;
            self.gindex = Some(loaded.ok_or_else(Error::index_missing)?);
        }

        self.gindex
            .as_ref()
            .expect("loaded above")
            .query(tid, beg, end)
    }

    /// Peeks at the last four bytes of the file for the seekable-index
    /// sentinel.
    pub fn check_eof(&mut self) -> Result<EofStatus> {
        if self.mt.is_some() {
            return self.check_eof_mt();
        }
        let src = self.src.as_mut().ok_or_else(Error::cancelled)?;

        check_eof_on(src)
    }

    /// Attaches a shared worker pool and starts the dedicated reader
    /// thread. `qsize` bounds the read-ahead, 0 for auto.
    pub fn thread_pool(&mut self, pool: &Arc<ThreadPool>, qsize: usize) -> Result<()>
    where
        R: Send + 'static,
    {
        if self.mt.is_some() {
            return Err(Error::invalid_mode());
        }
        let src = self.src.take().ok_or_else(Error::cancelled)?;

        let qsize = if qsize == 0 { pool.size() * 2 } else { qsize };
        let queue = Arc::new(OrderedQueue::new(qsize));
        let shared = Arc::new(ReaderShared {
            command: Mutex::new(CommandState {
                command: Command::None,
                pending_pos: 0,
            }),
            cond: Condvar::new(),
            indices: Mutex::new(None),
            indices_cond: Condvar::new(),
            jobs: Mutex::new(Vec::new()),
        });

        let p = Arc::clone(pool);
        let q = Arc::clone(&queue);
        let sh = Arc::clone(&shared);
        let io = std::thread::Builder::new()
            .name("bgzf2-reader-io".into())
            .spawn(move || reader_io(src, &p, &q, &sh))
            .map_err(Error::from)?;

        self.mt = Some(MtReader {
            queue,
            shared,
            io: Some(io),
        });

        Ok(())
    }

    /// Shuts down asynchronous work and returns the underlying source.
    pub fn finish(mut self) -> Result<R> {
        if let Some(io) = self.shutdown_mt() {
            return io.join().map_err(|_| Error::cancelled());
        }

        self.src.take().ok_or_else(Error::cancelled)
    }

    /// Makes the next uncompressed bytes available, refilling the buffer
    /// from the pipeline when it is exhausted. Returns 0 at end of stream.
    fn refill(&mut self) -> Result<usize> {
        if !self.uncomp.is_exhausted() {
            return Ok(self.uncomp.sz() - self.uncomp.pos());
        }

        let n = if self.mt.is_some() {
            self.decode_block_mt()
        } else {
            self.decode_block()
        }?;
        if n == 0 {
            self.hit_eof = true;
        }

        Ok(n)
    }

    /// Reads and decompresses the next block on the calling thread.
    fn decode_block(&mut self) -> Result<usize> {
        if self.stream.is_some() {
            return self.stream_refill();
        }
        let src = self.src.as_mut().ok_or_else(Error::cancelled)?;

        match frame::read_frame(src, &mut self.comp)? {
            NextFrame::Eof => Ok(0),
            NextFrame::Data(size) => {
                codec::decompress_block(self.comp.filled(), &mut self.uncomp, size)
            }
            NextFrame::Raw(hdr) => {
                self.stream = Some(StreamDecoder::new(&hdr)?);
                self.stream_refill()
            }
        }
    }

    /// One round of the streaming fallback. Produces at least one byte
    /// unless the stream is exhausted.
    fn stream_refill(&mut self) -> Result<usize> {
        let sd = self.stream.as_mut().expect("stream mode active");
        let src = self.src.as_mut().ok_or_else(Error::cancelled)?;
        self.uncomp.grow(DCtx::out_size());

        loop {
            if sd.pos == sd.len {
                sd.len = src.read(&mut sd.in_buf)?;
                sd.pos = 0;
                if sd.len == 0 {
                    if !sd.at_boundary {
                        return Err(Error::codec("truncated zstd stream"));
                    }
                    self.uncomp.set_sz(0);
                    self.uncomp.set_pos(0);
                    return Ok(0);
                }
            }

            let cap = self.uncomp.alloc();
            let mut out = OutBuffer::around(&mut self.uncomp.space()[..cap]);
            let mut inb = InBuffer::around(&sd.in_buf[sd.pos..sd.len]);
            let hint = sd.dctx.decompress_stream(&mut out, &mut inb)?;
            sd.pos += inb.pos();
            sd.at_boundary = hint == 0;

            if out.pos() > 0 {
                let n = out.pos();
                self.uncomp.set_sz(n);
                self.uncomp.set_pos(0);
                return Ok(n);
            }
        }
    }

    /// Waits for the next decoded block from the pipeline and swaps it into
    /// the exposed buffer.
    fn decode_block_mt(&mut self) -> Result<usize> {
        let mt = self.mt.as_mut().expect("pool attached");

        let Some(mut job) = mt.queue.next_result_wait() else {
            return Err(Error::cancelled());
        };

        if let Some(e) = job.err.take() {
            // Stop consuming after a pipeline error; the reader thread has
            // parked itself behind this sentinel
            self.hit_eof = true;
            mt.shared.jobs.lock().expect("job mutex poisoned").push(job);
            return Err(e);
        }
        if job.hit_eof {
            mt.shared.jobs.lock().expect("job mutex poisoned").push(job);
            return Ok(0);
        }

        // Swap instead of copy; the job exclusively owns its buffer here
        std::mem::swap(&mut self.uncomp, &mut job.uncomp);
        mt.shared.jobs.lock().expect("job mutex poisoned").push(job);

        // A seek leaves the offset into the destination block behind
        let residual = {
            let mut cs = mt.shared.command.lock().expect("command mutex poisoned");
            std::mem::take(&mut cs.pending_pos)
        };
        self.uncomp.set_pos(residual as usize);

        Ok(self.uncomp.sz())
    }

    fn seek_mt(&mut self, upos: u64) -> Result<()> {
        {
            let mt = self.mt.as_ref().expect("pool attached");
            let mut cs = mt.shared.command.lock().expect("command mutex poisoned");
            cs.command = Command::Seek(upos);
            mt.shared.cond.notify_all();
            mt.queue.wake_dispatch();

            loop {
                cs = mt.shared.cond.wait(cs).expect("command mutex poisoned");
                match cs.command {
                    Command::SeekDone => {
                        cs.command = Command::None;
                        break;
                    }
                    Command::SeekFail(code) => {
                        cs.command = Command::None;
                        return Err(code.into_error());
                    }
                    // Woken before the reader processed the command; pass
                    // the signal on
                    Command::Seek(_) => mt.shared.cond.notify_all(),
                    _ => {}
                }
            }
        }

        self.hit_eof = false;
        self.uncomp.set_sz(0);
        self.uncomp.set_pos(0);

        Ok(())
    }

    fn query_mt(&mut self, tid: i32, beg: i64, end: i64) -> Result<u64> {
        let mt = self.mt.as_ref().expect("pool attached");
        let indices = wait_indices(&mt.shared);

        match &indices.gindex {
            Ok(Some(g)) => g.query(tid, beg, end),
            Ok(None) => Err(Error::index_missing()),
            Err(code) => Err(code.into_error()),
        }
    }

    fn check_eof_mt(&mut self) -> Result<EofStatus> {
        let mt = self.mt.as_ref().expect("pool attached");
        let mut cs = mt.shared.command.lock().expect("command mutex poisoned");
        cs.command = Command::HasEof;
        mt.shared.cond.notify_all();
        mt.queue.wake_dispatch();

        loop {
            cs = mt.shared.cond.wait(cs).expect("command mutex poisoned");
            match cs.command {
                Command::HasEofDone(status) => {
                    cs.command = Command::None;
                    return Ok(status);
                }
                Command::HasEof => mt.shared.cond.notify_all(),
                _ => {}
            }
        }
    }

    /// Loads the seekable index, restoring the read position afterwards.
    fn load_seek_table(&mut self) -> Result<()> {
        if self.seek_table.is_some() {
            return Ok(());
        }
        let src = self.src.as_mut().ok_or_else(Error::cancelled)?;
        let saved = src.stream_position()?;
        let loaded = SeekTable::from_seekable(src)?;
        src.seek(SeekFrom::Start(saved))?;
        self.seek_table = Some(loaded);

        Ok(())
    }
}

impl<R> Drop for Reader<R> {
    fn drop(&mut self) {
        if let Some(io) = self.shutdown_mt() {
            let _ = io.join();
        }
    }
}

fn check_eof_on<R: Read + Seek>(src: &mut R) -> Result<EofStatus> {
    let saved = match src.stream_position() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotSeekable => return Ok(EofStatus::CannotCheck),
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = src.seek(SeekFrom::End(-4)) {
        if e.kind() == std::io::ErrorKind::NotSeekable {
            return Ok(EofStatus::CannotCheck);
        }
        return Err(e.into());
    }

    let mut buf = [0u8; 4];
    src.read_exact(&mut buf)?;
    src.seek(SeekFrom::Start(saved))?;

    let status = if buf == SEEKABLE_MAGIC_NUMBER.to_le_bytes() {
        EofStatus::Present
    } else {
        EofStatus::Absent
    };

    Ok(status)
}

fn wait_indices(shared: &ReaderShared) -> Arc<Indices> {
    let mut slot = shared.indices.lock().expect("index mutex poisoned");
    loop {
        if let Some(indices) = slot.as_ref() {
            return Arc::clone(indices);
        }
        slot = shared
            .indices_cond
            .wait(slot)
            .expect("index mutex poisoned");
    }
}

/// What the reader thread does after a dispatch or command round.
enum Flow {
    Continue,
    Restart,
    Exit,
}

enum Action {
    None,
    Restart,
    Exit,
}

/// The dedicated reader thread.
///
/// Loads the indices once, then repeatedly reads one compressed frame,
/// pre-sizes the output when the content size is known, and dispatches a
/// decode job. The command channel is polled after every dispatch and
/// waited on after EOF. Returns the source on shutdown.
fn reader_io<R: Read + Seek>(
    mut src: R,
    pool: &ThreadPool,
    queue: &Arc<OrderedQueue<DecodeJob>>,
    shared: &ReaderShared,
) -> R {
    {
        let indices = load_indices(&mut src);
        *shared.indices.lock().expect("index mutex poisoned") = Some(Arc::new(indices));
        shared.indices_cond.notify_all();
    }

    'restart: loop {
        let flow = loop {
            let mut job = take_job(shared);
            read_one(&mut src, &mut job);
            let sentinel = job.hit_eof;

            match dispatch_decode(&mut src, pool, queue, shared, job) {
                Flow::Continue if sentinel => break Flow::Continue,
                Flow::Continue => match service_command(&mut src, shared, queue, false) {
                    Action::Restart => break Flow::Restart,
                    Action::Exit => break Flow::Exit,
                    Action::None => {}
                },
                other => break other,
            }
        };

        match flow {
            Flow::Restart => {}
            Flow::Exit => break,
            // EOF (or an error sentinel) was dispatched; park on the
            // command channel until a seek restarts us or the handle closes
            Flow::Continue => match service_command(&mut src, shared, queue, true) {
                Action::Restart => {}
                _ => break,
            },
        }
    }

    src
}

fn load_indices<R: Read + Seek>(src: &mut R) -> Indices {
    let start = src.stream_position().unwrap_or(0);

    let seek_table = SeekTable::from_seekable(src).map_err(|e| FailCode::from_error(&e));
    let gindex = match &seek_table {
        Ok((_, index_sz)) => GenomicIndex::from_seekable(src, *index_sz)
            .map_err(|e| FailCode::from_error(&e)),
        Err(code) => Err(*code),
    };

    // Resume where the handle left off; on a pipe nothing was consumed
    let _ = src.seek(SeekFrom::Start(start));

    Indices { seek_table, gindex }
}

fn take_job(shared: &ReaderShared) -> DecodeJob {
    let mut job = shared
        .jobs
        .lock()
        .expect("job mutex poisoned")
        .pop()
        .unwrap_or_default();
    job.err = None;
    job.hit_eof = false;
    job.known_size = false;

    job
}

/// Reads one compressed frame into the job, marking it as an EOF or error
/// sentinel when the stream ends or cannot be parallel-decoded.
fn read_one<R: Read>(src: &mut R, job: &mut DecodeJob) {
    match frame::read_frame(src, &mut job.comp) {
        Ok(NextFrame::Data(FrameSize::Known(n))) => {
            if n > crate::BGZF2_MAX_BLOCK_SIZE {
                job.err = Some(Error::resource_exhausted());
                job.hit_eof = true;
            } else {
                job.uncomp.grow(n as usize);
                job.known_size = true;
            }
        }
        Ok(NextFrame::Data(FrameSize::Unknown)) => job.known_size = false,
        Ok(NextFrame::Eof) => job.hit_eof = true,
        Ok(NextFrame::Raw(_)) => {
            job.err = Some(Error::codec("cannot multi-thread an unframed zstd stream"));
            job.hit_eof = true;
        }
        Err(e) => {
            job.err = Some(e);
            job.hit_eof = true;
        }
    }
}

/// Dispatches `job` to the worker pool, servicing the command channel
/// whenever output backpressure blocks the reservation.
fn dispatch_decode<R: Read + Seek>(
    src: &mut R,
    pool: &ThreadPool,
    queue: &Arc<OrderedQueue<DecodeJob>>,
    shared: &ReaderShared,
    job: DecodeJob,
) -> Flow {
    let mut job = Some(job);

    loop {
        match queue.reserve() {
            Err(_) => return Flow::Exit,
            Ok(Reserve::Woken) => match service_command(src, shared, queue, false) {
                Action::Restart => {
                    // The frame read into this job predates the seek
                    if let Some(job) = job.take() {
                        shared.jobs.lock().expect("job mutex poisoned").push(job);
                    }
                    return Flow::Restart;
                }
                Action::Exit => return Flow::Exit,
                Action::None => {}
            },
            Ok(Reserve::Slot(serial)) => {
                let mut job = job.take().expect("job not yet dispatched");
                let q = Arc::clone(queue);
                pool.run(move || {
                    if job.err.is_none() && !job.hit_eof {
                        let size = if job.known_size {
                            FrameSize::Known(job.uncomp.sz() as u64)
                        } else {
                            FrameSize::Unknown
                        };
                        if let Err(e) =
                            codec::decompress_block(job.comp.filled(), &mut job.uncomp, size)
                        {
                            job.err = Some(e);
                        }
                    }
                    q.complete(serial, job);
                });
                return Flow::Continue;
            }
        }
    }
}

/// Observes and answers the command channel.
///
/// With `block` set, waits until a command arrives that ends this round:
/// a seek (restart reading) or close (exit).
fn service_command<R: Read + Seek>(
    src: &mut R,
    shared: &ReaderShared,
    queue: &OrderedQueue<DecodeJob>,
    block: bool,
) -> Action {
    let mut cs = shared.command.lock().expect("command mutex poisoned");

    loop {
        match cs.command {
            Command::Seek(upos) => {
                let (reply, residual) = mt_seek(src, shared, queue, upos);
                cs.command = reply;
                cs.pending_pos = residual;
                shared.cond.notify_all();
                return Action::Restart;
            }
            Command::HasEof => {
                let status = check_eof_on(src).unwrap_or(EofStatus::CannotCheck);
                cs.command = Command::HasEofDone(status);
                shared.cond.notify_all();
                if !block {
                    return Action::None;
                }
            }
            Command::Close => {
                shared.cond.notify_all();
                return Action::Exit;
            }
            // A reply the consumer has not picked up yet
            Command::SeekDone | Command::SeekFail(_) | Command::HasEofDone(_) => {
                shared.cond.notify_all();
                if !block {
                    return Action::None;
                }
            }
            Command::None => {
                if !block {
                    return Action::None;
                }
            }
        }

        cs = shared.cond.wait(cs).expect("command mutex poisoned");
    }
}

/// Performs a seek on behalf of the consumer: drains the pipeline,
/// repositions the file at the frame covering `upos` and leaves the
/// residual in-block offset for the consumer.
fn mt_seek<R: Read + Seek>(
    src: &mut R,
    shared: &ReaderShared,
    queue: &OrderedQueue<DecodeJob>,
    upos: u64,
) -> (Command, u64) {
    let indices = wait_indices(shared);
    let (st, _) = match &indices.seek_table {
        Ok(v) => v,
        Err(code) => return (Command::SeekFail(*code), 0),
    };

    let entry = match st.query(upos) {
        Ok(e) => *e,
        // The pipeline is untouched, reads resume as if nothing happened
        Err(e) => return (Command::SeekFail(FailCode::from_error(&e)), 0),
    };

    // Throw away all read-ahead, in flight or queued
    queue.reset();

    if src.seek(SeekFrom::Start(entry.cpos)).is_err() {
        return (Command::SeekFail(FailCode::Io), 0);
    }

    (Command::SeekDone, upos - entry.pos)
}
