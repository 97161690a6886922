use zstd_safe::{ErrorCode, get_error_name};

/// A `Result` alias where the `Err` case is `bgzf2::Error`.
pub type Result<T> = core::result::Result<T, Error>;

/// The errors that may occur when working with this crate.
#[derive(Debug)]
pub struct Error {
    kind: Kind,
}

impl Error {
    pub(crate) fn not_seekable() -> Self {
        Self {
            kind: Kind::NotSeekable,
        }
    }

    /// Returns true if the operation required a seekable input but the stream
    /// is a pipe.
    pub fn is_not_seekable(&self) -> bool {
        matches!(self.kind, Kind::NotSeekable)
    }

    pub(crate) fn index_missing() -> Self {
        Self {
            kind: Kind::IndexMissing,
        }
    }

    /// Returns true if a seekable or genomic index footer was not found.
    pub fn is_index_missing(&self) -> bool {
        matches!(self.kind, Kind::IndexMissing)
    }

    pub(crate) fn index_corrupt() -> Self {
        Self {
            kind: Kind::IndexCorrupt,
        }
    }

    /// Returns true if an index footer was found but its sentinel, length or
    /// magic did not validate.
    pub fn is_index_corrupt(&self) -> bool {
        matches!(self.kind, Kind::IndexCorrupt)
    }

    pub(crate) fn codec(msg: &'static str) -> Self {
        Self {
            kind: Kind::Codec(msg),
        }
    }

    /// Returns true if zstd reported an error or a frame's content size did
    /// not match the decompressed data.
    pub fn is_codec(&self) -> bool {
        matches!(self.kind, Kind::Codec(_) | Kind::Zstd(_))
    }

    pub(crate) fn out_of_range() -> Self {
        Self {
            kind: Kind::OutOfRange,
        }
    }

    /// Returns true if a query or seek went past the end of the logical
    /// stream.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, Kind::OutOfRange)
    }

    pub(crate) fn resource_exhausted() -> Self {
        Self {
            kind: Kind::ResourceExhausted,
        }
    }

    /// Returns true if an allocation failed or an advertised block size
    /// exceeded [`crate::BGZF2_MAX_BLOCK_SIZE`].
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.kind, Kind::ResourceExhausted)
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            kind: Kind::Cancelled,
        }
    }

    /// Returns true if the handle was closing while the operation was in
    /// flight.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, Kind::Cancelled)
    }

    pub(crate) fn invalid_mode() -> Self {
        Self {
            kind: Kind::InvalidMode,
        }
    }

    /// Returns true if a mode string was unrecognized, a compression level
    /// was out of range, or an operation does not apply to the handle's mode.
    pub fn is_invalid_mode(&self) -> bool {
        matches!(self.kind, Kind::InvalidMode)
    }

    /// Returns true if the error origins from an IO error.
    pub fn is_io(&self) -> bool {
        matches!(self.kind, Kind::Io(_))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.kind {
            Kind::Io(err) => write!(f, "io error: {err}"),
            Kind::NotSeekable => f.write_str("stream is not seekable"),
            Kind::IndexMissing => f.write_str("index not found"),
            Kind::IndexCorrupt => f.write_str("index corrupt"),
            Kind::Codec(msg) => f.write_str(msg),
            Kind::Zstd(code) => f.write_str(get_error_name(*code)),
            Kind::OutOfRange => f.write_str("offset out of range"),
            Kind::ResourceExhausted => f.write_str("resource limit exceeded"),
            Kind::Cancelled => f.write_str("operation cancelled"),
            Kind::InvalidMode => f.write_str("invalid mode"),
        }
    }
}

impl core::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        let kind = if value.kind() == std::io::ErrorKind::NotSeekable {
            Kind::NotSeekable
        } else {
            Kind::Io(value)
        };
        Self { kind }
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self {
            kind: Kind::Zstd(value),
        }
    }
}

enum Kind {
    /// The underlying file handle failed.
    Io(std::io::Error),
    /// The operation requires a seekable input but the stream is a pipe.
    NotSeekable,
    /// Seekable or genomic index footer not found.
    IndexMissing,
    /// Index footer found but sentinel, length or magic invalid.
    IndexCorrupt,
    /// A content-size or length mismatch in a data frame.
    Codec(&'static str),
    /// An error from the zstd library.
    Zstd(ErrorCode),
    /// Query or seek past the end of the logical stream.
    OutOfRange,
    /// Allocation failed or an advertised block exceeds the size limit.
    ResourceExhausted,
    /// The handle is closing while the operation is in flight.
    Cancelled,
    /// Mode string unrecognized or level out of range.
    InvalidMode,
}

impl core::fmt::Debug for Kind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(arg0) => f.debug_tuple("Io").field(arg0).finish(),
            Self::NotSeekable => write!(f, "NotSeekable"),
            Self::IndexMissing => write!(f, "IndexMissing"),
            Self::IndexCorrupt => write!(f, "IndexCorrupt"),
            Self::Codec(msg) => f.debug_tuple("Codec").field(msg).finish(),
            Self::Zstd(c) => write!(f, "{}; code {}", get_error_name(*c), c),
            Self::OutOfRange => write!(f, "OutOfRange"),
            Self::ResourceExhausted => write!(f, "ResourceExhausted"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::InvalidMode => write!(f, "InvalidMode"),
        }
    }
}
