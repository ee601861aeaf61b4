use std::fmt::{self, Display, Formatter};
use std::io;

/// Information about the particular failure encountered by the pipeline.
///
/// Only conditions that abort parsing of the current packet or the whole
/// run are modelled here. Recoverable stream-framing oddities (lost sync,
/// continuity gaps, Hamming/parity failures) are logged via the `log`
/// facade and never surface as an `Error`.
#[derive(Debug)]
pub enum ErrorDetails {
    /// A [`crate::slice_reader::SliceReader`] read past the end of its slice.
    PacketOverrun(usize),
    /// A packet's sync byte was not `0x47`.
    LostSync,
    /// An adaptation field declared an inconsistent length.
    BadAdaptationField,
    /// A PSI section header declared an inconsistent length.
    BadPsiHeader,
    /// A PSI section failed its CRC32 check.
    PsiCrcMismatch,
    /// A PES header declared an inconsistent length.
    BadPesHeader,
    /// The configured/auto-selected teletext page is out of the 100..899 range.
    PageOutOfRange(u16),
    /// The configured teletext PID is out of the 13-bit range.
    PidOutOfRange(u32),
    /// `-i -` was given; reading stdin is not supported.
    StdinInputRejected,
    /// Wraps an I/O failure encountered opening/reading/writing a file.
    Io(io::Error),
}

/// Error type encapsulating all possible parser/CLI failures.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet the error was encountered at, if applicable.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    pub(crate) fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }

    pub(crate) fn config(details: ErrorDetails) -> Self {
        Self {
            location: 0,
            details,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::config(ErrorDetails::Io(e))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.details {
            ErrorDetails::PacketOverrun(len) => {
                write!(f, "read of {} bytes overran the packet", len)
            }
            ErrorDetails::LostSync => write!(f, "lost sync byte"),
            ErrorDetails::BadAdaptationField => write!(f, "malformed adaptation field"),
            ErrorDetails::BadPsiHeader => write!(f, "malformed PSI section header"),
            ErrorDetails::PsiCrcMismatch => write!(f, "PSI section failed CRC32 check"),
            ErrorDetails::BadPesHeader => write!(f, "malformed PES header"),
            ErrorDetails::PageOutOfRange(p) => write!(f, "page {} out of range 100..899", p),
            ErrorDetails::PidOutOfRange(p) => write!(f, "PID {:#x} out of 13-bit range", p),
            ErrorDetails::StdinInputRejected => write!(f, "reading input from stdin (-i -) is not supported"),
            ErrorDetails::Io(e) => write!(f, "I/O error: {}", e),
        }
        .and_then(|_| {
            if self.location != 0 {
                write!(f, " (at byte {})", self.location)
            } else {
                Ok(())
            }
        })
    }
}

impl std::error::Error for Error {}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
