use libc::c_int;
use std::borrow::Cow;
use std::{fmt, io, result};

/// Coarse classification of an [`Error`], for callers that match on the
/// failure class rather than the errno.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad configuration: missing keys, oversize stream name, non-local host.
    InvalidArgument,
    /// The server socket could not be reached.
    NotConnected,
    /// Socket read/write failure, short doorbell I/O, or a missing
    /// ancillary descriptor.
    Io,
    /// The server violated the command protocol (e.g. left `cmd` set).
    Protocol,
    /// Allocation of bookkeeping or a shared segment failed.
    ResourceExhausted,
    /// mmap/shmget/shmat/munmap/shmdt/close reported an errno.
    System,
    /// An operation was called in a stream state that does not allow it.
    BadState,
}

/// Most operations on a stream can fail with a negative errno, either raised
/// locally or returned by the server through the control block. Such codes
/// are wrapped into this `Error` struct, together with the name of the
/// operation that produced them and an [`ErrorKind`].
#[derive(Debug)]
pub struct Error(Option<Cow<'static, str>>, c_int, ErrorKind);

pub type Result<T> = result::Result<T, Error>;

fn kind_for(code: c_int) -> ErrorKind {
    match -code {
        libc::EINVAL => ErrorKind::InvalidArgument,
        libc::ENOMEM => ErrorKind::ResourceExhausted,
        libc::ENOENT | libc::ECONNREFUSED => ErrorKind::NotConnected,
        libc::EBADF | libc::EBADFD | libc::EPIPE | libc::EIO => ErrorKind::Io,
        _ => ErrorKind::System,
    }
}

/// Wraps a signed return value: negative values become errors, zero and
/// positive values pass through.
pub fn from_code(func: &'static str, r: c_int) -> Result<c_int> {
    if r < 0 { Err(Error::new(Some(func.into()), r)) }
    else { Ok(r) }
}

/// The server handed back a value outside the expected enum range.
pub(crate) fn bad_enum(func: &'static str, _value: c_int) -> Error {
    Error::with_kind(Some(func.into()), -libc::EBADFD, ErrorKind::Protocol)
}

impl Error {
    pub fn new(func: Option<Cow<'static, str>>, res: c_int) -> Error {
        let kind = kind_for(res);
        Error(func, res, kind)
    }

    pub(crate) fn with_kind(func: Option<Cow<'static, str>>, res: c_int, kind: ErrorKind) -> Error {
        Error(func, res, kind)
    }

    pub(crate) fn invalid_argument(func: &'static str) -> Error {
        Error::with_kind(Some(func.into()), -libc::EINVAL, ErrorKind::InvalidArgument)
    }

    pub(crate) fn not_connected(func: &'static str) -> Error {
        Error::with_kind(Some(func.into()), -libc::ECONNREFUSED, ErrorKind::NotConnected)
    }

    pub(crate) fn protocol(func: &'static str) -> Error {
        Error::with_kind(Some(func.into()), -libc::EBADFD, ErrorKind::Protocol)
    }

    pub(crate) fn bad_state(func: &'static str) -> Error {
        Error::with_kind(Some(func.into()), -libc::EBADFD, ErrorKind::BadState)
    }

    pub(crate) fn io(func: &'static str) -> Error {
        Error::with_kind(Some(func.into()), -libc::EBADFD, ErrorKind::Io)
    }

    /// Wraps `errno` as left behind by the syscall that just failed.
    pub(crate) fn sys(func: &'static str) -> Error {
        let e = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Error::with_kind(Some(func.into()), -e, ErrorKind::System)
    }

    pub(crate) fn sys_io(func: &'static str, e: io::Error) -> Error {
        let code = e.raw_os_error().unwrap_or(libc::EIO);
        Error::new(Some(func.into()), -code)
    }

    /// The wrapped return code (negative errno convention).
    pub fn code(&self) -> c_int { self.1 }

    /// The positive errno equivalent of [`code`](Error::code).
    pub fn errno(&self) -> c_int { -self.1 }

    pub fn kind(&self) -> ErrorKind { self.2 }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc = io::Error::from_raw_os_error(self.errno());
        match &self.0 {
            Some(s) => write!(f, "PCM shm error: '{}' (code {}) from '{}'", desc, self.1, s),
            None => write!(f, "PCM shm error: '{}' (code {})", desc, self.1),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::from_raw_os_error(e.errno())
    }
}

#[test]
fn kinds_follow_errno() {
    assert_eq!(Error::new(None, -libc::EINVAL).kind(), ErrorKind::InvalidArgument);
    assert_eq!(Error::new(None, -libc::ENOMEM).kind(), ErrorKind::ResourceExhausted);
    assert_eq!(Error::new(None, -libc::ECONNREFUSED).kind(), ErrorKind::NotConnected);
    assert_eq!(Error::new(None, -libc::EIO).kind(), ErrorKind::Io);
    assert_eq!(Error::new(None, -libc::EPERM).kind(), ErrorKind::System);
}

#[test]
fn code_survives_roundtrip() {
    let e = from_code("status", -libc::EPIPE).err().unwrap();
    assert_eq!(e.code(), -libc::EPIPE);
    assert_eq!(e.errno(), libc::EPIPE);
    let s = format!("{}", e);
    assert!(s.contains("status"));
}
