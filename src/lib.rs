//! Client for shared-memory PCM streams.
//!
//! A [`Stream`](pcm::Stream) looks like an ordinary mmap-capable PCM device,
//! but the "hardware" lives in another process: an audio server reached over
//! a local stream socket. The server and the client share a small control
//! block (a SysV shared-memory segment) carrying the RPC arguments, results
//! and the two ring cursors; the audio ring itself arrives as file
//! descriptors or shm ids that the client maps into its own address space.
//!
//! The socket never carries audio. Each RPC is a one-byte doorbell write
//! followed by a one-byte doorbell read; everything of substance travels
//! through the control block. See the [`shm`] module for the wire details,
//! and [`mmap`] for the ring arithmetic and data movement.

macro_rules! stream_enum {
 ($(#[$attr:meta])+ $name:ident, $static_name:ident [$count:expr], $( $a:ident = $b:expr),* ,) =>
{
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
$(#[$attr])*
pub enum $name {
$(
    $a = $b,
)*
}

static $static_name: [$name; $count] =
  [ $( $name::$a, )* ];

impl $name {
    /// Returns a slice of all possible values; useful for iteration
    pub fn all() -> &'static [$name] { &$static_name[..] }

    pub(crate) fn from_c_int(c: ::libc::c_int, s: &'static str) -> Result<$name> {
        Self::all().iter().find(|&&x| c == x as ::libc::c_int).map(|&x| x)
            .ok_or_else(|| crate::error::bad_enum(s, c))
    }
}

}
}

/// Stream direction, from the client's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
    Playback,
    Capture
}
impl Direction {
    #[inline]
    pub fn input() -> Direction { Direction::Capture }
    #[inline]
    pub fn output() -> Direction { Direction::Playback }
}

mod error;
pub use crate::error::{Error, ErrorKind, Result};

pub mod pcm;
pub use crate::pcm::Stream as Stream;
pub use crate::pcm::{Access, Format, Frames, State, UFrames};

pub mod mmap;

pub mod shm;

pub mod ops;

pub mod config;
pub use crate::config::{ServerConfig, ShmConfig};

pub mod poll;
pub use crate::poll::PollFlags as PollFlags;
