//! Capability traits for stream transports.
//!
//! A transport is split the way the operation tables split it: [`SlowOps`]
//! carries the setup-time operations, [`FastOps`] the streaming path. The
//! shm transport ([`ShmTransport`](crate::shm::ShmTransport)) implements
//! both; a direct-to-kernel transport or a plugin chain would be further
//! implementations of the same pair. [`Stream`](crate::pcm::Stream) holds a
//! boxed instance of each.
//!
//! The generic mmap data engine (`writei` and friends) is not part of the
//! transport: it lives on `Stream` itself and only reaches the transport
//! through [`FastOps::mmap_forward`].

use crate::error::Result;
use crate::mmap::ChannelInfo;
use crate::pcm::{Frames, HwConfig, State, StatusData, StreamInfo, SwConfig, UFrames};
use libc::{c_int, c_uint, pid_t};
use std::os::unix::io::RawFd;

/// Setup-time operations.
pub trait SlowOps {
    /// Tells the far side to tear the stream down. Local resources are the
    /// caller's business.
    fn close(&self) -> Result<()>;
    fn info(&self) -> Result<StreamInfo>;
    fn hw_refine(&self, params: &mut HwConfig) -> Result<()>;
    fn hw_params(&self, params: &mut HwConfig) -> Result<()>;
    fn hw_free(&self) -> Result<()>;
    fn sw_params(&self, params: &mut SwConfig) -> Result<()>;
    /// Describes where one channel of the ring lives.
    fn channel_info(&self, channel: c_uint) -> Result<ChannelInfo>;
    fn set_async(&self, sig: c_int, pid: pid_t) -> Result<()>;
    /// Transport-side part of switching blocking mode. May be a no-op.
    fn transport_nonblock(&self, nonblock: bool) -> Result<()>;
    /// Transport-side hook run before the ring regions are mapped.
    fn transport_mmap(&self) -> Result<()>;
    /// Transport-side hook run after the ring regions are released. Receives
    /// the unique descriptors the file-backed regions were mapped from; the
    /// transport that handed them out disposes of them.
    fn transport_munmap(&self, region_fds: &[RawFd]) -> Result<()>;
}

/// Streaming-path operations.
pub trait FastOps {
    fn status(&self) -> Result<StatusData>;
    fn state(&self) -> Result<State>;
    fn delay(&self) -> Result<Frames>;
    fn prepare(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn drop(&self) -> Result<()>;
    fn drain(&self) -> Result<()>;
    fn pause(&self, pause: bool) -> Result<()>;
    /// Returns the frames actually rewound.
    fn rewind(&self, frames: UFrames) -> Result<Frames>;
    fn avail_update(&self) -> Result<Frames>;
    /// Returns the frames actually advanced.
    fn mmap_forward(&self, frames: UFrames) -> Result<Frames>;
    /// The descriptor external event loops should poll.
    fn poll_descriptor(&self) -> Result<RawFd>;
}
