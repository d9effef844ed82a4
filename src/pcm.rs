//! Audio playback and capture over the shm transport
//!
//! [`Stream`] is the client-side stream object. It is created by
//! [`Stream::open`] (or [`Stream::open_with_config`]), negotiates hardware
//! and software parameters with the server, maps the shared ring with
//! `mmap` and then moves audio with `writei`/`readi` and friends.

use crate::error::*;
use crate::mmap::BufferMap;
use crate::ops::{FastOps, SlowOps};
use crate::poll::{self, PollFlags};
use crate::shm::ShmTransport;
use crate::Direction;
use libc::{c_int, c_uint, pid_t};
use std::path::Path;
use std::os::unix::io::RawFd;
use std::{fmt, ptr, str};

/// Signed frame count.
pub type Frames = ::libc::c_long;
/// Unsigned frame count; the type of the shared ring cursors.
pub type UFrames = ::libc::c_ulong;

stream_enum!(
    /// Stream state, as reported by the server.
    State, ALL_STATES[9],
    Open = 0,
    Setup = 1,
    Prepared = 2,
    Running = 3,
    XRun = 4,
    Draining = 5,
    Paused = 6,
    Suspended = 7,
    Disconnected = 8,
);

stream_enum!(
    /// Sample format.
    ///
    /// Only byte-aligned little-endian formats; enough for ring addressing,
    /// which is all this crate interprets. Conversion between formats is a
    /// different crate's problem.
    Format, ALL_FORMATS[5],
    U8 = 0,
    S16LE = 1,
    S32LE = 2,
    FloatLE = 3,
    Float64LE = 4,
);

impl Format {
    /// Bits occupied by one sample in memory.
    pub fn physical_bits(self) -> c_uint {
        match self {
            Format::U8 => 8,
            Format::S16LE => 16,
            Format::S32LE | Format::FloatLE => 32,
            Format::Float64LE => 64,
        }
    }
}

stream_enum!(
    /// Access layout.
    ///
    /// Data transfer goes through the two mmap variants; the RW variants only
    /// travel over the wire as negotiation hints.
    Access, ALL_ACCESSES[4],
    MMapInterleaved = 0,
    MMapNonInterleaved = 1,
    RWInterleaved = 2,
    RWNonInterleaved = 3,
);

impl Access {
    #[inline]
    pub fn is_mmap(self) -> bool {
        self == Access::MMapInterleaved || self == Access::MMapNonInterleaved
    }
    #[inline]
    pub fn is_interleaved(self) -> bool {
        self == Access::MMapInterleaved || self == Access::RWInterleaved
    }
}

/// Hardware configuration, negotiated with the server.
///
/// The transport forwards this in and out of the control block without
/// interpreting it; the refinement logic lives server-side. Raw `c_int`
/// fields keep the struct POD for the wire - use [`HwConfig::access`] and
/// [`HwConfig::format`] for the typed views.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HwConfig {
    pub access: c_int,
    pub format: c_int,
    pub channels: c_uint,
    pub rate: c_uint,
    pub buffer_size: UFrames,
    pub period_size: UFrames,
}

impl HwConfig {
    pub fn new(access: Access, format: Format, channels: u32, rate: u32,
               buffer_size: UFrames, period_size: UFrames) -> HwConfig {
        HwConfig {
            access: access as c_int,
            format: format as c_int,
            channels,
            rate,
            buffer_size,
            period_size,
        }
    }

    pub fn access(&self) -> Result<Access> { Access::from_c_int(self.access, "hw_config access") }
    pub fn format(&self) -> Result<Format> { Format::from_c_int(self.format, "hw_config format") }
}

/// Software configuration. The boundary the server returns here becomes the
/// modulus for all cursor arithmetic.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwConfig {
    pub avail_min: UFrames,
    pub start_threshold: UFrames,
    pub stop_threshold: UFrames,
    pub boundary: UFrames,
}

/// Snapshot of the server-side stream status.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct StatusData {
    pub state: c_int,
    pub hw_ptr: UFrames,
    pub appl_ptr: UFrames,
    pub delay: Frames,
    pub avail: UFrames,
    pub avail_max: UFrames,
    pub suspended_state: c_int,
}

impl StatusData {
    pub fn state(&self) -> Result<State> { State::from_c_int(self.state, "status state") }
}

/// Identity of the stream within the server.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct StreamInfo {
    pub device: c_uint,
    pub subdevice: c_uint,
    pub stream: c_int,
    pub card: c_int,
    pub id: [u8; 64],
    pub name: [u8; 80],
}

fn nul_str(b: &[u8]) -> &str {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    str::from_utf8(&b[..end]).unwrap_or("")
}

impl StreamInfo {
    pub fn id(&self) -> &str { nul_str(&self.id) }
    pub fn name(&self) -> &str { nul_str(&self.name) }
}

impl fmt::Debug for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamInfo")
            .field("device", &self.device)
            .field("subdevice", &self.subdevice)
            .field("stream", &self.stream)
            .field("card", &self.card)
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Fixed stream geometry, derived from the negotiated hardware config.
#[derive(Debug, Copy, Clone)]
pub(crate) struct SetupData {
    pub access: Access,
    pub format: Format,
    pub channels: c_uint,
    pub rate: c_uint,
    pub buffer_size: UFrames,
    pub period_size: UFrames,
    pub sample_bits: c_uint,
    pub frame_bits: c_uint,
}

/// Largest multiple of `buffer_size` that still leaves the signed frame
/// type headroom - the default cursor modulus until the server says
/// otherwise through `sw_params`.
pub(crate) fn default_boundary(buffer_size: UFrames) -> Result<UFrames> {
    if buffer_size == 0 {
        return Err(Error::invalid_argument("boundary: zero buffer size"));
    }
    let mut b = buffer_size;
    while b * 2 <= Frames::MAX as UFrames - b {
        b *= 2;
    }
    Ok(b)
}

/// A PCM stream served over the shm transport - start here.
///
/// Not `Send`: a stream is owned by the thread that opened it, matching the
/// synchronous one-request-at-a-time protocol.
pub struct Stream {
    pub(crate) name: Option<String>,
    pub(crate) direction: Direction,
    pub(crate) nonblock: bool,
    pub(crate) ops: Box<dyn SlowOps>,
    pub(crate) fast_ops: Box<dyn FastOps>,
    pub(crate) poll_fd: RawFd,
    pub(crate) hw_word: *mut UFrames,
    pub(crate) appl_word: *mut UFrames,
    pub(crate) setup: Option<SetupData>,
    pub(crate) boundary: UFrames,
    pub(crate) map: Option<BufferMap>,
    closed: bool,
}

impl Stream {
    /// Connects to the server listening on `socket`, asks it for the stream
    /// named `sname`, attaches the shared control block and fetches the poll
    /// descriptor. Fails with [`ErrorKind::NotConnected`] when nothing
    /// listens on `socket`.
    pub fn open(name: Option<&str>, socket: &Path, sname: &str, dir: Direction, nonblock: bool)
                -> Result<Stream> {
        let t = ShmTransport::connect(socket, sname, dir, nonblock)?;
        let poll_fd = match t.poll_descriptor() {
            Ok(fd) => fd,
            Err(e) => {
                let _ = SlowOps::close(&t);
                return Err(e);
            }
        };
        let (hw_word, appl_word) = (t.hw_word(), t.appl_word());
        Ok(Stream {
            name: name.map(|s| s.to_owned()),
            direction: dir,
            nonblock,
            ops: Box::new(t.clone()),
            fast_ops: Box::new(t),
            poll_fd,
            hw_word,
            appl_word,
            setup: None,
            boundary: 0,
            map: None,
            closed: false,
        })
    }

    /// Like [`Stream::open`], but starting from the configuration block the
    /// config layer parsed for us. Validates the block first; in particular
    /// the server host must resolve to a local interface.
    pub fn open_with_config(name: Option<&str>, cfg: &crate::ShmConfig, dir: Direction,
                            nonblock: bool) -> Result<Stream> {
        cfg.validate()?;
        Stream::open(name, &cfg.server.socket, &cfg.sname, dir, nonblock)
    }

    /// Tells the server to close the stream, then releases everything local:
    /// ring mappings, the control block, the socket and the poll descriptor.
    /// Local teardown happens even when the server reports an error; that
    /// error is returned.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed { return Ok(()); }
        if self.map.is_some() {
            let _ = self.munmap();
        }
        let res = SlowOps::close(&*self.ops);
        unsafe { libc::close(self.poll_fd) };
        self.closed = true;
        // control block detach and socket close follow when the ops boxes
        // drop the last transport handle
        res
    }

    pub fn name(&self) -> Option<&str> { self.name.as_deref() }
    pub fn direction(&self) -> Direction { self.direction }
    pub fn is_nonblock(&self) -> bool { self.nonblock }

    /// The descriptor the server handed over for event loops.
    pub fn poll_descriptor(&self) -> RawFd { self.poll_fd }

    /// True once hardware parameters are installed.
    pub fn is_setup(&self) -> bool { self.setup.is_some() }

    /// True while the ring is mapped.
    pub fn is_mapped(&self) -> bool { self.map.is_some() }

    pub fn buffer_size(&self) -> Result<UFrames> { self.req_setup("buffer_size").map(|s| s.buffer_size) }
    pub fn channels(&self) -> Result<u32> { self.req_setup("channels").map(|s| s.channels) }
    pub fn rate(&self) -> Result<u32> { self.req_setup("rate").map(|s| s.rate) }
    pub fn format(&self) -> Result<Format> { self.req_setup("format").map(|s| s.format) }
    pub fn access(&self) -> Result<Access> { self.req_setup("access").map(|s| s.access) }

    /// Cursor modulus. Zero until hardware parameters are installed.
    pub fn boundary(&self) -> UFrames { self.boundary }

    /// Application-side cursor, read from the shared control block.
    pub fn appl_ptr(&self) -> UFrames { unsafe { ptr::read_volatile(self.appl_word) } }

    /// Hardware-side cursor, read from the shared control block.
    pub fn hw_ptr(&self) -> UFrames { unsafe { ptr::read_volatile(self.hw_word) } }

    pub(crate) fn req_setup(&self, func: &'static str) -> Result<&SetupData> {
        self.setup.as_ref().ok_or_else(|| Error::bad_state(func))
    }

    pub fn info(&self) -> Result<StreamInfo> { self.ops.info() }

    /// Asks the server to narrow `params` towards something it can do.
    pub fn hw_refine(&self, params: &mut HwConfig) -> Result<()> { self.ops.hw_refine(params) }

    /// Installs hardware parameters. On success the returned configuration
    /// becomes the stream geometry: channel count, format, access layout and
    /// ring capacity are fixed from here until [`Stream::hw_free`].
    pub fn hw_params(&mut self, params: &mut HwConfig) -> Result<()> {
        if self.map.is_some() { return Err(Error::bad_state("hw_params: ring still mapped")); }
        self.ops.hw_params(params)?;
        let access = params.access()?;
        let format = params.format()?;
        if params.channels == 0 || params.buffer_size == 0 {
            return Err(Error::protocol("hw_params: degenerate configuration"));
        }
        let sample_bits = format.physical_bits();
        self.setup = Some(SetupData {
            access,
            format,
            channels: params.channels,
            rate: params.rate,
            buffer_size: params.buffer_size,
            period_size: params.period_size,
            sample_bits,
            frame_bits: sample_bits * params.channels,
        });
        self.boundary = default_boundary(params.buffer_size)?;
        Ok(())
    }

    /// Drops the hardware configuration server-side and forgets the local
    /// geometry. The ring must be unmapped first.
    pub fn hw_free(&mut self) -> Result<()> {
        if self.map.is_some() { return Err(Error::bad_state("hw_free: ring still mapped")); }
        self.ops.hw_free()?;
        self.setup = None;
        self.boundary = 0;
        Ok(())
    }

    /// Installs software parameters. The server decides the final values and
    /// in particular the cursor boundary, which must stay a multiple of the
    /// ring capacity.
    pub fn sw_params(&mut self, params: &mut SwConfig) -> Result<()> {
        let buffer_size = self.req_setup("sw_params")?.buffer_size;
        self.ops.sw_params(params)?;
        if params.boundary != 0 {
            if params.boundary < buffer_size || params.boundary % buffer_size != 0 {
                return Err(Error::protocol("sw_params: bad boundary"));
            }
            self.boundary = params.boundary;
        }
        Ok(())
    }

    /// Asks the server where channel `channel` of the ring lives. Normally
    /// only `mmap` needs this.
    pub fn channel_info(&self, channel: u32) -> Result<crate::mmap::ChannelInfo> {
        let setup = self.req_setup("channel_info")?;
        if channel >= setup.channels {
            return Err(Error::invalid_argument("channel_info: no such channel"));
        }
        self.ops.channel_info(channel)
    }

    pub fn set_nonblock(&mut self, nonblock: bool) -> Result<()> {
        self.ops.transport_nonblock(nonblock)?;
        self.nonblock = nonblock;
        Ok(())
    }

    /// Asks the server to signal `sig` to `pid` on period wakeups. A zero
    /// pid means the calling process.
    pub fn set_async(&self, sig: c_int, pid: pid_t) -> Result<()> {
        self.ops.set_async(sig, pid)
    }

    pub fn status(&self) -> Result<StatusData> { self.fast_ops.status() }
    pub fn state(&self) -> Result<State> { self.fast_ops.state() }
    pub fn delay(&self) -> Result<Frames> { self.fast_ops.delay() }
    pub fn prepare(&self) -> Result<()> { self.fast_ops.prepare() }
    pub fn reset(&self) -> Result<()> { self.fast_ops.reset() }
    pub fn start(&self) -> Result<()> { self.fast_ops.start() }
    pub fn drop(&self) -> Result<()> { FastOps::drop(&*self.fast_ops) }
    pub fn pause(&self, pause: bool) -> Result<()> { self.fast_ops.pause(pause) }

    /// Moves the application cursor backwards. Returns the frames actually
    /// rewound, which may be fewer than asked for.
    pub fn rewind(&self, frames: UFrames) -> Result<Frames> { self.fast_ops.rewind(frames) }

    /// Forces a server-side cursor refresh; returns the available frames.
    pub fn avail_update(&self) -> Result<Frames> { self.fast_ops.avail_update() }

    /// Advances the application cursor by up to `frames`. Returns the frames
    /// actually advanced.
    pub fn mmap_forward(&self, frames: UFrames) -> Result<Frames> {
        self.fast_ops.mmap_forward(frames)
    }

    /// Tells the server to play out everything queued. In blocking mode this
    /// then waits on the poll descriptor until the stream drains.
    pub fn drain(&self) -> Result<()> {
        self.fast_ops.drain()?;
        if !self.nonblock {
            self.wait(None)?;
        }
        Ok(())
    }

    /// Waits on the poll descriptor for direction-appropriate readiness.
    /// `None` waits forever. Returns true if the descriptor became ready.
    pub fn wait(&self, timeout_ms: Option<u32>) -> Result<bool> {
        let revents = poll::wait(self.poll_fd, self.poll_events(), timeout_ms)?;
        Ok(!revents.is_empty())
    }

    /// The events an external loop should poll
    /// [`Stream::poll_descriptor`] for.
    pub fn poll_events(&self) -> PollFlags {
        PollFlags::for_direction(self.direction)
    }

    /// One-line description of the stream and its setup.
    pub fn dump(&self) -> String {
        let mut s = String::from("Shm PCM\n");
        if let Some(ref d) = self.setup {
            s.push_str(&format!(
                "  stream: {:?}\n  access: {:?}\n  format: {:?}\n  channels: {}\n  rate: {}\n  buffer_size: {}\n  period_size: {}\n  boundary: {}\n",
                self.direction, d.access, d.format, d.channels, d.rate, d.buffer_size,
                d.period_size, self.boundary));
        }
        s
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("nonblock", &self.nonblock)
            .field("setup", &self.setup)
            .field("boundary", &self.boundary)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_a_buffer_size_multiple() {
        for bs in [1, 3, 8, 977, 1024, 65536] {
            let b = default_boundary(bs).unwrap();
            assert!(b >= bs);
            assert_eq!(b % bs, 0);
            // doubling once more would overflow the signed frame type
            assert!(b * 2 > Frames::MAX as UFrames - b);
        }
        assert!(default_boundary(0).is_err());
    }

    #[test]
    fn format_bits() {
        assert_eq!(Format::U8.physical_bits(), 8);
        assert_eq!(Format::S16LE.physical_bits(), 16);
        assert_eq!(Format::S32LE.physical_bits(), 32);
        assert_eq!(Format::FloatLE.physical_bits(), 32);
        assert_eq!(Format::Float64LE.physical_bits(), 64);
    }

    #[test]
    fn enums_decode_from_wire_values() {
        assert_eq!(State::from_c_int(3, "t").unwrap(), State::Running);
        assert!(State::from_c_int(99, "t").is_err());
        assert_eq!(Access::from_c_int(1, "t").unwrap(), Access::MMapNonInterleaved);
        assert!(Access::MMapNonInterleaved.is_mmap());
        assert!(!Access::MMapNonInterleaved.is_interleaved());
        assert!(Access::RWInterleaved.is_interleaved());
        assert!(!Access::RWInterleaved.is_mmap());
    }

    #[test]
    fn stream_info_strings_stop_at_nul() {
        let mut id = [0u8; 64];
        id[..4].copy_from_slice(b"card");
        let info = StreamInfo {
            device: 0, subdevice: 0, stream: 0, card: 1,
            id, name: [0u8; 80],
        };
        assert_eq!(info.id(), "card");
        assert_eq!(info.name(), "");
    }
}
