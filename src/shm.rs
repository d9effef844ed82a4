//! The shm transport: control block layout, doorbell RPC and the server
//! handshake.
//!
//! The wire protocol is deliberately thin. After the handshake, the socket
//! only ever carries single doorbell bytes (plus the occasional SCM_RIGHTS
//! descriptor riding along with a response byte); command code, arguments
//! and results all live in the shared control block. The doorbell pair is
//! what orders the two sides: the client finishes writing `u` and `cmd`
//! before its doorbell write, the server finishes writing `u`, `result` and
//! clearing `cmd` before its own.
//!
//! The layout types are public so that a matching server can be written
//! against them; the in-process mock used by this crate's integration tests
//! is one such server.

use crate::error::*;
use crate::mmap::{ChannelInfo, RegionDesc};
use crate::ops::{FastOps, SlowOps};
use crate::pcm::{Frames, HwConfig, State, StatusData, StreamInfo, SwConfig, UFrames};
use crate::Direction;
use libc::{c_int, c_uint, c_void, off_t, pid_t};
use log::{debug, error};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::{fmt, mem, ptr};

/// Device type field of the open request.
pub const DEV_TYPE_PCM: c_int = 1;
/// Transport type field of the open request.
pub const TRANSPORT_SHM: c_int = 1;
/// Longest stream name the handshake can carry.
pub const MAX_NAME_LEN: usize = 255;

pub fn stream_code(dir: Direction) -> c_int {
    match dir { Direction::Playback => 0, Direction::Capture => 1 }
}

pub fn direction_from_code(code: c_int) -> Result<Direction> {
    match code {
        0 => Ok(Direction::Playback),
        1 => Ok(Direction::Capture),
        _ => Err(Error::protocol("open request: bad stream code")),
    }
}

/// Command codes written into the control block. Zero is reserved: it means
/// "no command pending", and the server stores it back into `cmd` when it
/// has completed one.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cmd {
    Info = 1,
    HwRefine = 2,
    HwParams = 3,
    HwFree = 4,
    SwParams = 5,
    ChannelInfo = 6,
    Status = 7,
    State = 8,
    Delay = 9,
    AvailUpdate = 10,
    Prepare = 11,
    Reset = 12,
    Start = 13,
    Drop = 14,
    Drain = 15,
    Pause = 16,
    Rewind = 17,
    MmapForward = 18,
    Async = 19,
    PollDescriptor = 20,
    Close = 21,
}

/// `u.channel_info`: region kind is file-backed, mapped from a descriptor
/// arriving as ancillary data.
pub const AREA_FILE: c_int = 0;
/// `u.channel_info`: region kind is a SysV segment named by `shmid`.
pub const AREA_SHM: c_int = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct ChannelInfoData {
    pub channel: c_uint,
    pub kind: c_int,
    pub offset: off_t,
    pub shmid: c_int,
    pub first: c_uint,
    pub step: c_uint,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DelayData {
    pub frames: Frames,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PauseData {
    pub enable: c_int,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct RewindData {
    pub frames: UFrames,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct MmapForwardData {
    pub frames: UFrames,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct AsyncData {
    pub sig: c_int,
    pub pid: pid_t,
}

/// Per-command payload, overlaid in the control block.
#[repr(C)]
#[derive(Copy, Clone)]
pub union CtrlPayload {
    pub info: StreamInfo,
    pub hw_refine: HwConfig,
    pub hw_params: HwConfig,
    pub sw_params: SwConfig,
    pub channel_info: ChannelInfoData,
    pub status: StatusData,
    pub delay: DelayData,
    pub pause: PauseData,
    pub rewind: RewindData,
    pub mmap_forward: MmapForwardData,
    pub async_req: AsyncData,
}

impl fmt::Debug for CtrlPayload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "CtrlPayload(..)") }
}

/// The control block shared between client and server, one per stream.
///
/// The handshake cookie names the SysV segment this lives in. The two
/// cursor words are mutated by both sides without further synchronization
/// and must only ever be touched with volatile single-word accesses.
#[repr(C)]
#[derive(Debug)]
pub struct SharedCtrl {
    pub result: c_int,
    pub cmd: c_int,
    pub hw_ptr: UFrames,
    pub appl_ptr: UFrames,
    pub u: CtrlPayload,
}

/// Fixed-size prefix of the open request; `namelen` bytes of stream name
/// follow it on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub dev_type: c_int,
    pub transport: c_int,
    pub stream: c_int,
    pub mode: c_int,
    pub namelen: u8,
}

impl OpenRequest {
    pub fn encode(&self, name: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(17 + name.len());
        v.extend_from_slice(&self.dev_type.to_ne_bytes());
        v.extend_from_slice(&self.transport.to_ne_bytes());
        v.extend_from_slice(&self.stream.to_ne_bytes());
        v.extend_from_slice(&self.mode.to_ne_bytes());
        v.push(self.namelen);
        v.extend_from_slice(name);
        v
    }

    /// Server-side decode: reads the fixed prefix, then the name bytes.
    pub fn read_from(r: &mut dyn Read) -> io::Result<(OpenRequest, Vec<u8>)> {
        let mut hdr = [0u8; 17];
        r.read_exact(&mut hdr)?;
        let g = |i: usize| c_int::from_ne_bytes(hdr[i..i + 4].try_into().unwrap());
        let req = OpenRequest {
            dev_type: g(0),
            transport: g(4),
            stream: g(8),
            mode: g(12),
            namelen: hdr[16],
        };
        let mut name = vec![0u8; req.namelen as usize];
        r.read_exact(&mut name)?;
        Ok((req, name))
    }
}

/// Handshake reply: the server's verdict plus the cookie naming the control
/// segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpenAnswer {
    pub result: c_int,
    pub cookie: c_int,
}

impl OpenAnswer {
    pub fn encode(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[..4].copy_from_slice(&self.result.to_ne_bytes());
        b[4..].copy_from_slice(&self.cookie.to_ne_bytes());
        b
    }

    pub fn decode(b: [u8; 8]) -> OpenAnswer {
        OpenAnswer {
            result: c_int::from_ne_bytes(b[..4].try_into().unwrap()),
            cookie: c_int::from_ne_bytes(b[4..].try_into().unwrap()),
        }
    }
}

/// Sends `buf` with one descriptor attached as SCM_RIGHTS.
pub fn send_with_fd(sock: &UnixStream, buf: &[u8], fd: RawFd) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    unsafe {
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;
        let c = libc::CMSG_FIRSTHDR(&msg);
        (*c).cmsg_level = libc::SOL_SOCKET;
        (*c).cmsg_type = libc::SCM_RIGHTS;
        (*c).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(c) as *mut RawFd, fd);
        let n = libc::sendmsg(sock.as_raw_fd(), &msg, 0);
        if n < 0 { Err(Error::sys("sendmsg")) } else { Ok(n as usize) }
    }
}

/// Receives into `buf`, extracting at most one descriptor passed as
/// SCM_RIGHTS alongside.
pub fn recv_with_fd(sock: &UnixStream, buf: &mut [u8]) -> Result<(usize, Option<RawFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;
    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n < 0 { return Err(Error::sys("recvmsg")); }
    let mut fd = None;
    unsafe {
        let mut c = libc::CMSG_FIRSTHDR(&msg);
        while !c.is_null() {
            if (*c).cmsg_level == libc::SOL_SOCKET && (*c).cmsg_type == libc::SCM_RIGHTS {
                fd = Some(ptr::read_unaligned(libc::CMSG_DATA(c) as *const RawFd));
            }
            c = libc::CMSG_NXTHDR(&msg, c);
        }
    }
    Ok((n as usize, fd))
}

/// The attached control segment. Detached exactly once, when dropped.
pub(crate) struct CtrlMap {
    ptr: *mut SharedCtrl,
}

impl CtrlMap {
    pub fn attach(cookie: c_int) -> Result<CtrlMap> {
        let p = unsafe { libc::shmat(cookie, ptr::null(), 0) };
        if p == -1isize as *mut c_void { return Err(Error::sys("shmat")); }
        Ok(CtrlMap { ptr: p as *mut SharedCtrl })
    }

    pub fn cmd(&self) -> c_int {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).cmd)) }
    }

    pub fn set_cmd(&self, cmd: Cmd) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).cmd), cmd as c_int) }
    }

    pub fn result(&self) -> c_int {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).result)) }
    }

    pub fn hw_word(&self) -> *mut UFrames {
        unsafe { ptr::addr_of_mut!((*self.ptr).hw_ptr) }
    }

    pub fn appl_word(&self) -> *mut UFrames {
        unsafe { ptr::addr_of_mut!((*self.ptr).appl_ptr) }
    }

    pub fn read_info(&self) -> StreamInfo {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.info)) }
    }

    pub fn write_hw_refine(&self, v: &HwConfig) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.hw_refine), *v) }
    }

    pub fn read_hw_refine(&self) -> HwConfig {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.hw_refine)) }
    }

    pub fn write_hw_params(&self, v: &HwConfig) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.hw_params), *v) }
    }

    pub fn read_hw_params(&self) -> HwConfig {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.hw_params)) }
    }

    pub fn write_sw_params(&self, v: &SwConfig) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.sw_params), *v) }
    }

    pub fn read_sw_params(&self) -> SwConfig {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.sw_params)) }
    }

    pub fn write_channel_info(&self, v: &ChannelInfoData) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.channel_info), *v) }
    }

    pub fn read_channel_info(&self) -> ChannelInfoData {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.channel_info)) }
    }

    pub fn read_status(&self) -> StatusData {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.status)) }
    }

    pub fn read_delay(&self) -> DelayData {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.ptr).u.delay)) }
    }

    pub fn write_pause(&self, v: &PauseData) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.pause), *v) }
    }

    pub fn write_rewind(&self, v: &RewindData) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.rewind), *v) }
    }

    pub fn write_mmap_forward(&self, v: &MmapForwardData) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.mmap_forward), *v) }
    }

    pub fn write_async(&self, v: &AsyncData) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.ptr).u.async_req), *v) }
    }
}

impl fmt::Debug for CtrlMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "CtrlMap({:?})", self.ptr) }
}

impl Drop for CtrlMap {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.ptr as *const c_void) };
    }
}

fn doorbell_write(sock: &UnixStream) -> Result<()> {
    match (&*sock).write(&[0u8]) {
        Ok(1) => Ok(()),
        _ => Err(Error::io("rpc doorbell write")),
    }
}

fn doorbell_read(sock: &UnixStream) -> Result<()> {
    let mut b = [0u8; 1];
    match (&*sock).read(&mut b) {
        Ok(1) => Ok(()),
        _ => Err(Error::io("rpc doorbell read")),
    }
}

// ctrl before sock: the control block detaches before the socket closes.
#[derive(Debug)]
struct ShmLink {
    ctrl: CtrlMap,
    sock: UnixStream,
}

impl ShmLink {
    /// One synchronous RPC round trip. The payload for `cmd` must already
    /// sit in the control block.
    fn call(&self, cmd: Cmd) -> Result<c_int> {
        self.ctrl.set_cmd(cmd);
        doorbell_write(&self.sock)?;
        doorbell_read(&self.sock)?;
        if self.ctrl.cmd() != 0 {
            error!("Server has not done the cmd");
            return Err(Error::protocol("rpc"));
        }
        Ok(self.ctrl.result())
    }

    /// Like [`ShmLink::call`], but the response byte may carry one
    /// descriptor as ancillary data.
    fn call_fd(&self, cmd: Cmd) -> Result<(c_int, Option<RawFd>)> {
        self.ctrl.set_cmd(cmd);
        doorbell_write(&self.sock)?;
        let mut b = [0u8; 1];
        let (n, fd) = recv_with_fd(&self.sock, &mut b)?;
        if n != 1 {
            return Err(Error::io("rpc doorbell read"));
        }
        if self.ctrl.cmd() != 0 {
            error!("Server has not done the cmd");
            return Err(Error::protocol("rpc"));
        }
        Ok((self.ctrl.result(), fd))
    }
}

/// Client side of the shm transport. Cheap to clone; all clones share the
/// socket and the attached control block, which are torn down when the last
/// clone drops.
#[derive(Debug, Clone)]
pub struct ShmTransport(Rc<ShmLink>);

impl ShmTransport {
    /// Connects to the server and performs the open handshake.
    pub fn connect(socket: &Path, sname: &str, dir: Direction, nonblock: bool)
                   -> Result<ShmTransport> {
        if sname.len() > MAX_NAME_LEN {
            return Err(Error::invalid_argument("open: stream name too long"));
        }
        let sock = match UnixStream::connect(socket) {
            Ok(s) => s,
            Err(e) => {
                return Err(match e.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                        error!("server for socket {} is not running", socket.display());
                        Error::not_connected("open: server is not running")
                    }
                    _ => Error::sys_io("open: connect", e),
                });
            }
        };
        let req = OpenRequest {
            dev_type: DEV_TYPE_PCM,
            transport: TRANSPORT_SHM,
            stream: stream_code(dir),
            mode: nonblock as c_int,
            namelen: sname.len() as u8,
        };
        (&sock).write_all(&req.encode(sname.as_bytes()))
            .map_err(|e| Error::sys_io("open: request write", e))?;
        let mut ans = [0u8; 8];
        (&sock).read_exact(&mut ans).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::invalid_argument("open: answer size"),
            _ => Error::sys_io("open: answer read", e),
        })?;
        let ans = OpenAnswer::decode(ans);
        from_code("open", ans.result)?;
        let ctrl = CtrlMap::attach(ans.cookie)?;
        debug!("stream '{}' ({:?}) attached via cookie {}", sname, dir, ans.cookie);
        Ok(ShmTransport(Rc::new(ShmLink { ctrl, sock })))
    }

    pub(crate) fn hw_word(&self) -> *mut UFrames { self.0.ctrl.hw_word() }
    pub(crate) fn appl_word(&self) -> *mut UFrames { self.0.ctrl.appl_word() }
}

impl SlowOps for ShmTransport {
    fn close(&self) -> Result<()> {
        from_code("close", self.0.call(Cmd::Close)?).map(|_| ())
    }

    fn info(&self) -> Result<StreamInfo> {
        from_code("info", self.0.call(Cmd::Info)?)?;
        Ok(self.0.ctrl.read_info())
    }

    fn hw_refine(&self, params: &mut HwConfig) -> Result<()> {
        self.0.ctrl.write_hw_refine(params);
        let r = self.0.call(Cmd::HwRefine)?;
        // the server's narrowing comes back even when it rejects
        *params = self.0.ctrl.read_hw_refine();
        from_code("hw_refine", r).map(|_| ())
    }

    fn hw_params(&self, params: &mut HwConfig) -> Result<()> {
        self.0.ctrl.write_hw_params(params);
        let r = self.0.call(Cmd::HwParams)?;
        *params = self.0.ctrl.read_hw_params();
        from_code("hw_params", r).map(|_| ())
    }

    fn hw_free(&self) -> Result<()> {
        from_code("hw_free", self.0.call(Cmd::HwFree)?).map(|_| ())
    }

    fn sw_params(&self, params: &mut SwConfig) -> Result<()> {
        self.0.ctrl.write_sw_params(params);
        let r = self.0.call(Cmd::SwParams)?;
        *params = self.0.ctrl.read_sw_params();
        from_code("sw_params", r).map(|_| ())
    }

    fn channel_info(&self, channel: c_uint) -> Result<ChannelInfo> {
        self.0.ctrl.write_channel_info(&ChannelInfoData {
            channel,
            kind: AREA_SHM,
            offset: 0,
            shmid: -1,
            first: 0,
            step: 0,
        });
        let (r, fd) = self.0.call_fd(Cmd::ChannelInfo)?;
        from_code("channel_info", r)?;
        let data = self.0.ctrl.read_channel_info();
        let desc = match data.kind {
            AREA_FILE => {
                let fd = fd.ok_or_else(|| Error::io("channel_info: missing descriptor"))?;
                RegionDesc::File { fd, offset: data.offset }
            }
            AREA_SHM => {
                // a descriptor has no meaning for a shm region
                if let Some(fd) = fd { unsafe { libc::close(fd) }; }
                RegionDesc::Shm { shmid: data.shmid }
            }
            _ => return Err(Error::protocol("channel_info: bad area kind")),
        };
        Ok(ChannelInfo { channel: data.channel, first: data.first, step: data.step, desc })
    }

    fn set_async(&self, sig: c_int, pid: pid_t) -> Result<()> {
        let pid = if pid == 0 { unsafe { libc::getpid() } } else { pid };
        self.0.ctrl.write_async(&AsyncData { sig, pid });
        from_code("set_async", self.0.call(Cmd::Async)?).map(|_| ())
    }

    fn transport_nonblock(&self, _nonblock: bool) -> Result<()> {
        // the doorbell protocol is blocking by construction; the stream's
        // nonblocking flag only changes the drain behavior
        Ok(())
    }

    fn transport_mmap(&self) -> Result<()> {
        // the regions arrive with channel_info; nothing to set up here
        Ok(())
    }

    fn transport_munmap(&self, region_fds: &[RawFd]) -> Result<()> {
        // the descriptors came over the socket with channel_info; once the
        // regions are gone they are ours to close
        for &fd in region_fds {
            if unsafe { libc::close(fd) } < 0 {
                return Err(Error::sys("close"));
            }
        }
        Ok(())
    }
}

impl FastOps for ShmTransport {
    fn status(&self) -> Result<StatusData> {
        from_code("status", self.0.call(Cmd::Status)?)?;
        Ok(self.0.ctrl.read_status())
    }

    fn state(&self) -> Result<State> {
        let r = from_code("state", self.0.call(Cmd::State)?)?;
        State::from_c_int(r, "state")
    }

    fn delay(&self) -> Result<Frames> {
        from_code("delay", self.0.call(Cmd::Delay)?)?;
        Ok(self.0.ctrl.read_delay().frames)
    }

    fn prepare(&self) -> Result<()> {
        from_code("prepare", self.0.call(Cmd::Prepare)?).map(|_| ())
    }

    fn reset(&self) -> Result<()> {
        from_code("reset", self.0.call(Cmd::Reset)?).map(|_| ())
    }

    fn start(&self) -> Result<()> {
        from_code("start", self.0.call(Cmd::Start)?).map(|_| ())
    }

    fn drop(&self) -> Result<()> {
        from_code("drop", self.0.call(Cmd::Drop)?).map(|_| ())
    }

    fn drain(&self) -> Result<()> {
        from_code("drain", self.0.call(Cmd::Drain)?).map(|_| ())
    }

    fn pause(&self, pause: bool) -> Result<()> {
        self.0.ctrl.write_pause(&PauseData { enable: pause as c_int });
        from_code("pause", self.0.call(Cmd::Pause)?).map(|_| ())
    }

    fn rewind(&self, frames: UFrames) -> Result<Frames> {
        self.0.ctrl.write_rewind(&RewindData { frames });
        from_code("rewind", self.0.call(Cmd::Rewind)?).map(|r| r as Frames)
    }

    fn avail_update(&self) -> Result<Frames> {
        from_code("avail_update", self.0.call(Cmd::AvailUpdate)?).map(|r| r as Frames)
    }

    fn mmap_forward(&self, frames: UFrames) -> Result<Frames> {
        self.0.ctrl.write_mmap_forward(&MmapForwardData { frames });
        from_code("mmap_forward", self.0.call(Cmd::MmapForward)?).map(|r| r as Frames)
    }

    fn poll_descriptor(&self) -> Result<RawFd> {
        let (r, fd) = self.0.call_fd(Cmd::PollDescriptor)?;
        from_code("poll_descriptor", r)?;
        fd.ok_or_else(|| Error::io("poll_descriptor: missing descriptor"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_roundtrip() {
        let req = OpenRequest {
            dev_type: DEV_TYPE_PCM,
            transport: TRANSPORT_SHM,
            stream: stream_code(Direction::Capture),
            mode: 1,
            namelen: 5,
        };
        let bytes = req.encode(b"tuner");
        assert_eq!(bytes.len(), 22);
        let (back, name) = OpenRequest::read_from(&mut &bytes[..]).unwrap();
        assert_eq!(back, req);
        assert_eq!(name, b"tuner");
        assert_eq!(direction_from_code(back.stream).unwrap(), Direction::Capture);
    }

    #[test]
    fn open_answer_roundtrip() {
        let ans = OpenAnswer { result: -13, cookie: 42 };
        assert_eq!(OpenAnswer::decode(ans.encode()), ans);
    }

    #[test]
    fn descriptor_travels_with_a_byte() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut pipe = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
        send_with_fd(&a, &[7u8], pipe[0]).unwrap();
        let mut buf = [0u8; 1];
        let (n, fd) = recv_with_fd(&b, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], 7);
        let fd = fd.unwrap();
        // the received copy is a live descriptor onto the same pipe
        assert_eq!(unsafe { libc::write(pipe[1], b"x".as_ptr() as *const c_void, 1) }, 1);
        let mut c = 0u8;
        assert_eq!(unsafe { libc::read(fd, &mut c as *mut u8 as *mut c_void, 1) }, 1);
        assert_eq!(c, b'x');
        unsafe {
            libc::close(fd);
            libc::close(pipe[0]);
            libc::close(pipe[1]);
        }
    }

    #[test]
    fn payload_fits_every_command() {
        // the union must at least hold its largest member
        assert!(mem::size_of::<CtrlPayload>() >= mem::size_of::<StreamInfo>());
        assert!(mem::size_of::<SharedCtrl>() > mem::size_of::<CtrlPayload>());
    }
}
