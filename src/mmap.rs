//! Ring arithmetic, channel areas and the mmap data engine.
//!
//! Everything here works on the ring the server shares with us: the two
//! frame cursors living in the control block, the per-channel area
//! descriptors addressing samples inside mapped regions, and the copy loops
//! moving audio between caller buffers and the ring.

use crate::error::*;
use crate::pcm::{Format, Frames, SetupData, Stream, UFrames};
use crate::Direction;
use libc::{c_int, c_uint, off_t, c_void};
use log::warn;
use std::os::unix::io::RawFd;
use std::ptr;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn page_align(bytes: usize) -> usize {
    let ps = page_size();
    (bytes + ps - 1) / ps * ps
}

/// The application and hardware frame cursors, shared with the server.
///
/// Both words live inside the control block and are written by the other
/// process at any time, so every access is a volatile single-word load or
/// store, and each computation snapshots the cursors it needs exactly once.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RingCursors {
    appl: *mut UFrames,
    hw: *mut UFrames,
    pub buffer_size: UFrames,
    pub boundary: UFrames,
}

impl RingCursors {
    pub fn new(appl: *mut UFrames, hw: *mut UFrames, buffer_size: UFrames, boundary: UFrames)
               -> RingCursors {
        RingCursors { appl, hw, buffer_size, boundary }
    }

    #[inline]
    pub fn appl(&self) -> UFrames { unsafe { ptr::read_volatile(self.appl) } }
    #[inline]
    pub fn hw(&self) -> UFrames { unsafe { ptr::read_volatile(self.hw) } }
    #[inline]
    pub fn set_appl(&self, v: UFrames) { unsafe { ptr::write_volatile(self.appl, v) } }
    #[inline]
    pub fn set_hw(&self, v: UFrames) { unsafe { ptr::write_volatile(self.hw, v) } }

    /// Physical ring offset of the application cursor.
    pub fn offset(&self) -> UFrames { self.appl() % self.buffer_size }

    /// Physical ring offset of the hardware cursor.
    pub fn hw_offset(&self) -> UFrames { self.hw() % self.buffer_size }

    pub fn appl_forward(&self, frames: UFrames) {
        debug_assert!(frames <= self.buffer_size);
        let mut p = self.appl() + frames;
        if p >= self.boundary { p -= self.boundary; }
        self.set_appl(p);
    }

    pub fn appl_backward(&self, frames: UFrames) {
        debug_assert!(frames <= self.buffer_size);
        let mut p = self.appl() as Frames - frames as Frames;
        if p < 0 { p += self.boundary as Frames; }
        self.set_appl(p as UFrames);
    }

    // The hardware cursor is normally the server's to move; these exist for
    // the same reason the appl variants do, and for tests standing in for
    // the server.
    #[allow(dead_code)]
    pub fn hw_forward(&self, frames: UFrames) {
        debug_assert!(frames <= self.buffer_size);
        let mut p = self.hw() + frames;
        if p >= self.boundary { p -= self.boundary; }
        self.set_hw(p);
    }

    #[allow(dead_code)]
    pub fn hw_backward(&self, frames: UFrames) {
        debug_assert!(frames <= self.buffer_size);
        let mut p = self.hw() as Frames - frames as Frames;
        if p < 0 { p += self.boundary as Frames; }
        self.set_hw(p as UFrames);
    }

    /// Frames the application may still write. Equal cursors mean an empty
    /// ring, i.e. the whole buffer is free.
    pub fn playback_avail(&self) -> UFrames {
        let (appl, hw) = (self.appl(), self.hw());
        let mut used = appl as Frames - hw as Frames;
        if used < 0 { used += self.boundary as Frames; }
        let used = used as UFrames;
        if used > self.buffer_size { 0 } else { self.buffer_size - used }
    }

    /// Frames the application may still read. Equal cursors mean nothing
    /// captured yet.
    pub fn capture_avail(&self) -> UFrames {
        let (appl, hw) = (self.appl(), self.hw());
        let mut ready = hw as Frames - appl as Frames;
        if ready < 0 { ready += self.boundary as Frames; }
        (ready as UFrames).min(self.buffer_size)
    }

    pub fn avail(&self, dir: Direction) -> UFrames {
        match dir {
            Direction::Playback => self.playback_avail(),
            Direction::Capture => self.capture_avail(),
        }
    }

    /// How much of `frames` can move in one contiguous copy: capped by
    /// availability and by the distance to the ring wrap.
    pub fn xfer(&self, dir: Direction, frames: UFrames) -> UFrames {
        let f = frames.min(self.avail(dir));
        let cont = self.buffer_size - self.offset();
        f.min(cont)
    }
}

/// Where one channel's samples live inside a mapped region.
///
/// The sample for frame `f` starts `first + step * f` bits past `addr`
/// (`f` already reduced modulo the ring capacity).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelArea {
    pub addr: *mut u8,
    /// Offset to the first sample, in bits.
    pub first: c_uint,
    /// Distance between consecutive frames' samples, in bits.
    pub step: c_uint,
}

impl ChannelArea {
    /// Byte pointer and residual bit offset of the sample at `frame`.
    /// The residue is zero for every format this crate carries.
    pub fn addr_of(&self, frame: UFrames) -> (*mut u8, u32) {
        let bits = self.first as u64 + self.step as u64 * frame;
        (unsafe { self.addr.add((bits / 8) as usize) }, (bits % 8) as u32)
    }
}

/// Synthesizes an interleaved area table over one contiguous buffer.
pub(crate) fn areas_from_buf(setup: &SetupData, buf: *mut u8) -> Vec<ChannelArea> {
    (0..setup.channels)
        .map(|c| ChannelArea { addr: buf, first: c * setup.sample_bits, step: setup.frame_bits })
        .collect()
}

/// Synthesizes a non-interleaved area table, one buffer per channel.
pub(crate) fn areas_from_bufs(setup: &SetupData, bufs: &[*mut u8]) -> Vec<ChannelArea> {
    bufs.iter()
        .map(|&b| ChannelArea { addr: b, first: 0, step: setup.sample_bits })
        .collect()
}

/// Checks a per-channel buffer set against the stream geometry and collects
/// the base pointers.
fn channel_ptrs(setup: &SetupData, bufs: impl Iterator<Item = (*mut u8, usize)>,
                count: usize, frames: UFrames, func: &'static str) -> Result<Vec<*mut u8>> {
    if count != setup.channels as usize {
        return Err(Error::invalid_argument(func));
    }
    let need = frames as usize * (setup.sample_bits / 8) as usize;
    let mut ptrs = Vec::with_capacity(count);
    for (p, len) in bufs {
        if len < need { return Err(Error::invalid_argument(func)); }
        ptrs.push(p);
    }
    Ok(ptrs)
}

/// Copies `frames` frames between two area tables.
///
/// The formats this crate carries are all byte aligned, so this reduces to a
/// strided byte copy per channel, with a single `memcpy` when both sides are
/// packed. Source and destination must not overlap.
pub fn copy_areas(dst: &[ChannelArea], dst_offset: UFrames,
                  src: &[ChannelArea], src_offset: UFrames,
                  channels: c_uint, frames: UFrames, format: Format) -> Result<()> {
    if dst.len() < channels as usize || src.len() < channels as usize {
        return Err(Error::invalid_argument("copy_areas: short area table"));
    }
    let bytes = (format.physical_bits() / 8) as usize;
    for c in 0..channels as usize {
        let (d, s) = (&dst[c], &src[c]);
        if d.first % 8 != 0 || d.step % 8 != 0 || s.first % 8 != 0 || s.step % 8 != 0 {
            return Err(Error::invalid_argument("copy_areas: unaligned area"));
        }
        let dstep = (d.step / 8) as usize;
        let sstep = (s.step / 8) as usize;
        let (mut dp, _) = d.addr_of(dst_offset);
        let (mut sp, _) = s.addr_of(src_offset);
        unsafe {
            if dstep == bytes && sstep == bytes {
                ptr::copy_nonoverlapping(sp, dp, bytes * frames as usize);
            } else {
                for _ in 0..frames {
                    ptr::copy_nonoverlapping(sp, dp, bytes);
                    dp = dp.add(dstep);
                    sp = sp.add(sstep);
                }
            }
        }
    }
    Ok(())
}

/// How the server describes one channel's memory region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionDesc {
    /// Mapped from a descriptor the server passed over the socket.
    File { fd: RawFd, offset: off_t },
    /// SysV segment. A negative id means the client allocates a private
    /// segment of the needed size itself.
    Shm { shmid: c_int },
}

/// Per-channel region description, as returned by `channel_info`.
#[derive(Debug, Copy, Clone)]
pub struct ChannelInfo {
    pub channel: c_uint,
    /// Offset to the first sample, in bits.
    pub first: c_uint,
    /// Distance between consecutive frames' samples, in bits.
    pub step: c_uint,
    pub desc: RegionDesc,
}

/// The syscall surface the mapper runs on. Split out so tests can count the
/// kernel interaction per unique region.
pub(crate) trait SysMem {
    fn map_file(&mut self, fd: RawFd, offset: off_t, len: usize) -> Result<*mut u8>;
    fn unmap(&mut self, addr: *mut u8, len: usize) -> Result<()>;
    fn shm_alloc(&mut self, len: usize) -> Result<c_int>;
    fn shm_attach(&mut self, shmid: c_int) -> Result<*mut u8>;
    fn shm_detach(&mut self, addr: *mut u8) -> Result<()>;
}

pub(crate) struct OsMem;

impl SysMem for OsMem {
    fn map_file(&mut self, fd: RawFd, offset: off_t, len: usize) -> Result<*mut u8> {
        let p = unsafe {
            libc::mmap(ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE,
                       libc::MAP_FILE | libc::MAP_SHARED, fd, offset)
        };
        if p == libc::MAP_FAILED { return Err(Error::sys("mmap")); }
        Ok(p as *mut u8)
    }

    fn unmap(&mut self, addr: *mut u8, len: usize) -> Result<()> {
        if unsafe { libc::munmap(addr as *mut c_void, len) } < 0 { Err(Error::sys("munmap")) }
        else { Ok(()) }
    }

    fn shm_alloc(&mut self, len: usize) -> Result<c_int> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, 0o666) };
        if id < 0 { Err(Error::sys("shmget")) } else { Ok(id) }
    }

    fn shm_attach(&mut self, shmid: c_int) -> Result<*mut u8> {
        let p = unsafe { libc::shmat(shmid, ptr::null(), 0) };
        if p == -1isize as *mut c_void { Err(Error::sys("shmat")) } else { Ok(p as *mut u8) }
    }

    fn shm_detach(&mut self, addr: *mut u8) -> Result<()> {
        if unsafe { libc::shmdt(addr as *const c_void) } < 0 { Err(Error::sys("shmdt")) }
        else { Ok(()) }
    }
}

#[derive(Debug, Copy, Clone)]
enum MappedKind {
    File { fd: RawFd },
    Shm,
}

#[derive(Debug)]
struct Region {
    /// The descriptor as the server sent it - the deduplication key.
    key: RegionDesc,
    base: *mut u8,
    /// Mapped length. Remembered so unmapping uses the exact size the
    /// mapping was created with.
    len: usize,
    kind: MappedKind,
}

/// The mapped ring: one entry per unique region, plus the per-channel area
/// table pointing into those regions.
pub(crate) struct BufferMap {
    regions: Vec<Region>,
    pub areas: Vec<ChannelArea>,
}

fn need_bits(info: &ChannelInfo, buffer_size: UFrames, sample_bits: c_uint) -> u64 {
    info.first as u64 + info.step as u64 * (buffer_size as u64 - 1) + sample_bits as u64
}

impl BufferMap {
    /// Maps every unique region the channel table describes and fills the
    /// running area table. Channels with identical descriptors share one
    /// mapping sized for the largest of them.
    pub fn map(infos: &[ChannelInfo], setup: &SetupData, sys: &mut dyn SysMem)
               -> Result<BufferMap> {
        let mut regions: Vec<Region> = Vec::new();
        let mut areas = Vec::with_capacity(infos.len());

        for (c, info) in infos.iter().enumerate() {
            let base = match regions.iter().position(|r| r.key == info.desc) {
                Some(i) => regions[i].base,
                None => {
                    let mut bits = need_bits(info, setup.buffer_size, setup.sample_bits);
                    for other in &infos[c + 1..] {
                        if other.desc == info.desc {
                            bits = bits.max(need_bits(other, setup.buffer_size, setup.sample_bits));
                        }
                    }
                    let len = page_align(((bits + 7) / 8) as usize);
                    let mapped = match info.desc {
                        RegionDesc::File { fd, offset } => {
                            sys.map_file(fd, offset, len)
                                .map(|base| Region { key: info.desc, base, len,
                                                     kind: MappedKind::File { fd } })
                        }
                        RegionDesc::Shm { shmid } => {
                            let attach = if shmid < 0 { sys.shm_alloc(len) } else { Ok(shmid) };
                            attach.and_then(|id| sys.shm_attach(id))
                                .map(|base| Region { key: info.desc, base, len,
                                                     kind: MappedKind::Shm })
                        }
                    };
                    match mapped {
                        Ok(r) => {
                            let base = r.base;
                            regions.push(r);
                            base
                        }
                        Err(e) => {
                            // roll back what this call mapped so far
                            for r in &regions {
                                let _ = release_region(r, sys);
                            }
                            return Err(e);
                        }
                    }
                }
            };
            areas.push(ChannelArea { addr: base, first: info.first, step: info.step });
        }
        Ok(BufferMap { regions, areas })
    }

    /// The unique descriptors behind the file-backed regions. The caller
    /// hands these to the transport's munmap hook after
    /// [`BufferMap::unmap`]; the mapper itself never closes them.
    pub fn region_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = Vec::new();
        for r in &self.regions {
            if let MappedKind::File { fd } = r.kind {
                if !fds.contains(&fd) { fds.push(fd); }
            }
        }
        fds
    }

    /// Unmaps or detaches every region exactly once. A failing region does
    /// not stop its siblings; the first failure is returned at the end.
    pub fn unmap(&mut self, sys: &mut dyn SysMem) -> Result<()> {
        let mut first_err = None;
        for r in self.regions.drain(..) {
            if let Err(e) = release_region(&r, sys) {
                warn!("failed to release ring region: {}", e);
                first_err.get_or_insert(e);
            }
        }
        self.areas.clear();
        match first_err { Some(e) => Err(e), None => Ok(()) }
    }

    #[cfg(test)]
    fn region_count(&self) -> usize { self.regions.len() }
}

fn release_region(r: &Region, sys: &mut dyn SysMem) -> Result<()> {
    match r.kind {
        MappedKind::File { .. } => sys.unmap(r.base, r.len),
        MappedKind::Shm => sys.shm_detach(r.base),
    }
}

impl Drop for BufferMap {
    fn drop(&mut self) {
        // Streams unmap explicitly before closing; a region surviving to
        // this point is a leak worth hearing about.
        if !self.regions.is_empty() {
            warn!("dropping a BufferMap with {} region(s) still mapped", self.regions.len());
        }
    }
}

/// One contiguous run of ring frames, handed to a raw transfer primitive by
/// [`Stream::write_mmap`] and [`Stream::read_mmap`].
#[derive(Debug)]
pub enum MmapRun {
    /// All channels packed at one address.
    Interleaved { ptr: *mut u8, frames: UFrames },
    /// One address per channel.
    NonInterleaved { ptrs: Vec<*mut u8>, frames: UFrames },
}

impl Stream {
    pub(crate) fn cursors(&self) -> Result<RingCursors> {
        let setup = self.req_setup("cursors")?;
        Ok(RingCursors::new(self.appl_word, self.hw_word, setup.buffer_size, self.boundary))
    }

    /// Maps the shared ring. Hardware parameters must be installed and the
    /// ring must not already be mapped.
    pub fn mmap(&mut self) -> Result<()> {
        let setup = *self.req_setup("mmap")?;
        if self.map.is_some() { return Err(Error::bad_state("mmap: already mapped")); }
        self.ops.transport_mmap()?;
        let mut infos = Vec::with_capacity(setup.channels as usize);
        for c in 0..setup.channels {
            infos.push(self.ops.channel_info(c)?);
        }
        let map = BufferMap::map(&infos, &setup, &mut OsMem)?;
        self.map = Some(map);
        Ok(())
    }

    /// Unmaps the shared ring, then lets the transport dispose of the
    /// descriptors its regions were mapped from. Must happen before the
    /// stream is closed.
    pub fn munmap(&mut self) -> Result<()> {
        let mut map = self.map.take().ok_or_else(|| Error::bad_state("munmap: not mapped"))?;
        let fds = map.region_fds();
        let released = map.unmap(&mut OsMem);
        let hook = self.ops.transport_munmap(&fds);
        released.and(hook)
    }

    /// Frames currently available for the stream's direction, computed from
    /// the shared cursors without a server round trip.
    pub fn avail(&self) -> Result<Frames> {
        let cur = self.cursors()?;
        Ok(cur.avail(self.direction) as Frames)
    }

    fn req_map(&self, func: &'static str) -> Result<&BufferMap> {
        self.map.as_ref().ok_or_else(|| Error::bad_state(func))
    }

    /// Writes up to `size` frames from `src` (starting at `src_offset`) into
    /// the ring, advancing the application cursor through the server after
    /// each contiguous copy. Never copies across the ring wrap in one go.
    ///
    /// When `limit` is given and smaller than `size` it bounds the transfer,
    /// and the frames actually moved are written back through it.
    pub fn write_areas(&mut self, src: &[ChannelArea], mut src_offset: UFrames,
                       mut size: UFrames, limit: Option<&mut UFrames>) -> Result<Frames> {
        if self.direction != Direction::Playback {
            return Err(Error::bad_state("write_areas: capture stream"));
        }
        self.transfer(src, &mut src_offset, &mut size, limit, true)
    }

    /// Capture counterpart of [`Stream::write_areas`]: reads from the ring
    /// into `dst`.
    pub fn read_areas(&mut self, dst: &[ChannelArea], mut dst_offset: UFrames,
                      mut size: UFrames, limit: Option<&mut UFrames>) -> Result<Frames> {
        if self.direction != Direction::Capture {
            return Err(Error::bad_state("read_areas: playback stream"));
        }
        self.transfer(dst, &mut dst_offset, &mut size, limit, false)
    }

    fn transfer(&mut self, caller: &[ChannelArea], caller_offset: &mut UFrames,
                size: &mut UFrames, limit: Option<&mut UFrames>, to_ring: bool)
                -> Result<Frames> {
        let setup = *self.req_setup("transfer")?;
        let cur = self.cursors()?;
        if let Some(ref l) = limit {
            if **l < *size { *size = **l; }
        }
        let mut xfer: UFrames = 0;
        while xfer < *size {
            let frames = cur.xfer(self.direction, *size - xfer);
            if frames == 0 { break; }
            {
                let map = self.req_map("transfer")?;
                if to_ring {
                    copy_areas(&map.areas, cur.offset(), caller, *caller_offset,
                               setup.channels, frames, setup.format)?;
                } else {
                    copy_areas(caller, *caller_offset, &map.areas, cur.offset(),
                               setup.channels, frames, setup.format)?;
                }
            }
            let moved = (self.fast_ops.mmap_forward(frames)? as UFrames).min(frames);
            *caller_offset += moved;
            xfer += moved;
            if moved != frames { break; }
        }
        if let Some(l) = limit { *l = xfer; }
        Ok(xfer as Frames)
    }

    /// Writes `frames` frames of interleaved samples from `buf`.
    pub fn writei(&mut self, buf: &[u8], frames: UFrames) -> Result<Frames> {
        let setup = *self.req_setup("writei")?;
        if buf.len() < frames as usize * (setup.frame_bits / 8) as usize {
            return Err(Error::invalid_argument("writei: short buffer"));
        }
        let areas = areas_from_buf(&setup, buf.as_ptr() as *mut u8);
        self.write_areas(&areas, 0, frames, None)
    }

    /// Writes `frames` frames from one buffer per channel.
    pub fn writen(&mut self, bufs: &[&[u8]], frames: UFrames) -> Result<Frames> {
        let setup = *self.req_setup("writen")?;
        let ptrs = channel_ptrs(&setup, bufs.iter().map(|b| (b.as_ptr() as *mut u8, b.len())),
                                bufs.len(), frames, "writen")?;
        let areas = areas_from_bufs(&setup, &ptrs);
        self.write_areas(&areas, 0, frames, None)
    }

    /// Reads `frames` frames of interleaved samples into `buf`.
    pub fn readi(&mut self, buf: &mut [u8], frames: UFrames) -> Result<Frames> {
        let setup = *self.req_setup("readi")?;
        if buf.len() < frames as usize * (setup.frame_bits / 8) as usize {
            return Err(Error::invalid_argument("readi: short buffer"));
        }
        let areas = areas_from_buf(&setup, buf.as_mut_ptr());
        self.read_areas(&areas, 0, frames, None)
    }

    /// Reads `frames` frames into one buffer per channel.
    pub fn readn(&mut self, bufs: &mut [&mut [u8]], frames: UFrames) -> Result<Frames> {
        let setup = *self.req_setup("readn")?;
        let nbufs = bufs.len();
        let ptrs = channel_ptrs(&setup, bufs.iter_mut().map(|b| (b.as_mut_ptr(), b.len())),
                                nbufs, frames, "readn")?;
        let areas = areas_from_bufs(&setup, &ptrs);
        self.read_areas(&areas, 0, frames, None)
    }

    /// Hands `size` frames already sitting in the ring to `op`, one
    /// contiguous run at a time starting at the hardware offset, with the
    /// run shaped after the access layout. Used when bridging layouts: `op`
    /// is the primitive that consumes ring memory (and is responsible for
    /// advancing cursors as it does).
    pub fn write_mmap(&mut self, size: UFrames,
                      op: &mut dyn FnMut(MmapRun) -> Result<Frames>) -> Result<Frames> {
        self.run_mmap(size, op)
    }

    /// Capture counterpart of [`Stream::write_mmap`]: `op` fills ring
    /// memory.
    pub fn read_mmap(&mut self, size: UFrames,
                     op: &mut dyn FnMut(MmapRun) -> Result<Frames>) -> Result<Frames> {
        self.run_mmap(size, op)
    }

    fn run_mmap(&mut self, size: UFrames, op: &mut dyn FnMut(MmapRun) -> Result<Frames>)
                -> Result<Frames> {
        if size == 0 { return Err(Error::invalid_argument("mmap run: zero size")); }
        let setup = *self.req_setup("mmap run")?;
        let cur = self.cursors()?;
        let mut xfer: UFrames = 0;
        let mut err = None;
        while xfer < size {
            let offset = cur.hw_offset();
            let frames = (size - xfer).min(cur.buffer_size - offset);
            let run = {
                let map = self.req_map("mmap run")?;
                match setup.access {
                    crate::pcm::Access::MMapInterleaved =>
                        MmapRun::Interleaved { ptr: map.areas[0].addr_of(offset).0, frames },
                    crate::pcm::Access::MMapNonInterleaved =>
                        MmapRun::NonInterleaved {
                            ptrs: map.areas.iter().map(|a| a.addr_of(offset).0).collect(),
                            frames,
                        },
                    _ => return Err(Error::bad_state("mmap run: rw access layout")),
                }
            };
            match op(run) {
                Ok(_) => xfer += frames,
                Err(e) => { err = Some(e); break; }
            }
        }
        if xfer > 0 { Ok(xfer as Frames) }
        else { Err(err.unwrap_or_else(|| Error::io("mmap run"))) }
    }
}
