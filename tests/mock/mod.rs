//! In-process mock of the audio server.
//!
//! Real SysV segments, a real unix socket, real SCM_RIGHTS - only the audio
//! hardware is imaginary. The serving thread follows the protocol contract:
//! payload handled, `result` written, `cmd` cleared, then the doorbell
//! response byte.

use shmpcm::mmap::ChannelArea;
use shmpcm::pcm::{HwConfig, StreamInfo, UFrames};
use shmpcm::shm::{
    send_with_fd, Cmd, DelayData, OpenAnswer, OpenRequest, SharedCtrl, AREA_FILE, AREA_SHM,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const DATA_LEN: usize = 64 * 1024;

#[derive(Debug, Copy, Clone)]
pub struct MockOpts {
    /// Data segments to create; non-interleaved setups want one per channel.
    pub segments: usize,
    /// Advance `hw_ptr` along with `appl_ptr` on MMAP_FORWARD, like hardware
    /// that consumes instantly.
    pub consume: bool,
    /// What CLOSE should answer.
    pub close_result: i32,
    /// When nonzero, SW_PARAMS replies with `buffer_size * boundary_mult`.
    pub boundary_mult: u64,
    /// Describe the ring as one file-backed region (a memfd passed over
    /// SCM_RIGHTS) instead of SysV segments.
    pub file_backed: bool,
}

impl Default for MockOpts {
    fn default() -> MockOpts {
        MockOpts {
            segments: 1,
            consume: false,
            close_result: 0,
            boundary_mult: 0,
            file_backed: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Shared {
    /// Command codes in arrival order.
    pub log: Mutex<Vec<i32>>,
    /// MMAP_FORWARD sizes in arrival order.
    pub forwards: Mutex<Vec<u64>>,
    eof: AtomicBool,
    name_len: AtomicUsize,
}

impl Shared {
    pub fn saw_eof(&self) -> bool { self.eof.load(Ordering::SeqCst) }
    pub fn name_len(&self) -> usize { self.name_len.load(Ordering::SeqCst) }
}

pub struct Mock {
    pub path: PathBuf,
    pub shared: Arc<Shared>,
    cookie: i32,
    data: Vec<i32>,
    file_fd: i32,
    pipe: [i32; 2],
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn new_segment(len: usize) -> i32 {
    unsafe {
        let id = libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600);
        assert!(id >= 0, "shmget failed");
        let p = libc::shmat(id, ptr::null(), 0);
        assert_ne!(p, -1isize as *mut libc::c_void, "shmat failed");
        ptr::write_bytes(p as *mut u8, 0, len);
        libc::shmdt(p);
        id
    }
}

fn sample_bits(format: i32) -> u32 {
    if format == shmpcm::Format::U8 as i32 { 8 }
    else if format == shmpcm::Format::S16LE as i32 { 16 }
    else if format == shmpcm::Format::S32LE as i32 { 32 }
    else { panic!("mock: unexpected format {}", format) }
}

impl Mock {
    pub fn start(opts: MockOpts) -> Mock {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "shmpcm-mock-{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::SeqCst)));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let cookie = new_segment(std::mem::size_of::<SharedCtrl>());
        let data: Vec<i32> = (0..opts.segments).map(|_| new_segment(DATA_LEN)).collect();
        let file_fd = if opts.file_backed {
            unsafe {
                let fd = libc::memfd_create(b"shmpcm-mock\0".as_ptr() as *const libc::c_char, 0);
                assert!(fd >= 0, "memfd_create failed");
                assert_eq!(libc::ftruncate(fd, DATA_LEN as libc::off_t), 0);
                fd
            }
        } else {
            -1
        };

        let mut pipe = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);

        let shared = Arc::new(Shared::default());
        let handle = thread::spawn({
            let shared = shared.clone();
            let data = data.clone();
            let pipe_rd = pipe[0];
            move || serve(listener, cookie, data, file_fd, opts, shared, pipe_rd)
        });

        Mock { path, shared, cookie, data, file_fd, pipe, handle: Mutex::new(Some(handle)) }
    }

    /// Test-side view of the control block.
    pub fn ctrl(&self) -> Ctrl { Ctrl::attach(self.cookie) }

    /// Test-side view of one data segment.
    pub fn data_seg(&self, i: usize) -> DataSeg { DataSeg::attach(self.data[i]) }

    /// Makes the poll descriptor readable.
    pub fn push_poll_byte(&self, b: u8) {
        let n = unsafe { libc::write(self.pipe[1], &b as *const u8 as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    /// Reads back what landed in the file-backed ring, through the mock's
    /// own descriptor.
    pub fn file_read(&self, off: i64, len: usize) -> Vec<u8> {
        assert!(self.file_fd >= 0, "mock is not file-backed");
        let mut v = vec![0u8; len];
        let n = unsafe {
            libc::pread(self.file_fd, v.as_mut_ptr() as *mut libc::c_void, len,
                        off as libc::off_t)
        };
        assert_eq!(n, len as isize);
        v
    }

    pub fn join(&self) {
        if let Some(h) = self.handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for Mock {
    fn drop(&mut self) {
        self.join();
        unsafe {
            libc::shmctl(self.cookie, libc::IPC_RMID, ptr::null_mut());
            for &d in &self.data {
                libc::shmctl(d, libc::IPC_RMID, ptr::null_mut());
            }
            if self.file_fd >= 0 {
                libc::close(self.file_fd);
            }
            libc::close(self.pipe[0]);
            libc::close(self.pipe[1]);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve(listener: UnixListener, cookie: i32, data: Vec<i32>, file_fd: i32, opts: MockOpts,
         shared: Arc<Shared>, pipe_rd: i32) {
    let (mut sock, _) = listener.accept().unwrap();
    let (req, name) = OpenRequest::read_from(&mut sock).unwrap();
    shared.name_len.store(name.len(), Ordering::SeqCst);
    sock.write_all(&OpenAnswer { result: 0, cookie }.encode()).unwrap();

    let ctrl = unsafe { libc::shmat(cookie, ptr::null(), 0) } as *mut SharedCtrl;
    assert_ne!(ctrl as isize, -1);

    let mut last_hw: Option<HwConfig> = None;
    let mut boundary: u64 = 0;
    let mut state: i32 = 0; // Open

    loop {
        let mut b = [0u8; 1];
        match sock.read(&mut b) {
            Ok(1) => {}
            _ => {
                shared.eof.store(true, Ordering::SeqCst);
                break;
            }
        }
        let cmd = unsafe { ptr::read_volatile(ptr::addr_of!((*ctrl).cmd)) };
        shared.log.lock().unwrap().push(cmd);
        let mut result: i32 = 0;
        let mut fd = None;

        unsafe {
            if cmd == Cmd::HwParams as i32 || cmd == Cmd::HwRefine as i32 {
                // echo the configuration unchanged, remember the geometry
                let hwp = ptr::read_volatile(ptr::addr_of!((*ctrl).u.hw_params));
                last_hw = Some(hwp);
                state = 1; // Setup
            } else if cmd == Cmd::SwParams as i32 {
                let mut swp = ptr::read_volatile(ptr::addr_of!((*ctrl).u.sw_params));
                if opts.boundary_mult > 0 {
                    if let Some(hwp) = last_hw {
                        swp.boundary = hwp.buffer_size * opts.boundary_mult;
                        boundary = swp.boundary;
                    }
                }
                ptr::write_volatile(ptr::addr_of_mut!((*ctrl).u.sw_params), swp);
            } else if cmd == Cmd::ChannelInfo as i32 {
                let mut ci = ptr::read_volatile(ptr::addr_of!((*ctrl).u.channel_info));
                let hwp = last_hw.expect("channel_info before hw_params");
                let sb = sample_bits(hwp.format);
                ci.offset = 0;
                if file_fd >= 0 {
                    // one interleaved file region; the descriptor rides the
                    // response byte
                    ci.kind = AREA_FILE;
                    ci.shmid = -1;
                    ci.first = ci.channel * sb;
                    ci.step = sb * hwp.channels;
                    fd = Some(file_fd);
                } else if hwp.access == shmpcm::Access::MMapInterleaved as i32 {
                    ci.kind = AREA_SHM;
                    ci.shmid = data[0];
                    ci.first = ci.channel * sb;
                    ci.step = sb * hwp.channels;
                } else {
                    ci.kind = AREA_SHM;
                    ci.shmid = data[ci.channel as usize];
                    ci.first = 0;
                    ci.step = sb;
                }
                ptr::write_volatile(ptr::addr_of_mut!((*ctrl).u.channel_info), ci);
            } else if cmd == Cmd::MmapForward as i32 {
                let frames = ptr::read_volatile(ptr::addr_of!((*ctrl).u.mmap_forward)).frames;
                shared.forwards.lock().unwrap().push(frames as u64);
                let mut appl = ptr::read_volatile(ptr::addr_of!((*ctrl).appl_ptr)) + frames;
                if boundary > 0 && appl >= boundary { appl -= boundary; }
                ptr::write_volatile(ptr::addr_of_mut!((*ctrl).appl_ptr), appl);
                if opts.consume {
                    ptr::write_volatile(ptr::addr_of_mut!((*ctrl).hw_ptr), appl);
                }
                result = frames as i32;
            } else if cmd == Cmd::Info as i32 {
                let mut id = [0u8; 64];
                id[..4].copy_from_slice(b"mock");
                let info = StreamInfo {
                    device: 0, subdevice: 0, stream: req.stream, card: 0,
                    id, name: [0u8; 80],
                };
                ptr::write_volatile(ptr::addr_of_mut!((*ctrl).u.info), info);
            } else if cmd == Cmd::Delay as i32 {
                ptr::write_volatile(ptr::addr_of_mut!((*ctrl).u.delay), DelayData { frames: 777 });
            } else if cmd == Cmd::Prepare as i32 {
                state = 2; // Prepared
            } else if cmd == Cmd::Start as i32 {
                state = 3; // Running
            } else if cmd == Cmd::State as i32 {
                result = state;
            } else if cmd == Cmd::PollDescriptor as i32 {
                fd = Some(pipe_rd);
            } else if cmd == Cmd::Close as i32 {
                result = opts.close_result;
            }
            // everything else acks with result 0

            ptr::write_volatile(ptr::addr_of_mut!((*ctrl).result), result);
            ptr::write_volatile(ptr::addr_of_mut!((*ctrl).cmd), 0);
        }

        match fd {
            Some(fd) => { send_with_fd(&sock, &[0u8], fd).unwrap(); }
            None => { sock.write_all(&[0u8]).unwrap(); }
        }

        if cmd == Cmd::Close as i32 {
            let mut b = [0u8; 1];
            if matches!(sock.read(&mut b), Ok(0) | Err(_)) {
                shared.eof.store(true, Ordering::SeqCst);
            }
            break;
        }
    }

    unsafe { libc::shmdt(ctrl as *const libc::c_void) };
}

/// Test-side attachment of the control segment.
pub struct Ctrl {
    p: *mut SharedCtrl,
}

impl Ctrl {
    fn attach(cookie: i32) -> Ctrl {
        let p = unsafe { libc::shmat(cookie, ptr::null(), 0) };
        assert_ne!(p, -1isize as *mut libc::c_void);
        Ctrl { p: p as *mut SharedCtrl }
    }

    pub fn set_appl(&self, v: UFrames) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.p).appl_ptr), v) }
    }

    pub fn set_hw(&self, v: UFrames) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.p).hw_ptr), v) }
    }
}

impl Drop for Ctrl {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.p as *const libc::c_void) };
    }
}

/// Test-side attachment of a data segment.
pub struct DataSeg {
    p: *mut u8,
}

impl DataSeg {
    fn attach(id: i32) -> DataSeg {
        let p = unsafe { libc::shmat(id, ptr::null(), 0) };
        assert_ne!(p, -1isize as *mut libc::c_void);
        DataSeg { p: p as *mut u8 }
    }

    pub fn read(&self, off: usize, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(self.p.add(off), v.as_mut_ptr(), len) };
        v
    }

    pub fn write(&self, off: usize, bytes: &[u8]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.p.add(off), bytes.len()) };
    }
}

impl Drop for DataSeg {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.p as *const libc::c_void) };
    }
}

/// Interleaved area table over a caller byte buffer.
pub fn interleaved_areas(buf: &[u8], channels: u32, sample_bits: u32) -> Vec<ChannelArea> {
    (0..channels)
        .map(|c| ChannelArea {
            addr: buf.as_ptr() as *mut u8,
            first: c * sample_bits,
            step: channels * sample_bits,
        })
        .collect()
}
