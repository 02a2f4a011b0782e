// Mock capabilities for host-side testing: a recording platform, a
// scriptable scheduler, and SCSI targets at two levels (a synchronous
// scripted host, and a register-level bus target for the adapter
// engine).

pub mod host;

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::platform::Platform;
use crate::sched::{Current, Pid, Sched, Signal, WaitQueue};

pub use host::{MockBus, MockHost, ScriptedOutcome};

/// Text-mode adaptor memory: 32 KiB, as on a color EGA.
pub const MOCK_VIDEO_CELLS: usize = 16384;

/// Platform backed by plain RAM, with a port-traffic log and a clock
/// that advances on every read so polling loops terminate.
pub struct MockPlatform {
    video: Mutex<Vec<u16>>,
    pub port_log: Mutex<Vec<(u16, u8)>>,
    port_in_scripts: Mutex<BTreeMap<u16, VecDeque<u8>>>,
    ticks: AtomicU64,
    us: AtomicU64,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            video: Mutex::new(alloc::vec![0x0720u16; MOCK_VIDEO_CELLS]),
            port_log: Mutex::new(Vec::new()),
            port_in_scripts: Mutex::new(BTreeMap::new()),
            ticks: AtomicU64::new(1),
            us: AtomicU64::new(1),
        })
    }

    /// Queue bytes to be returned by reads of a port.
    pub fn push_port_input(&self, port: u16, bytes: &[u8]) {
        let mut scripts = self.port_in_scripts.lock();
        scripts.entry(port).or_default().extend(bytes.iter().copied());
    }

    pub fn port_writes_to(&self, port: u16) -> Vec<u8> {
        self.port_log
            .lock()
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn video_snapshot(&self) -> Vec<u16> {
        self.video.lock().clone()
    }

    pub fn cell(&self, off: usize) -> u16 {
        self.video.lock()[off]
    }

    pub fn advance_ticks(&self, n: u64) {
        self.ticks.fetch_add(n, Ordering::AcqRel);
    }
}

impl Platform for MockPlatform {
    fn port_in8(&self, port: u16) -> u8 {
        let mut scripts = self.port_in_scripts.lock();
        if let Some(q) = scripts.get_mut(&port) {
            if let Some(b) = q.pop_front() {
                return b;
            }
        }
        // The keyboard controller reports output-buffer-full exactly
        // while a data byte is waiting on port 0x60.
        if port == 0x64 {
            let pending = scripts.get(&0x60).map(|q| !q.is_empty()).unwrap_or(false);
            return if pending { 0x01 } else { 0 };
        }
        0
    }

    fn port_out8(&self, port: u16, val: u8) {
        self.port_log.lock().push((port, val));
    }

    fn video_cells(&self) -> usize {
        MOCK_VIDEO_CELLS
    }

    fn read_cell(&self, off: usize) -> u16 {
        self.video.lock()[off]
    }

    fn write_cell(&self, off: usize, cell: u16) {
        self.video.lock()[off] = cell;
    }

    fn copy_cells(&self, dst: usize, src: usize, n: usize) {
        self.video.lock().copy_within(src..src + n, dst);
    }

    fn fill_cells(&self, dst: usize, n: usize, cell: u16) {
        self.video.lock()[dst..dst + n].fill(cell);
    }

    fn ticks(&self) -> u64 {
        // A read is a tick: polling loops observe a running clock.
        self.ticks.fetch_add(1, Ordering::AcqRel)
    }

    fn us_clock(&self) -> u64 {
        self.us.fetch_add(1, Ordering::AcqRel)
    }
}

/// Scheduler with a scriptable current task, a signal log, and a
/// sleep hook that pumps the kernel's deferred work so blocking paths
/// make progress in tests.
pub struct MockSched {
    kernel: Mutex<Weak<Kernel>>,
    pub current: Mutex<Current>,
    pub signal_log: Mutex<Vec<(Pid, Signal)>>,
    pub pgrp_signal_log: Mutex<Vec<(Pid, Signal)>>,
    dead_pids: Mutex<BTreeSet<Pid>>,
    orphaned: Mutex<BTreeSet<Pid>>,
    ignored: Mutex<BTreeSet<u32>>,
    pending_signal: AtomicBool,
    sleeps: AtomicU64,
    /// Sleeping more than this many times without a wakeup aborts the
    /// test instead of hanging it.
    pub sleep_budget: AtomicU64,
}

impl MockSched {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            kernel: Mutex::new(Weak::new()),
            current: Mutex::new(Current {
                pid: 100,
                pgrp: 100,
                session: 100,
                leader: true,
                suser: true,
                tty: None,
            }),
            signal_log: Mutex::new(Vec::new()),
            pgrp_signal_log: Mutex::new(Vec::new()),
            dead_pids: Mutex::new(BTreeSet::new()),
            orphaned: Mutex::new(BTreeSet::new()),
            ignored: Mutex::new(BTreeSet::new()),
            pending_signal: AtomicBool::new(false),
            sleeps: AtomicU64::new(0),
            sleep_budget: AtomicU64::new(10_000),
        })
    }

    pub fn attach(&self, k: &Arc<Kernel>) {
        *self.kernel.lock() = Arc::downgrade(k);
    }

    pub fn mark_dead(&self, pid: Pid) {
        self.dead_pids.lock().insert(pid);
    }

    pub fn mark_orphaned(&self, pgrp: Pid) {
        self.orphaned.lock().insert(pgrp);
    }

    pub fn set_pending_signal(&self, pending: bool) {
        self.pending_signal.store(pending, Ordering::Release);
    }

    pub fn set_current(&self, cur: Current) {
        *self.current.lock() = cur;
    }

    fn pump(&self) {
        if let Some(k) = self.kernel.lock().upgrade() {
            k.run_bottom_halves();
            let now = k.platform.ticks();
            crate::drivers::scsi::scsi_tick(&k, now);
        }
        let n = self.sleeps.fetch_add(1, Ordering::AcqRel);
        assert!(
            n < self.sleep_budget.load(Ordering::Acquire),
            "mock scheduler: sleep budget exhausted (deadlock?)"
        );
    }
}

impl Sched for MockSched {
    fn sleep_on(&self, _wq: &WaitQueue) {
        self.pump();
    }

    fn interruptible_sleep_on(&self, _wq: &WaitQueue) -> Result<()> {
        if self.pending_signal.load(Ordering::Acquire) {
            return Err(Errno::ERESTARTSYS);
        }
        self.pump();
        Ok(())
    }

    fn interruptible_sleep_on_timeout(&self, _wq: &WaitQueue, _ticks: u64) -> Result<bool> {
        if self.pending_signal.load(Ordering::Acquire) {
            return Err(Errno::ERESTARTSYS);
        }
        self.pump();
        // The deadline always fires first in the mock.
        Ok(true)
    }

    fn wake_up(&self, wq: &WaitQueue) {
        wq.post_wakeup();
        self.sleeps.store(0, Ordering::Release);
    }

    fn signal_pending(&self) -> bool {
        self.pending_signal.load(Ordering::Acquire)
    }

    fn is_ignored(&self, sig: Signal) -> bool {
        self.ignored.lock().contains(&sig.to_u32())
    }

    fn send_signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        if self.dead_pids.lock().contains(&pid) {
            return Err(Errno::ESRCH);
        }
        self.signal_log.lock().push((pid, sig));
        Ok(())
    }

    fn kill_pg(&self, pgrp: Pid, sig: Signal, _privileged: bool) -> Result<()> {
        self.pgrp_signal_log.lock().push((pgrp, sig));
        Ok(())
    }

    fn is_orphaned_pgrp(&self, pgrp: Pid) -> bool {
        self.orphaned.lock().contains(&pgrp)
    }

    fn current(&self) -> Current {
        *self.current.lock()
    }

    fn clear_ctty_for_session(&self, _session: Pid) {}

    fn clear_ctty_for_line(&self, line: usize) {
        let mut cur = self.current.lock();
        if cur.tty == Some(line) {
            cur.tty = None;
        }
    }

    fn set_current_tty(&self, tty: Option<usize>) {
        self.current.lock().tty = tty;
    }
}

impl MockSched {
    pub fn ignore_signal(&self, sig: Signal) {
        self.ignored.lock().insert(sig.to_u32());
    }
}

/// Build a kernel wired to fresh mocks.
pub fn mock_kernel() -> (Arc<Kernel>, Arc<MockPlatform>, Arc<MockSched>) {
    let platform = MockPlatform::new();
    let sched = MockSched::new();
    let k = Kernel::new(platform.clone(), sched.clone());
    sched.attach(&k);
    (k, platform, sched)
}
