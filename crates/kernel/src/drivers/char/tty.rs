// TTY core: line records, file entry points, hangup, bulk writes
//
// A line is named by its minor number: 0 aliases the foreground
// console, 1..=NR_CONSOLES are virtual consoles, pty masters start at
// PTY_MASTER_BASE with each slave at master+PTY_HALF. Line records are
// allocated on first open and live in an arena table; cross-references
// (the pty link) are line numbers resolved through the table.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::{Mutex, RwLock};

use crate::drivers::char::queue::{TtyQueue, RQ_THRESHOLD_LW, WAKEUP_CHARS};
use crate::drivers::char::termios::{Sgttyb, Termios};
use crate::drivers::char::{ldisc, vt};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::{Pid, Signal};
use crate::{kdebug, kwarn};

pub const NR_CONSOLES: usize = 8;
pub const NR_PTYS: usize = 16;
pub const MAX_TTYS: usize = 256;
pub const NR_LDISCS: usize = 16;

pub const PTY_MASTER_BASE: usize = 128;
/// Distance from a pty master line to its slave.
pub const PTY_HALF: usize = 64;

pub fn is_a_console(line: usize) -> bool {
    (1..=NR_CONSOLES).contains(&line)
}

pub fn is_a_pty(line: usize) -> bool {
    is_a_pty_master(line) || is_a_pty_slave(line)
}

pub fn is_a_pty_master(line: usize) -> bool {
    (PTY_MASTER_BASE..PTY_MASTER_BASE + NR_PTYS).contains(&line)
}

pub fn is_a_pty_slave(line: usize) -> bool {
    (PTY_MASTER_BASE + PTY_HALF..PTY_MASTER_BASE + PTY_HALF + NR_PTYS).contains(&line)
}

pub fn pty_other(line: usize) -> usize {
    if is_a_pty_master(line) {
        line + PTY_HALF
    } else {
        line - PTY_HALF
    }
}

// Tty state flag bits.
pub const TTY_WRITE_BUSY: u32 = 1 << 0;
pub const TTY_READ_BUSY: u32 = 1 << 1;
pub const TTY_IO_ERROR: u32 = 1 << 2;
pub const TTY_SLAVE_CLOSED: u32 = 1 << 3;
pub const TTY_EXCLUSIVE: u32 = 1 << 4;
pub const TTY_RQ_THROTTLED: u32 = 1 << 5;
pub const TTY_SQ_THROTTLED: u32 = 1 << 6;

// Packet-mode control status bits.
pub const TIOCPKT_DATA: u8 = 0;
pub const TIOCPKT_FLUSHREAD: u8 = 1;
pub const TIOCPKT_FLUSHWRITE: u8 = 2;
pub const TIOCPKT_STOP: u8 = 4;
pub const TIOCPKT_START: u8 = 8;
pub const TIOCPKT_NOSTOP: u8 = 16;
pub const TIOCPKT_DOSTOP: u8 = 32;

/// Raw-queue error markers carried through the flag bitmap.
pub const TTY_BREAK: u8 = 1;
pub const TTY_OVERRUN: u8 = 2;
pub const TTY_PARITY: u8 = 3;
pub const TTY_FRAME: u8 = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
    pub ws_xpixel: u16,
    pub ws_ypixel: u16,
}

/// Line-discipline working state, guarded as one unit so the canonical
/// cursors stay consistent with each other.
#[derive(Debug, Default)]
pub struct LdiscState {
    /// Output column, maintained by opost.
    pub column: usize,
    /// Column where the current canonical line started.
    pub canon_column: usize,
    /// Cooked-queue head position at the last line terminator.
    pub canon_head: usize,
    /// Completed canonical lines waiting to be read.
    pub canon_data: usize,
    /// Literal-next pending.
    pub lnext: bool,
    /// Print-style erase in progress.
    pub erasing: bool,
    /// Pending error classification from a flagged raw byte.
    pub char_error: u8,
}

/// Deferred remainder of a tty_write_data call.
pub struct WriteDataCont {
    pub buf: Vec<u8>,
    pub pos: usize,
    pub callback: Box<dyn FnOnce(&Kernel) + Send>,
}

/// Throttle events handed to the low-level driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    RqFull,
    RqAvail,
    SqFull,
    SqAvail,
}

/// Select kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelKind {
    In,
    Out,
    Ex,
}

/// Per-line device operations, implemented by the console, the pty
/// halves, and test stubs.
pub trait TtyDriver: Send + Sync {
    fn open(&self, k: &Kernel, tty: &Arc<Tty>) -> Result<()> {
        let _ = (k, tty);
        Ok(())
    }

    fn close(&self, k: &Kernel, tty: &Arc<Tty>) {
        let _ = (k, tty);
    }

    /// Push the write queue toward the device.
    fn write(&self, k: &Kernel, tty: &Arc<Tty>);

    fn ioctl(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, cmd: &mut TtyIoctl<'_>)
        -> Result<isize> {
        let _ = (k, tty, file, cmd);
        Err(Errno::ENOTTY)
    }

    fn throttle(&self, k: &Kernel, tty: &Arc<Tty>, ev: Throttle) {
        let _ = (k, tty, ev);
    }

    fn stop(&self, k: &Kernel, tty: &Arc<Tty>) {
        let _ = (k, tty);
    }

    fn start(&self, k: &Kernel, tty: &Arc<Tty>) {
        let _ = (k, tty);
    }

    fn hangup(&self, k: &Kernel, tty: &Arc<Tty>) {
        let _ = (k, tty);
    }
}

pub struct Tty {
    pub line: usize,
    pub read_q: TtyQueue,
    pub secondary: TtyQueue,
    pub write_q: TtyQueue,
    pub termios: RwLock<Termios>,
    pub winsize: Mutex<Winsize>,
    pub lstate: Mutex<LdiscState>,
    pub disc: AtomicUsize,
    pub count: AtomicI32,
    pub session: AtomicI32,
    pub pgrp: AtomicI32,
    pub stopped: AtomicBool,
    pub packet: AtomicBool,
    pub ctrl_status: AtomicU8,
    /// Paired line for pseudo-terminals.
    pub link: Option<usize>,
    pub driver: Arc<dyn TtyDriver>,
    flags: AtomicU32,
    write_data: Mutex<Option<WriteDataCont>>,
}

impl Tty {
    pub fn new(line: usize, termios: Termios, link: Option<usize>, driver: Arc<dyn TtyDriver>) -> Self {
        Self {
            line,
            read_q: TtyQueue::new(),
            secondary: TtyQueue::new(),
            write_q: TtyQueue::new(),
            termios: RwLock::new(termios),
            winsize: Mutex::new(Winsize::default()),
            lstate: Mutex::new(LdiscState::default()),
            disc: AtomicUsize::new(0),
            count: AtomicI32::new(0),
            session: AtomicI32::new(0),
            pgrp: AtomicI32::new(-1),
            stopped: AtomicBool::new(false),
            packet: AtomicBool::new(false),
            ctrl_status: AtomicU8::new(0),
            link,
            driver,
            flags: AtomicU32::new(0),
            write_data: Mutex::new(None),
        }
    }

    pub fn test_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    /// Test-and-set; returns the previous state.
    pub fn set_flag(&self, bit: u32) -> bool {
        self.flags.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Test-and-clear; returns the previous state.
    pub fn clear_flag(&self, bit: u32) -> bool {
        self.flags.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn set_ctrl_status(&self, bits: u8, clear: u8) {
        let mut cur = self.ctrl_status.load(Ordering::Acquire);
        loop {
            let new = (cur & !clear) | bits;
            match self.ctrl_status.compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
    }
}

/// One open descriptor on a tty line. Hangup flips `hung_up`, which
/// redirects every subsequent operation to the hung-up behavior.
pub struct TtyFile {
    pub line: usize,
    pub nonblock: AtomicBool,
    pub via_console: bool,
    pub hung_up: AtomicBool,
}

impl TtyFile {
    pub fn hung_up(&self) -> bool {
        self.hung_up.load(Ordering::Acquire)
    }

    pub fn nonblock(&self) -> bool {
        self.nonblock.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub nonblock: bool,
    pub noctty: bool,
}

/// The tty ioctl surface; unknown members of the KD/VT families are
/// forwarded to the attached device.
pub enum TtyIoctl<'a> {
    Tcgets(&'a mut Termios),
    Tcsets(&'a Termios),
    /// Drain output, then set.
    TcsetsW(&'a Termios),
    /// Drain output, flush input, then set.
    TcsetsF(&'a Termios),
    Tiocgetp(&'a mut Sgttyb),
    Tiocsetp(&'a Sgttyb),
    Tiocsetn(&'a Sgttyb),
    /// Send a break when the argument is zero.
    Tcsbrk(i32),
    /// 0=suspend output, 1=restart, 2=send stop char, 3=send start.
    Tcxonc(i32),
    /// 0=flush input, 1=flush output, 2=both.
    Tcflsh(i32),
    Tiocexcl,
    Tiocnxcl,
    Tiocsctty,
    Tiocnotty,
    Tiocgpgrp(&'a mut Pid),
    Tiocspgrp(Pid),
    Tiocgwinsz(&'a mut Winsize),
    Tiocswinsz(Winsize),
    Tiocmget(&'a mut u32),
    Tiocmset(u32),
    Tioccons,
    Tiocpkt(bool),
    Tiocsti(u8),
    Kd(vt::KdIoctl<'a>),
    Vt(vt::VtIoctl<'a>),
}

/// Arena of line records plus the bottom-half work bitmaps.
pub struct TtyTable {
    slots: Mutex<Vec<Option<Arc<Tty>>>>,
    /// Termios survives close for non-pty lines.
    saved_termios: Mutex<Vec<Option<Termios>>>,
    files: Mutex<Vec<Arc<TtyFile>>>,
    check_write: Mutex<[u64; MAX_TTYS / 64]>,
    check_read: Mutex<[u64; MAX_TTYS / 64]>,
}

impl TtyTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TTYS);
        let mut saved = Vec::with_capacity(MAX_TTYS);
        for _ in 0..MAX_TTYS {
            slots.push(None);
            saved.push(None);
        }
        Self {
            slots: Mutex::new(slots),
            saved_termios: Mutex::new(saved),
            files: Mutex::new(Vec::new()),
            check_write: Mutex::new([0; MAX_TTYS / 64]),
            check_read: Mutex::new([0; MAX_TTYS / 64]),
        }
    }

    pub fn get(&self, line: usize) -> Option<Arc<Tty>> {
        self.slots.lock().get(line).and_then(|t| t.clone())
    }

    pub fn insert(&self, line: usize, tty: Arc<Tty>) {
        self.slots.lock()[line] = Some(tty);
    }

    pub fn remove(&self, line: usize) {
        self.slots.lock()[line] = None;
    }

    pub fn saved_termios(&self, line: usize) -> Option<Termios> {
        self.saved_termios.lock()[line]
    }

    pub fn save_termios(&self, line: usize, t: Termios) {
        self.saved_termios.lock()[line] = Some(t);
    }

    pub fn drop_saved_termios(&self, line: usize) {
        self.saved_termios.lock()[line] = None;
    }

    pub fn register_file(&self, file: Arc<TtyFile>) {
        self.files.lock().push(file);
    }

    pub fn unregister_file(&self, file: &Arc<TtyFile>) {
        let mut files = self.files.lock();
        if let Some(pos) = files.iter().position(|f| Arc::ptr_eq(f, file)) {
            files.swap_remove(pos);
        }
    }

    pub fn files_for_line(&self, line: usize) -> Vec<Arc<TtyFile>> {
        self.files.lock().iter().filter(|f| f.line == line).cloned().collect()
    }

    pub fn mark_write(&self, line: usize) {
        self.check_write.lock()[line / 64] |= 1 << (line % 64);
    }

    pub fn mark_read(&self, line: usize) {
        self.check_read.lock()[line / 64] |= 1 << (line % 64);
    }

    fn take_marked(mask: &mut [u64; MAX_TTYS / 64]) -> Vec<usize> {
        let mut lines = Vec::new();
        for (i, word) in mask.iter_mut().enumerate() {
            while *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1 << bit);
                lines.push(i * 64 + bit);
            }
        }
        lines
    }

    pub fn take_write_marks(&self) -> Vec<usize> {
        Self::take_marked(&mut self.check_write.lock())
    }

    pub fn take_read_marks(&self) -> Vec<usize> {
        Self::take_marked(&mut self.check_read.lock())
    }
}

impl Default for TtyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Flush the write queue to the device, guarded against reentry.
pub fn tty_write_flush(k: &Kernel, tty: &Arc<Tty>) {
    if tty.write_q.is_empty() {
        return;
    }
    if tty.set_flag(TTY_WRITE_BUSY) {
        return;
    }
    tty.driver.write(k, tty);
    if !tty.clear_flag(TTY_WRITE_BUSY) {
        kwarn!("tty{}: write busy bit already cleared", tty.line);
    }
    // Room may have opened for a deferred bulk write.
    if tty.write_data.lock().is_some() && tty.write_q.left() > 0 {
        k.ttys.mark_write(tty.line);
        k.bh.mark(crate::sched::BH_TTY);
    }
}

/// Run the line discipline's input handler, guarded against reentry.
pub fn tty_read_flush(k: &Kernel, tty: &Arc<Tty>) {
    if tty.read_q.is_empty() {
        return;
    }
    if tty.set_flag(TTY_READ_BUSY) {
        return;
    }
    if let Some(ld) = k.ldisc(tty.disc.load(Ordering::Acquire)) {
        ld.input_handler(k, tty);
    }
    if !tty.clear_flag(TTY_READ_BUSY) {
        kwarn!("tty{}: read busy bit already cleared", tty.line);
    }
}

pub fn flush_input(k: &Kernel, tty: &Arc<Tty>) {
    tty.read_q.flush();
    tty.secondary.flush();
    {
        let mut ls = tty.lstate.lock();
        ls.canon_head = tty.secondary.inner.lock().head;
        ls.canon_data = 0;
        ls.lnext = false;
        ls.erasing = false;
        ls.char_error = 0;
    }
    if let Some(link) = linked_tty(k, tty) {
        if link.packet.load(Ordering::Acquire) {
            tty.set_ctrl_status(TIOCPKT_FLUSHREAD, 0);
            k.sched.wake_up(&link.secondary.wait);
        }
    }
}

pub fn flush_output(k: &Kernel, tty: &Arc<Tty>) {
    tty.write_q.flush();
    k.sched.wake_up(&tty.write_q.wait);
    if let Some(link) = linked_tty(k, tty) {
        if link.packet.load(Ordering::Acquire) {
            tty.set_ctrl_status(TIOCPKT_FLUSHWRITE, 0);
            k.sched.wake_up(&link.secondary.wait);
        }
    }
}

pub fn linked_tty(k: &Kernel, tty: &Arc<Tty>) -> Option<Arc<Tty>> {
    tty.link.and_then(|line| k.ttys.get(line))
}

/// Engage output flow control.
pub fn stop_tty(k: &Kernel, tty: &Arc<Tty>) {
    if tty.stopped.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Some(link) = linked_tty(k, tty) {
        if link.packet.load(Ordering::Acquire) {
            tty.set_ctrl_status(TIOCPKT_STOP, TIOCPKT_START);
            k.sched.wake_up(&link.secondary.wait);
        }
    }
    tty.driver.stop(k, tty);
    if is_a_console(tty.line) {
        crate::drivers::char::keyboard::set_scroll_lock(k, true);
    }
}

/// Release output flow control and restart the queue.
pub fn start_tty(k: &Kernel, tty: &Arc<Tty>) {
    if !tty.stopped.swap(false, Ordering::AcqRel) {
        return;
    }
    if let Some(link) = linked_tty(k, tty) {
        if link.packet.load(Ordering::Acquire) {
            tty.set_ctrl_status(TIOCPKT_START, TIOCPKT_STOP);
            k.sched.wake_up(&link.secondary.wait);
        }
    }
    tty.driver.start(k, tty);
    tty_write_flush(k, tty);
    if is_a_console(tty.line) {
        crate::drivers::char::keyboard::set_scroll_lock(k, false);
    }
}

fn resolve_minor(k: &Kernel, minor: usize) -> Result<(usize, bool)> {
    if minor == 0 {
        // /dev/console aliases the foreground console.
        return Ok((k.console.fg_line(), true));
    }
    if minor >= MAX_TTYS {
        return Err(Errno::ENXIO);
    }
    Ok((minor, false))
}

fn driver_for_line(k: &Kernel, line: usize) -> Result<Arc<dyn TtyDriver>> {
    if is_a_console(line) {
        Ok(k.console.tty_driver())
    } else if is_a_pty(line) {
        Ok(crate::drivers::char::pty::driver())
    } else {
        Err(Errno::ENODEV)
    }
}

fn default_termios_for(k: &Kernel, line: usize) -> Termios {
    if let Some(saved) = k.ttys.saved_termios(line) {
        return saved;
    }
    if is_a_pty_master(line) {
        Termios::pty_master_default()
    } else {
        Termios::console_default()
    }
}

/// Allocate the line record (and its pty pair) if not yet present.
fn init_dev(k: &Kernel, line: usize) -> Result<Arc<Tty>> {
    if is_a_pty_master(line) {
        if let Some(existing) = k.ttys.get(line) {
            if existing.count.load(Ordering::Acquire) > 0 {
                // A pty master can only be opened once.
                return Err(Errno::EAGAIN);
            }
        }
    }
    let tty = match k.ttys.get(line) {
        Some(t) => t,
        None => {
            let driver = driver_for_line(k, line)?;
            let link = if is_a_pty(line) { Some(pty_other(line)) } else { None };
            let tty = Arc::new(Tty::new(line, default_termios_for(k, line), link, driver));
            if is_a_console(line) {
                let (rows, cols) = k.console.geometry();
                let mut ws = tty.winsize.lock();
                ws.ws_row = rows as u16;
                ws.ws_col = cols as u16;
            }
            k.ttys.insert(line, tty.clone());
            tty
        }
    };
    if let Some(other) = tty.link {
        if k.ttys.get(other).is_none() {
            let driver = driver_for_line(k, other)?;
            let o_tty = Arc::new(Tty::new(other, default_termios_for(k, other), Some(line), driver));
            k.ttys.insert(other, o_tty);
        }
    }
    tty.count.fetch_add(1, Ordering::AcqRel);
    if is_a_pty_master(line) {
        if let Some(o) = k.ttys.get(pty_other(line)) {
            o.count.fetch_add(1, Ordering::AcqRel);
        }
    }
    Ok(tty)
}

pub fn tty_open(k: &Kernel, minor: usize, flags: OpenFlags) -> Result<Arc<TtyFile>> {
    let (line, via_console) = resolve_minor(k, minor)?;
    let mut noctty = flags.noctty || via_console;
    if is_a_pty_master(line) {
        noctty = true;
    }
    let tty = init_dev(k, line)?;
    if tty.test_flag(TTY_EXCLUSIVE) && !k.sched.current().suser {
        tty.count.fetch_sub(1, Ordering::AcqRel);
        return Err(Errno::EBUSY);
    }
    if let Err(e) = tty.driver.open(k, &tty) {
        release_count(k, &tty);
        return Err(e);
    }
    let cur = k.sched.current();
    if !noctty && cur.leader && cur.tty.is_none() && tty.session.load(Ordering::Acquire) == 0 {
        k.sched.set_current_tty(Some(line));
        tty.session.store(cur.session, Ordering::Release);
        tty.pgrp.store(cur.pgrp, Ordering::Release);
    }
    let file = Arc::new(TtyFile {
        line,
        nonblock: AtomicBool::new(flags.nonblock),
        via_console,
        hung_up: AtomicBool::new(false),
    });
    k.ttys.register_file(file.clone());
    Ok(file)
}

fn release_count(k: &Kernel, tty: &Arc<Tty>) {
    tty.count.fetch_sub(1, Ordering::AcqRel);
    let _ = k;
}

pub fn tty_release(k: &Kernel, file: &Arc<TtyFile>) {
    k.ttys.unregister_file(file);
    let Some(tty) = k.ttys.get(file.line) else {
        kwarn!("tty_release: line {} has no record", file.line);
        return;
    };
    // Pending bulk-write trash dies with the descriptor.
    *tty.write_data.lock() = None;
    tty.driver.close(k, &tty);
    if is_a_pty_master(tty.line) {
        if let Some(o) = linked_tty(k, &tty) {
            if o.count.fetch_sub(1, Ordering::AcqRel) <= 0 {
                kwarn!("tty_release: bad pty slave count on line {}", o.line);
                o.count.store(0, Ordering::Release);
            }
        }
    }
    if tty.count.fetch_sub(1, Ordering::AcqRel) > 1 {
        return;
    }
    // Last close: nobody may keep this as a controlling tty.
    k.sched.clear_ctty_for_line(tty.line);
    if let Some(ld) = k.ldisc(tty.disc.load(Ordering::Acquire)) {
        ld.close(k, &tty);
    }
    tty.disc.store(0, Ordering::Release);
    if let Some(o_tty) = linked_tty(k, &tty) {
        if o_tty.count.load(Ordering::Acquire) > 0 {
            return;
        }
        k.ttys.remove(o_tty.line);
        k.ttys.drop_saved_termios(o_tty.line);
    }
    if is_a_pty(tty.line) {
        // Pty settings do not persist across reuse.
        k.ttys.drop_saved_termios(tty.line);
    } else {
        k.ttys.save_termios(tty.line, *tty.termios.read());
    }
    k.ttys.remove(tty.line);
    if k.redirect.load(Ordering::Acquire) == tty.line as i32
        || tty.link.map(|l| k.redirect.load(Ordering::Acquire) == l as i32) == Some(true)
    {
        k.redirect.store(-1, Ordering::Release);
    }
}

/// Ttys have no file position.
pub fn tty_lseek(_file: &Arc<TtyFile>, _offset: i64) -> Result<u64> {
    Err(Errno::ESPIPE)
}

pub fn tty_read(k: &Kernel, file: &Arc<TtyFile>, buf: &mut [u8]) -> Result<usize> {
    if file.hung_up() {
        return Ok(0);
    }
    let tty = k.ttys.get(file.line).ok_or(Errno::EIO)?;
    if tty.test_flag(TTY_IO_ERROR) {
        return Err(Errno::EIO);
    }
    let ld = k.ldisc(tty.disc.load(Ordering::Acquire)).ok_or(Errno::EIO)?;
    ld.read(k, &tty, file, buf)
}

pub fn tty_write(k: &Kernel, file: &Arc<TtyFile>, buf: &[u8]) -> Result<usize> {
    if file.hung_up() {
        return Err(Errno::EIO);
    }
    let redirect = k.redirect.load(Ordering::Acquire);
    let line = if file.via_console && redirect >= 0 {
        redirect as usize
    } else {
        file.line
    };
    let tty = k.ttys.get(line).ok_or(Errno::EIO)?;
    if tty.test_flag(TTY_IO_ERROR) {
        return Err(Errno::EIO);
    }
    let ld = k.ldisc(tty.disc.load(Ordering::Acquire)).ok_or(Errno::EIO)?;
    ld.write(k, &tty, file, buf)
}

pub fn tty_select(k: &Kernel, file: &Arc<TtyFile>, kind: SelKind) -> bool {
    if file.hung_up() {
        return true;
    }
    let Some(tty) = k.ttys.get(file.line) else {
        return false;
    };
    match k.ldisc(tty.disc.load(Ordering::Acquire)) {
        Some(ld) => ld.select(k, &tty, file, kind),
        None => false,
    }
}

/// Drain the output queue, sleeping until the device catches up.
fn wait_until_sent(k: &Kernel, tty: &Arc<Tty>) -> Result<()> {
    loop {
        tty_write_flush(k, tty);
        if tty.write_q.is_empty() {
            return Ok(());
        }
        k.sched.interruptible_sleep_on(&tty.write_q.wait)?;
    }
}

fn change_termios(k: &Kernel, tty: &Arc<Tty>, new: &Termios) {
    let was_canon;
    {
        let mut t = tty.termios.write();
        was_canon = t.c_lflag.contains(crate::drivers::char::termios::Lflag::ICANON);
        *t = *new;
    }
    let now_canon = new.c_lflag.contains(crate::drivers::char::termios::Lflag::ICANON);
    if was_canon && !now_canon {
        // Leaving canonical mode makes everything pending readable.
        let mut ls = tty.lstate.lock();
        ls.canon_head = tty.secondary.inner.lock().head;
        ls.canon_data = 0;
        ls.erasing = false;
    }
    k.sched.wake_up(&tty.secondary.wait);
}

pub fn tty_ioctl(k: &Kernel, file: &Arc<TtyFile>, cmd: &mut TtyIoctl<'_>) -> Result<isize> {
    if file.hung_up() {
        return Err(Errno::EIO);
    }
    let tty = k.ttys.get(file.line).ok_or(Errno::EIO)?;
    if tty.test_flag(TTY_IO_ERROR) {
        return Err(Errno::EIO);
    }
    match cmd {
        TtyIoctl::Tcgets(out) => {
            **out = *tty.termios.read();
            Ok(0)
        }
        TtyIoctl::Tcsets(new) => {
            change_termios(k, &tty, new);
            Ok(0)
        }
        TtyIoctl::TcsetsW(new) => {
            wait_until_sent(k, &tty)?;
            change_termios(k, &tty, new);
            Ok(0)
        }
        TtyIoctl::TcsetsF(new) => {
            wait_until_sent(k, &tty)?;
            flush_input(k, &tty);
            change_termios(k, &tty, new);
            Ok(0)
        }
        TtyIoctl::Tiocgetp(out) => {
            **out = Sgttyb::from_termios(&tty.termios.read());
            Ok(0)
        }
        TtyIoctl::Tiocsetp(sg) => {
            let mut t = *tty.termios.read();
            sg.apply_to(&mut t);
            wait_until_sent(k, &tty)?;
            flush_input(k, &tty);
            change_termios(k, &tty, &t);
            Ok(0)
        }
        TtyIoctl::Tiocsetn(sg) => {
            let mut t = *tty.termios.read();
            sg.apply_to(&mut t);
            change_termios(k, &tty, &t);
            Ok(0)
        }
        TtyIoctl::Tcsbrk(arg) => {
            wait_until_sent(k, &tty)?;
            if *arg == 0 {
                kdebug!("tty{}: break", tty.line);
            }
            Ok(0)
        }
        TtyIoctl::Tcxonc(arg) => match arg {
            0 => {
                stop_tty(k, &tty);
                Ok(0)
            }
            1 => {
                start_tty(k, &tty);
                Ok(0)
            }
            2 => {
                let stop = tty.termios.read().stop_char();
                tty.write_q.put(stop);
                tty_write_flush(k, &tty);
                Ok(0)
            }
            3 => {
                let start = tty.termios.read().start_char();
                tty.write_q.put(start);
                tty_write_flush(k, &tty);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        },
        TtyIoctl::Tcflsh(arg) => match arg {
            0 => {
                flush_input(k, &tty);
                Ok(0)
            }
            1 => {
                flush_output(k, &tty);
                Ok(0)
            }
            2 => {
                flush_input(k, &tty);
                flush_output(k, &tty);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        },
        TtyIoctl::Tiocexcl => {
            tty.set_flag(TTY_EXCLUSIVE);
            Ok(0)
        }
        TtyIoctl::Tiocnxcl => {
            tty.clear_flag(TTY_EXCLUSIVE);
            Ok(0)
        }
        TtyIoctl::Tiocsctty => {
            let cur = k.sched.current();
            if !cur.leader || cur.tty.is_some() {
                return Err(Errno::EPERM);
            }
            if tty.session.load(Ordering::Acquire) != 0 && !cur.suser {
                return Err(Errno::EPERM);
            }
            k.sched.set_current_tty(Some(tty.line));
            tty.session.store(cur.session, Ordering::Release);
            tty.pgrp.store(cur.pgrp, Ordering::Release);
            Ok(0)
        }
        TtyIoctl::Tiocnotty => {
            let cur = k.sched.current();
            if cur.tty != Some(tty.line) {
                return Err(Errno::ENOTTY);
            }
            if cur.leader {
                disassociate_ctty(k, false);
            }
            k.sched.set_current_tty(None);
            Ok(0)
        }
        TtyIoctl::Tiocgpgrp(out) => {
            **out = tty.pgrp.load(Ordering::Acquire);
            Ok(0)
        }
        TtyIoctl::Tiocspgrp(pgrp) => {
            let cur = k.sched.current();
            if cur.tty != Some(tty.line) && !cur.suser {
                return Err(Errno::ENOTTY);
            }
            if *pgrp < 0 {
                return Err(Errno::EINVAL);
            }
            tty.pgrp.store(*pgrp, Ordering::Release);
            Ok(0)
        }
        TtyIoctl::Tiocgwinsz(out) => {
            **out = *tty.winsize.lock();
            Ok(0)
        }
        TtyIoctl::Tiocswinsz(new) => {
            let changed = {
                let mut ws = tty.winsize.lock();
                let changed = *ws != *new;
                *ws = *new;
                changed
            };
            if changed {
                let pgrp = tty.pgrp.load(Ordering::Acquire);
                if pgrp > 0 {
                    let _ = k.sched.kill_pg(pgrp, Signal::SigWinch, true);
                }
            }
            Ok(0)
        }
        TtyIoctl::Tioccons => {
            if is_a_console(tty.line) {
                if !k.sched.current().suser {
                    return Err(Errno::EPERM);
                }
                k.redirect.store(-1, Ordering::Release);
            } else {
                if k.redirect.load(Ordering::Acquire) >= 0 {
                    return Err(Errno::EBUSY);
                }
                k.redirect.store(tty.line as i32, Ordering::Release);
            }
            Ok(0)
        }
        TtyIoctl::Tiocpkt(on) => {
            if !is_a_pty_master(tty.line) {
                return Err(Errno::ENOTTY);
            }
            tty.packet.store(*on, Ordering::Release);
            Ok(0)
        }
        TtyIoctl::Tiocsti(c) => {
            if !k.sched.current().suser && k.sched.current().tty != Some(tty.line) {
                return Err(Errno::EPERM);
            }
            tty.read_q.put(*c);
            k.ttys.mark_read(tty.line);
            k.bh.mark(crate::sched::BH_TTY);
            Ok(0)
        }
        TtyIoctl::Tiocmget(_) | TtyIoctl::Tiocmset(_) | TtyIoctl::Kd(_) | TtyIoctl::Vt(_) => {
            tty.driver.ioctl(k, &tty, file, cmd)
        }
    }
}

/// Hang a line up: every open descriptor flips to the hung-up ops,
/// queues flush, the session is signalled, and controlling-tty
/// pointers are cleared.
fn do_tty_hangup(k: &Kernel, tty: &Arc<Tty>) {
    for file in k.ttys.files_for_line(tty.line) {
        file.hung_up.store(true, Ordering::Release);
    }
    flush_input(k, tty);
    flush_output(k, tty);
    k.sched.wake_up(&tty.secondary.wait);
    k.sched.wake_up(&tty.write_q.wait);
    let session = tty.session.load(Ordering::Acquire);
    if session > 0 {
        let _ = k.sched.kill_pg(session, Signal::SigHup, true);
        let _ = k.sched.kill_pg(session, Signal::SigCont, true);
        k.sched.clear_ctty_for_session(session);
    }
    tty.session.store(0, Ordering::Release);
    tty.pgrp.store(-1, Ordering::Release);
    k.sched.clear_ctty_for_line(tty.line);
    tty.driver.hangup(k, tty);
}

pub fn tty_hangup(k: &Kernel, tty: &Arc<Tty>) {
    kdebug!("tty{} hangup", tty.line);
    do_tty_hangup(k, tty);
}

pub fn tty_vhangup(k: &Kernel, tty: &Arc<Tty>) {
    kdebug!("tty{} vhangup", tty.line);
    do_tty_hangup(k, tty);
}

/// Session-leader detach: signal the foreground group and clear the
/// controlling tty across the session, without touching the hardware.
pub fn disassociate_ctty(k: &Kernel, privileged: bool) {
    let cur = k.sched.current();
    if let Some(line) = cur.tty {
        if let Some(tty) = k.ttys.get(line) {
            let pgrp = tty.pgrp.load(Ordering::Acquire);
            if pgrp > 0 {
                let _ = k.sched.kill_pg(pgrp, Signal::SigHup, privileged);
                let _ = k.sched.kill_pg(pgrp, Signal::SigCont, privileged);
            }
            tty.session.store(0, Ordering::Release);
            tty.pgrp.store(-1, Ordering::Release);
        } else {
            kwarn!("disassociate_ctty: controlling tty {} missing", line);
        }
    }
    k.sched.clear_ctty_for_session(cur.session);
}

/// Queue a large block for output. Whatever does not fit immediately is
/// parked as a continuation drained by the bottom half; the callback
/// runs only from the bottom half, never synchronously.
pub fn tty_write_data(
    k: &Kernel,
    tty: &Arc<Tty>,
    buf: &[u8],
    callback: Box<dyn FnOnce(&Kernel) + Send>,
) -> Result<usize> {
    let remaining;
    {
        let mut wd = tty.write_data.lock();
        if wd.is_some() {
            return Err(Errno::EBUSY);
        }
        let mut q = tty.write_q.inner.lock();
        let mut taken = 0;
        while taken < buf.len() && !q.is_full() {
            q.put(buf[taken]);
            taken += 1;
        }
        remaining = buf.len() - taken;
        if remaining > 0 {
            *wd = Some(WriteDataCont {
                buf: buf[taken..].to_vec(),
                pos: 0,
                callback,
            });
        }
    }
    tty_write_flush(k, tty);
    Ok(remaining)
}

/// Bottom half: push bulk-write residuals into drained queues and run
/// pending input handlers, in FIFO order per line.
pub fn tty_bh(k: &Kernel) {
    for line in k.ttys.take_write_marks() {
        let Some(tty) = k.ttys.get(line) else { continue };
        let finished = {
            let mut wd_slot = tty.write_data.lock();
            let drained = if let Some(wd) = wd_slot.as_mut() {
                let mut q = tty.write_q.inner.lock();
                while wd.pos < wd.buf.len() && !q.is_full() {
                    q.put(wd.buf[wd.pos]);
                    wd.pos += 1;
                }
                wd.pos == wd.buf.len()
            } else {
                false
            };
            if drained {
                wd_slot.take()
            } else {
                None
            }
        };
        if let Some(done) = finished {
            (done.callback)(k);
        }
        tty_write_flush(k, &tty);
    }
    for line in k.ttys.take_read_marks() {
        if let Some(tty) = k.ttys.get(line) {
            tty_read_flush(k, &tty);
        }
    }
}

/// Feed one received byte from a device into the raw queue, optionally
/// flagged with an error class, and schedule the discipline.
pub fn tty_receive_byte(k: &Kernel, tty: &Arc<Tty>, c: u8, error: Option<u8>) {
    {
        let mut q = tty.read_q.inner.lock();
        match error {
            None => q.put(c),
            Some(err) => {
                // Error classification rides in-band: the flagged byte
                // carries the class, the data byte follows.
                q.put_flagged(err);
                q.put(c);
            }
        }
    }
    if tty.read_q.left() < RQ_THRESHOLD_LW && !tty.set_flag(TTY_RQ_THROTTLED) {
        tty.driver.throttle(k, tty, Throttle::RqFull);
    }
    k.ttys.mark_read(tty.line);
    k.bh.mark(crate::sched::BH_TTY);
}

/// Room check used by select(OUT) and the write path.
pub fn write_room_available(tty: &Tty) -> bool {
    tty.write_q.left() > WAKEUP_CHARS
}

pub fn register_ldisc(k: &Kernel, id: usize, ops: Option<Arc<dyn ldisc::LineDiscipline>>) -> Result<()> {
    if id == 0 || id >= NR_LDISCS {
        return Err(Errno::EINVAL);
    }
    k.set_ldisc(id, ops);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::termios::Lflag;
    use crate::drivers::mock::mock_kernel;
    use core::sync::atomic::AtomicUsize;

    struct SinkDriver;

    impl TtyDriver for SinkDriver {
        fn write(&self, _k: &Kernel, _tty: &Arc<Tty>) {}
    }

    /// Drains a fixed budget per call, like a slow uart.
    struct TrickleDriver {
        budget: AtomicUsize,
    }

    impl TtyDriver for TrickleDriver {
        fn write(&self, _k: &Kernel, tty: &Arc<Tty>) {
            for _ in 0..self.budget.load(Ordering::Acquire) {
                if tty.write_q.get().is_none() {
                    break;
                }
            }
        }
    }

    #[test]
    fn test_line_classification() {
        assert!(is_a_console(1));
        assert!(is_a_console(NR_CONSOLES));
        assert!(!is_a_console(0));
        assert!(is_a_pty_master(PTY_MASTER_BASE));
        assert!(is_a_pty_slave(PTY_MASTER_BASE + PTY_HALF));
        assert_eq!(pty_other(PTY_MASTER_BASE), PTY_MASTER_BASE + PTY_HALF);
        assert_eq!(pty_other(PTY_MASTER_BASE + PTY_HALF), PTY_MASTER_BASE);
    }

    #[test]
    fn test_write_data_defers_overflow() {
        let (k, _p, _s) = mock_kernel();
        let tty = Arc::new(Tty::new(
            201,
            crate::drivers::char::termios::Termios::console_default(),
            None,
            Arc::new(SinkDriver),
        ));
        k.ttys.insert(201, tty.clone());
        let big = alloc::vec![0x55u8; 2000];
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        let left = tty_write_data(
            &k,
            &tty,
            &big,
            alloc::boxed::Box::new(move |_k| {
                done2.fetch_add(1, Ordering::AcqRel);
            }),
        )
        .unwrap();
        // The queue holds capacity-1 bytes; the rest parked.
        let cap = crate::drivers::char::queue::TTY_BUF_SIZE - 1;
        assert_eq!(left, 2000 - cap);
        // The callback never runs synchronously.
        assert_eq!(done.load(Ordering::Acquire), 0);
        // Drain the queue, then let the bottom half push the residual.
        while tty.write_q.get().is_some() {}
        k.ttys.mark_write(201);
        tty_bh(&k);
        assert_eq!(done.load(Ordering::Acquire), 1);
        assert_eq!(tty.write_q.chars(), 2000 - cap);
    }

    #[test]
    fn test_write_data_busy_while_pending() {
        let (k, _p, _s) = mock_kernel();
        let tty = Arc::new(Tty::new(
            202,
            crate::drivers::char::termios::Termios::console_default(),
            None,
            Arc::new(SinkDriver),
        ));
        k.ttys.insert(202, tty.clone());
        let big = alloc::vec![1u8; 2000];
        tty_write_data(&k, &tty, &big, alloc::boxed::Box::new(|_| {})).unwrap();
        assert_eq!(
            tty_write_data(&k, &tty, &big, alloc::boxed::Box::new(|_| {})).err(),
            Some(Errno::EBUSY)
        );
    }

    #[test]
    fn test_hangup_rewrites_file_ops() {
        let (k, _p, sched) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let tty = k.ttys.get(file.line).unwrap();
        tty.session.store(55, Ordering::Release);
        tty.pgrp.store(55, Ordering::Release);
        tty_hangup(&k, &tty);
        assert!(file.hung_up());
        let mut buf = [0u8; 4];
        assert_eq!(tty_read(&k, &file, &mut buf), Ok(0));
        assert_eq!(tty_write(&k, &file, b"x"), Err(Errno::EIO));
        let mut t = crate::drivers::char::termios::Termios::console_default();
        assert_eq!(
            tty_ioctl(&k, &file, &mut TtyIoctl::Tcgets(&mut t)),
            Err(Errno::EIO)
        );
        // The session was signalled and cleared.
        let log = sched.pgrp_signal_log.lock();
        assert!(log.contains(&(55, Signal::SigHup)));
        assert!(log.contains(&(55, Signal::SigCont)));
        drop(log);
        assert_eq!(tty.session.load(Ordering::Acquire), 0);
        assert_eq!(tty.pgrp.load(Ordering::Acquire), -1);
    }

    #[test]
    fn test_termios_set_get_roundtrip() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let mut t = crate::drivers::char::termios::Termios::console_default();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tcgets(&mut t)).unwrap();
        let mut modified = t;
        modified.c_lflag.remove(Lflag::ECHO);
        tty_ioctl(&k, &file, &mut TtyIoctl::Tcsets(&modified)).unwrap();
        let mut back = t;
        tty_ioctl(&k, &file, &mut TtyIoctl::Tcgets(&mut back)).unwrap();
        assert_eq!(back, modified);
    }

    #[test]
    fn test_winsize_change_signals_pgrp() {
        let (k, _p, sched) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let tty = k.ttys.get(file.line).unwrap();
        tty.pgrp.store(77, Ordering::Release);
        let mut ws = Winsize::default();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocgwinsz(&mut ws)).unwrap();
        assert_eq!(ws.ws_col, 80);
        assert_eq!(ws.ws_row, 25);
        let new = Winsize {
            ws_row: 50,
            ws_col: 132,
            ..Winsize::default()
        };
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocswinsz(new)).unwrap();
        assert!(sched
            .pgrp_signal_log
            .lock()
            .contains(&(77, Signal::SigWinch)));
        // Setting the same size again is quiet.
        sched.pgrp_signal_log.lock().clear();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocswinsz(new)).unwrap();
        assert!(sched.pgrp_signal_log.lock().is_empty());
    }

    #[test]
    fn test_tiocsti_simulates_input() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocsti(b'z')).unwrap();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocsti(b'\n')).unwrap();
        k.run_bottom_halves();
        let mut buf = [0u8; 8];
        let n = tty_read(&k, &file, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"z\n");
    }

    #[test]
    fn test_exclusive_open() {
        let (k, _p, sched) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocexcl).unwrap();
        {
            let mut cur = sched.current.lock();
            cur.suser = false;
        }
        assert_eq!(
            tty_open(&k, 1, OpenFlags::default()).err(),
            Some(Errno::EBUSY)
        );
        tty_ioctl(&k, &file, &mut TtyIoctl::Tiocnxcl).unwrap();
        assert!(tty_open(&k, 1, OpenFlags::default()).is_ok());
    }

    #[test]
    fn test_flow_control_ioctl() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let tty = k.ttys.get(file.line).unwrap();
        tty_ioctl(&k, &file, &mut TtyIoctl::Tcxonc(0)).unwrap();
        assert!(tty.stopped.load(Ordering::Acquire));
        tty_ioctl(&k, &file, &mut TtyIoctl::Tcxonc(1)).unwrap();
        assert!(!tty.stopped.load(Ordering::Acquire));
        assert_eq!(
            tty_ioctl(&k, &file, &mut TtyIoctl::Tcxonc(9)).err(),
            Some(Errno::EINVAL)
        );
    }

    #[test]
    fn test_trickle_write_flush() {
        let (k, _p, _s) = mock_kernel();
        let tty = Arc::new(Tty::new(
            203,
            crate::drivers::char::termios::Termios::console_default(),
            None,
            Arc::new(TrickleDriver {
                budget: AtomicUsize::new(4),
            }),
        ));
        k.ttys.insert(203, tty.clone());
        for c in *b"abcdefgh" {
            tty.write_q.put(c);
        }
        tty_write_flush(&k, &tty);
        assert_eq!(tty.write_q.chars(), 4);
    }
}
