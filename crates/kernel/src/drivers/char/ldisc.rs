// Line disciplines. Slot 0 is N_TTY, the canonical-mode editor: it
// drains the raw queue into the cooked queue, handles erase/kill/echo
// bookkeeping, flow control and signal characters, and implements the
// blocking read/write state machines on top of the queue pair.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::drivers::char::queue::{
    inc, TtyQueue, RQ_THRESHOLD_HW, SQ_THRESHOLD_HW, SQ_THRESHOLD_LW, WAKEUP_CHARS,
};
use crate::drivers::char::termios::{Iflag, Lflag, Oflag, Termios, DISABLED_CHAR};
use crate::drivers::char::tty::{
    self, LdiscState, SelKind, Throttle, Tty, TtyFile, TtyIoctl, TIOCPKT_DATA, TTY_BREAK,
    TTY_OVERRUN, TTY_RQ_THROTTLED, TTY_SLAVE_CLOSED, TTY_SQ_THROTTLED,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::Signal;
use crate::kwarn;

/// Ticks per second of the scheduler clock.
pub const HZ: u64 = 100;

pub trait LineDiscipline: Send + Sync {
    fn open(&self, k: &Kernel, tty: &Arc<Tty>) -> Result<()> {
        let _ = (k, tty);
        Ok(())
    }

    fn close(&self, k: &Kernel, tty: &Arc<Tty>) {
        let _ = (k, tty);
    }

    fn read(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, buf: &[u8]) -> Result<usize>;

    fn ioctl(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, cmd: &mut TtyIoctl<'_>)
        -> Result<isize> {
        let _ = (k, tty, file, cmd);
        Err(Errno::ENOTTY)
    }

    fn select(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, kind: SelKind) -> bool;

    /// Asynchronous input handler, run from the tty bottom half.
    fn input_handler(&self, k: &Kernel, tty: &Arc<Tty>);
}

fn is_ctrl(c: u8) -> bool {
    c < 0x20 || c == 0x7f
}

fn is_alnum(c: u8) -> bool {
    c.is_ascii_alphanumeric()
}

/// OPOST processing of one byte into the write queue. Returns Err when
/// the queue cannot take the (possibly expanded) byte atomically; the
/// caller retries later.
fn opost(c: u8, t: &Termios, ls: &mut LdiscState, write_q: &TtyQueue) -> core::result::Result<(), ()> {
    let mut q = write_q.inner.lock();
    if q.is_full() {
        return Err(());
    }
    let mut c = c;
    if t.c_oflag.contains(Oflag::OPOST) {
        match c {
            b'\n' => {
                if t.c_oflag.contains(Oflag::ONLRET) {
                    ls.column = 0;
                }
                if t.c_oflag.contains(Oflag::ONLCR) {
                    if q.left() < 2 {
                        return Err(());
                    }
                    q.put(b'\r');
                    ls.column = 0;
                }
                ls.canon_column = ls.column;
            }
            b'\r' => {
                if t.c_oflag.contains(Oflag::ONOCR) && ls.column == 0 {
                    return Ok(());
                }
                if t.c_oflag.contains(Oflag::OCRNL) {
                    c = b'\n';
                    if t.c_oflag.contains(Oflag::ONLRET) {
                        ls.column = 0;
                        ls.canon_column = 0;
                    }
                } else {
                    ls.column = 0;
                    ls.canon_column = 0;
                }
            }
            b'\t' => {
                if t.c_oflag.contains(Oflag::XTABS) {
                    let spaces = 8 - (ls.column % 8);
                    if q.left() < 8 {
                        return Err(());
                    }
                    for _ in 0..spaces {
                        q.put(b' ');
                    }
                    ls.column += spaces;
                    return Ok(());
                }
                ls.column = (ls.column | 7) + 1;
            }
            b'\x08' => {
                if ls.column > 0 {
                    ls.column -= 1;
                }
            }
            _ => {
                if t.c_oflag.contains(Oflag::OLCUC) {
                    c = c.to_ascii_uppercase();
                }
                if !is_ctrl(c) {
                    ls.column += 1;
                }
            }
        }
    }
    q.put(c);
    Ok(())
}

/// Echo one byte, expanding control characters to ^X under ECHOCTL.
/// Only called when ECHO is set.
fn echo_char(c: u8, t: &Termios, ls: &mut LdiscState, write_q: &TtyQueue) {
    if t.c_lflag.contains(Lflag::ECHOCTL) && is_ctrl(c) && c != b'\t' {
        let _ = opost(b'^', t, ls, write_q);
        let _ = opost(c ^ 0o100, t, ls, write_q);
    } else {
        let _ = opost(c, t, ls, write_q);
    }
}

/// Emit the visual rub-out for one displayed column.
fn echo_rubout(t: &Termios, ls: &mut LdiscState, write_q: &TtyQueue) {
    let _ = opost(b'\x08', t, ls, write_q);
    let _ = opost(b' ', t, ls, write_q);
    let _ = opost(b'\x08', t, ls, write_q);
}

#[derive(PartialEq)]
enum KillType {
    Erase,
    Werase,
    Kill,
}

/// ERASE / WERASE / KILL handling over the unterminated canonical line.
fn eraser(c: u8, tty: &Tty, t: &Termios, ls: &mut LdiscState) {
    let kill_type;
    {
        let sec = tty.secondary.inner.lock();
        if sec.head == ls.canon_head {
            return;
        }
    }
    if c == t.erase_char() {
        kill_type = KillType::Erase;
    } else if c == t.werase_char() {
        kill_type = KillType::Werase;
    } else {
        if !t.c_lflag.contains(Lflag::ECHO) {
            tty.secondary.inner.lock().head = ls.canon_head;
            return;
        }
        if !t.c_lflag.contains(Lflag::ECHOK) || !t.c_lflag.contains(Lflag::ECHOKE) {
            tty.secondary.inner.lock().head = ls.canon_head;
            if ls.erasing {
                let _ = opost(b'/', t, ls, &tty.write_q);
                ls.erasing = false;
            }
            echo_char(t.kill_char(), t, ls, &tty.write_q);
            // Add a newline if ECHOK is on and ECHOKE is off.
            if t.c_lflag.contains(Lflag::ECHOK) {
                let _ = opost(b'\n', t, ls, &tty.write_q);
            }
            return;
        }
        kill_type = KillType::Kill;
    }

    let mut seen_alnums = 0;
    loop {
        let erased;
        {
            let mut sec = tty.secondary.inner.lock();
            if sec.head == ls.canon_head {
                break;
            }
            let last = sec.last();
            if kill_type == KillType::Werase {
                // Erase through a run of word characters, stopping at
                // the run boundary.
                if is_alnum(last) || last == b'_' {
                    seen_alnums += 1;
                } else if seen_alnums > 0 {
                    break;
                }
            }
            sec.head = crate::drivers::char::queue::dec(sec.head);
            erased = last;
        }
        if t.c_lflag.contains(Lflag::ECHO) {
            if t.c_lflag.contains(Lflag::ECHOPRT) {
                if !ls.erasing {
                    let _ = opost(b'\\', t, ls, &tty.write_q);
                    ls.erasing = true;
                }
                echo_char(erased, t, ls, &tty.write_q);
            } else if !t.c_lflag.contains(Lflag::ECHOE) {
                echo_char(t.erase_char(), t, ls, &tty.write_q);
            } else if erased == b'\t' {
                // Recompute the column of the remaining line, then
                // back up to it.
                let mut col = ls.canon_column;
                {
                    let sec = tty.secondary.inner.lock();
                    let mut tail = ls.canon_head;
                    while tail != sec.head {
                        let ch = sec.buf[tail];
                        if ch == b'\t' {
                            col = (col | 7) + 1;
                        } else if is_ctrl(ch) {
                            if t.c_lflag.contains(Lflag::ECHOCTL) {
                                col += 2;
                            }
                        } else {
                            col += 1;
                        }
                        tail = inc(tail);
                    }
                }
                while ls.column > col {
                    // Raw backspace; opost would adjust the column
                    // bookkeeping twice.
                    tty.write_q.inner.lock().put(b'\x08');
                    ls.column -= 1;
                }
            } else {
                // A control character shows as ^X, two columns.
                if is_ctrl(erased) && t.c_lflag.contains(Lflag::ECHOCTL) {
                    echo_rubout(t, ls, &tty.write_q);
                }
                if !is_ctrl(erased) || t.c_lflag.contains(Lflag::ECHOCTL) {
                    echo_rubout(t, ls, &tty.write_q);
                }
            }
        }
        if kill_type == KillType::Erase {
            break;
        }
    }
    let at_start = tty.secondary.inner.lock().head == ls.canon_head;
    if ls.erasing && at_start {
        let _ = opost(b'/', t, ls, &tty.write_q);
        ls.erasing = false;
    }
}

/// Deliver a termios signal to the foreground group and flush unless
/// NOFLSH.
fn isig(k: &Kernel, tty: &Arc<Tty>, t: &Termios, sig: Signal) {
    let pgrp = tty.pgrp.load(Ordering::Acquire);
    if pgrp > 0 {
        let _ = k.sched.kill_pg(pgrp, sig, true);
    }
    if !t.c_lflag.contains(Lflag::NOFLSH) {
        tty::flush_input(k, tty);
        tty::flush_output(k, tty);
    }
}

/// The deferred input pass: raw queue to cooked queue.
pub fn copy_to_cooked(k: &Kernel, tty: &Arc<Tty>) {
    let t = *tty.termios.read();
    let canon = t.c_lflag.contains(Lflag::ICANON);
    loop {
        let left = tty.secondary.left();
        if left < SQ_THRESHOLD_LW && !tty.set_flag(TTY_SQ_THROTTLED) {
            tty.driver.throttle(k, tty, Throttle::SqFull);
        }
        if left == 0 {
            break;
        }
        let Some((raw, special)) = tty.read_q.get() else {
            break;
        };
        let mut c = raw;
        let mut ls = tty.lstate.lock();
        if special {
            ls.char_error = c;
            continue;
        }
        if ls.char_error != 0 {
            let err = ls.char_error;
            ls.char_error = 0;
            if err == TTY_BREAK {
                if t.c_iflag.contains(Iflag::IGNBRK) {
                    continue;
                }
                // BRKINT is handled by the lower levels.
                if t.c_iflag.contains(Iflag::BRKINT) {
                    continue;
                }
                let mut sec = tty.secondary.inner.lock();
                if t.c_iflag.contains(Iflag::PARMRK) {
                    sec.put(0o377);
                    sec.put(0);
                }
                sec.put(0);
                continue;
            }
            if err == TTY_OVERRUN {
                kwarn!("tty{}: input overrun", tty.line);
                continue;
            }
            // Parity or framing error.
            if t.c_iflag.contains(Iflag::IGNPAR) {
                continue;
            }
            let mut sec = tty.secondary.inner.lock();
            if t.c_iflag.contains(Iflag::PARMRK) {
                sec.put(0o377);
                sec.put(0);
                sec.put(c);
            } else {
                sec.put(0);
            }
            continue;
        }
        if t.c_iflag.contains(Iflag::ISTRIP) {
            c &= 0x7f;
        }
        if !ls.lnext {
            if c == b'\r' {
                if t.c_iflag.contains(Iflag::IGNCR) {
                    continue;
                }
                if t.c_iflag.contains(Iflag::ICRNL) {
                    c = b'\n';
                }
            } else if c == b'\n' && t.c_iflag.contains(Iflag::INLCR) {
                c = b'\r';
            }
        }
        if t.c_iflag.contains(Iflag::IUCLC) && t.c_lflag.contains(Lflag::IEXTEN) {
            c = c.to_ascii_lowercase();
        }
        if c == DISABLED_CHAR {
            // Treated as its own literal so it cannot match a disabled
            // control character below.
            ls.lnext = true;
        }
        if canon && !ls.lnext {
            if c == t.erase_char()
                || c == t.kill_char()
                || (c == t.werase_char() && t.c_lflag.contains(Lflag::IEXTEN))
            {
                eraser(c, tty, &t, &mut ls);
                continue;
            }
            if c == t.lnext_char() && t.c_lflag.contains(Lflag::IEXTEN) {
                ls.lnext = true;
                if t.c_lflag.contains(Lflag::ECHO) {
                    if ls.erasing {
                        let _ = opost(b'/', &t, &mut ls, &tty.write_q);
                        ls.erasing = false;
                    }
                    if t.c_lflag.contains(Lflag::ECHOCTL) {
                        let _ = opost(b'^', &t, &mut ls, &tty.write_q);
                        let _ = opost(b'\x08', &t, &mut ls, &tty.write_q);
                    }
                }
                continue;
            }
            if c == t.reprint_char()
                && t.c_lflag.contains(Lflag::ECHO)
                && t.c_lflag.contains(Lflag::IEXTEN)
            {
                if ls.erasing {
                    let _ = opost(b'/', &t, &mut ls, &tty.write_q);
                    ls.erasing = false;
                }
                echo_char(c, &t, &mut ls, &tty.write_q);
                let _ = opost(b'\n', &t, &mut ls, &tty.write_q);
                let mut tail = ls.canon_head;
                loop {
                    let ch = {
                        let sec = tty.secondary.inner.lock();
                        if tail == sec.head {
                            break;
                        }
                        sec.buf[tail]
                    };
                    echo_char(ch, &t, &mut ls, &tty.write_q);
                    tail = inc(tail);
                }
                continue;
            }
        }
        if t.c_iflag.contains(Iflag::IXON) && !ls.lnext {
            let stopped = tty.stopped.load(Ordering::Acquire);
            if (stopped && t.c_iflag.contains(Iflag::IXANY) && t.c_lflag.contains(Lflag::IEXTEN))
                || c == t.start_char()
            {
                drop(ls);
                tty::start_tty(k, tty);
                continue;
            }
            if c == t.stop_char() {
                drop(ls);
                tty::stop_tty(k, tty);
                continue;
            }
        }
        if t.c_lflag.contains(Lflag::ISIG) && !ls.lnext {
            if c == t.intr_char() {
                drop(ls);
                isig(k, tty, &t, Signal::SigInt);
                continue;
            }
            if c == t.quit_char() {
                drop(ls);
                isig(k, tty, &t, Signal::SigQuit);
                continue;
            }
            if c == t.susp_char() {
                let pgrp = tty.pgrp.load(Ordering::Acquire);
                drop(ls);
                if !k.sched.is_orphaned_pgrp(pgrp) {
                    isig(k, tty, &t, Signal::SigTstp);
                }
                continue;
            }
        }

        if ls.erasing {
            let _ = opost(b'/', &t, &mut ls, &tty.write_q);
            ls.erasing = false;
        }
        if c == b'\n' && !ls.lnext {
            if t.c_lflag.contains(Lflag::ECHO)
                || (canon && t.c_lflag.contains(Lflag::ECHONL))
            {
                let _ = opost(b'\n', &t, &mut ls, &tty.write_q);
            }
        } else if t.c_lflag.contains(Lflag::ECHO) {
            // The EOF char is not echoed in canonical mode.
            if c != t.eof_char() || !canon || ls.lnext {
                if ls.canon_head == tty.secondary.inner.lock().head {
                    ls.canon_column = ls.column;
                }
                echo_char(c, &t, &mut ls, &tty.write_q);
            }
        }

        if t.c_iflag.contains(Iflag::PARMRK)
            && c == 0o377
            && (c != t.eof_char() || !canon || ls.lnext)
        {
            // A genuine 0377 data byte is doubled under PARMRK.
            tty.secondary.inner.lock().put(c);
        }

        if canon
            && !ls.lnext
            && (c == b'\n'
                || c == t.eof_char()
                || c == t.eol_char()
                || (c == t.eol2_char() && t.c_lflag.contains(Lflag::IEXTEN)))
        {
            if c == t.eof_char() {
                c = DISABLED_CHAR;
            }
            let mut sec = tty.secondary.inner.lock();
            sec.put_flagged(c);
            ls.canon_head = sec.head;
            ls.canon_data += 1;
        } else {
            tty.secondary.inner.lock().put(c);
        }
        ls.lnext = false;
    }
    if !tty.write_q.is_empty() {
        tty::tty_write_flush(k, tty);
    }
    let readable = {
        let ls = tty.lstate.lock();
        if canon {
            ls.canon_data > 0
        } else {
            !tty.secondary.is_empty()
        }
    };
    if readable {
        k.sched.wake_up(&tty.secondary.wait);
    }
    if tty.read_q.left() >= RQ_THRESHOLD_HW && tty.clear_flag(TTY_RQ_THROTTLED) {
        tty.driver.throttle(k, tty, Throttle::RqAvail);
    }
}

fn input_available(k: &Kernel, tty: &Arc<Tty>) -> bool {
    let canon = tty.termios.read().c_lflag.contains(Lflag::ICANON);
    let ready = |tty: &Arc<Tty>| {
        if canon {
            tty.lstate.lock().canon_data > 0
        } else {
            !tty.secondary.is_empty()
        }
    };
    if ready(tty) {
        return true;
    }
    // Shuffle any pending data down the queues.
    tty::tty_read_flush(k, tty);
    if let Some(link) = tty::linked_tty(k, tty) {
        tty::tty_write_flush(k, &link);
        tty::tty_read_flush(k, tty);
    }
    ready(tty)
}

/// The canonical line discipline.
pub struct NTty;

impl LineDiscipline for NTty {
    fn read(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, buf: &mut [u8]) -> Result<usize> {
        // Job control: a background read from the controlling tty
        // raises SIGTTIN (POSIX.1 7.1.1.4); /dev/console is exempt.
        let cur = k.sched.current();
        if !file.via_console && cur.tty == Some(tty.line) {
            let tpgrp = tty.pgrp.load(Ordering::Acquire);
            if tpgrp <= 0 {
                kwarn!("tty{}: read with pgrp <= 0", tty.line);
            } else if cur.pgrp != tpgrp {
                if k.sched.is_ignored(Signal::SigTtin) || k.sched.is_orphaned_pgrp(cur.pgrp) {
                    return Err(Errno::EIO);
                }
                let _ = k.sched.kill_pg(cur.pgrp, Signal::SigTtin, true);
                return Err(Errno::ERESTARTSYS);
            }
        }

        let t = *tty.termios.read();
        let canon = t.c_lflag.contains(Lflag::ICANON);
        let (minimum, time, mut deadline_armed) = if canon {
            (0usize, 0u64, false)
        } else {
            let time = (HZ / 10) * u64::from(t.time_char());
            let min = usize::from(t.min_char());
            if min > 0 {
                (min, if time > 0 { time } else { 0 }, false)
            } else if time > 0 {
                // VMIN == 0, VTIME > 0: one interbyte timer run.
                (1, time, true)
            } else {
                // VMIN == VTIME == 0: poll.
                (1, 0, false)
            }
        };
        let poll = !canon && t.min_char() == 0 && t.time_char() == 0;

        let mut copied = 0usize;
        let mut retval: Result<usize> = Ok(0);
        loop {
            // Pending pty control status preempts data.
            if tty.packet.load(Ordering::Acquire) {
                if let Some(link) = tty::linked_tty(k, tty) {
                    let status = link.ctrl_status.swap(0, Ordering::AcqRel);
                    if status != 0 {
                        if copied > 0 {
                            link.ctrl_status.store(status, Ordering::Release);
                            break;
                        }
                        if !buf.is_empty() {
                            buf[0] = status;
                            copied = 1;
                        }
                        break;
                    }
                }
            }
            if !input_available(k, tty) {
                if tty.test_flag(TTY_SLAVE_CLOSED) {
                    retval = Err(Errno::EIO);
                    break;
                }
                if file.hung_up() {
                    break;
                }
                if poll {
                    break;
                }
                if file.nonblock() {
                    retval = Err(Errno::EAGAIN);
                    break;
                }
                if k.sched.signal_pending() {
                    retval = Err(Errno::ERESTARTSYS);
                    break;
                }
                if deadline_armed || (time > 0 && copied > 0) {
                    match k.sched.interruptible_sleep_on_timeout(&tty.secondary.wait, time) {
                        Ok(true) => break,
                        Ok(false) => continue,
                        Err(e) => {
                            retval = Err(e);
                            break;
                        }
                    }
                }
                if let Err(e) = k.sched.interruptible_sleep_on(&tty.secondary.wait) {
                    retval = Err(e);
                    break;
                }
                continue;
            }

            // Packet mode prefixes a data marker byte.
            if tty.packet.load(Ordering::Acquire) && copied == 0 && !buf.is_empty() {
                buf[0] = TIOCPKT_DATA;
                copied = 1;
            }

            let mut hit_eol = false;
            loop {
                let mut ls = tty.lstate.lock();
                let mut sec = tty.secondary.inner.lock();
                if sec.is_empty() {
                    break;
                }
                let at = sec.tail;
                let eol = sec.clear_flag(at);
                let c = sec.buf[at];
                if copied == buf.len() {
                    // Absorb an EOF that immediately follows a full
                    // buffer so the next read does not return zero.
                    if eol {
                        if c == DISABLED_CHAR {
                            ls.canon_data = ls.canon_data.saturating_sub(1);
                            sec.tail = inc(sec.tail);
                        } else {
                            sec.set_flag(at);
                        }
                    }
                    break;
                }
                sec.tail = inc(sec.tail);
                if eol {
                    if ls.canon_data == 0 {
                        kwarn!("tty{}: canon_data underflow", tty.line);
                    }
                    ls.canon_data = ls.canon_data.saturating_sub(1);
                    drop(sec);
                    drop(ls);
                    if c != DISABLED_CHAR {
                        buf[copied] = c;
                        copied += 1;
                    }
                    hit_eol = true;
                    break;
                }
                buf[copied] = c;
                copied += 1;
            }

            if tty.secondary.left() >= SQ_THRESHOLD_HW && tty.clear_flag(TTY_SQ_THROTTLED) {
                tty.driver.throttle(k, tty, Throttle::SqAvail);
            }

            if canon && (hit_eol || copied > 0) {
                break;
            }
            if !canon && copied >= minimum {
                break;
            }
            if copied == buf.len() {
                break;
            }
            if time > 0 {
                deadline_armed = true;
            }
        }
        if copied > 0 {
            Ok(copied)
        } else {
            retval.map(|_| 0)
        }
    }

    fn write(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, buf: &[u8]) -> Result<usize> {
        // Job control for background writers under TOSTOP.
        let cur = k.sched.current();
        let t = *tty.termios.read();
        if t.c_lflag.contains(Lflag::TOSTOP) && !file.via_console && cur.tty == Some(tty.line) {
            let tpgrp = tty.pgrp.load(Ordering::Acquire);
            if tpgrp > 0 && cur.pgrp != tpgrp {
                if k.sched.is_orphaned_pgrp(cur.pgrp) {
                    return Err(Errno::EIO);
                }
                if !k.sched.is_ignored(Signal::SigTtou) {
                    let _ = k.sched.kill_pg(cur.pgrp, Signal::SigTtou, true);
                    return Err(Errno::ERESTARTSYS);
                }
            }
        }

        let mut written = 0usize;
        let mut retval: Result<usize> = Ok(0);
        loop {
            if k.sched.signal_pending() {
                retval = Err(Errno::ERESTARTSYS);
                break;
            }
            if file.hung_up() {
                retval = Err(Errno::EIO);
                break;
            }
            if let Some(link) = tty::linked_tty(k, tty) {
                if link.count.load(Ordering::Acquire) == 0 {
                    retval = Err(Errno::EIO);
                    break;
                }
            }
            {
                let t = *tty.termios.read();
                let mut ls = tty.lstate.lock();
                while written < buf.len() {
                    // opost can refuse even when the queue is not full.
                    if opost(buf[written], &t, &mut ls, &tty.write_q).is_err() {
                        break;
                    }
                    written += 1;
                }
            }
            tty::tty_write_flush(k, tty);
            if written == buf.len() {
                break;
            }
            if file.nonblock() {
                retval = Err(Errno::EAGAIN);
                break;
            }
            if let Err(e) = k.sched.interruptible_sleep_on(&tty.write_q.wait) {
                retval = Err(e);
                break;
            }
        }
        if written > 0 {
            Ok(written)
        } else {
            retval.map(|_| 0)
        }
    }

    fn select(&self, k: &Kernel, tty: &Arc<Tty>, file: &TtyFile, kind: SelKind) -> bool {
        match kind {
            SelKind::In | SelKind::Ex => {
                if kind == SelKind::In && input_available(k, tty) {
                    return true;
                }
                if tty.packet.load(Ordering::Acquire) {
                    if let Some(link) = tty::linked_tty(k, tty) {
                        if link.ctrl_status.load(Ordering::Acquire) != 0 {
                            return true;
                        }
                    }
                }
                if tty.test_flag(TTY_SLAVE_CLOSED) {
                    return true;
                }
                file.hung_up()
            }
            SelKind::Out => tty.write_q.left() > WAKEUP_CHARS,
        }
    }

    fn input_handler(&self, k: &Kernel, tty: &Arc<Tty>) {
        copy_to_cooked(k, tty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::termios::VERASE;
    use crate::drivers::mock::mock_kernel;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;

    /// A device that never drains its queue, so echo output can be
    /// inspected.
    struct SinkDriver;

    impl crate::drivers::char::tty::TtyDriver for SinkDriver {
        fn write(&self, _k: &Kernel, _tty: &Arc<Tty>) {}
    }

    fn test_tty(termios: Termios) -> Arc<Tty> {
        Arc::new(Tty::new(200, termios, None, Arc::new(SinkDriver)))
    }

    fn test_file(nonblock: bool) -> Arc<TtyFile> {
        Arc::new(TtyFile {
            line: 200,
            nonblock: AtomicBool::new(nonblock),
            via_console: false,
            hung_up: AtomicBool::new(false),
        })
    }

    fn drain_write_q(tty: &Tty) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((c, _)) = tty.write_q.get() {
            out.push(c);
        }
        out
    }

    #[test]
    fn test_canonical_echo_and_erase() {
        let (k, _p, _s) = mock_kernel();
        let mut termios = Termios::console_default();
        termios.c_cc[VERASE] = 8;
        let tty = test_tty(termios);
        for c in [b'a', b'b', b'c', 8, b'\n'] {
            tty.read_q.put(c);
        }
        copy_to_cooked(&k, &tty);

        let mut buf = [0u8; 16];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ab\n");

        let echoed = drain_write_q(&tty);
        assert_eq!(echoed, [b'a', b'b', b'c', 8, b' ', 8, b'\r', b'\n']);
        assert_eq!(tty.lstate.lock().column, 0);
        assert_eq!(tty.lstate.lock().canon_data, 0);
    }

    #[test]
    fn test_tab_expansion() {
        let (k, _p, _s) = mock_kernel();
        let mut termios = Termios::console_default();
        termios.c_oflag = Oflag::OPOST | Oflag::XTABS;
        let tty = test_tty(termios);
        tty.lstate.lock().column = 3;
        let n = NTty.write(&k, &tty, &test_file(true), b"\t").unwrap();
        assert_eq!(n, 1);
        assert_eq!(drain_write_q(&tty), [b' '; 5]);
        assert_eq!(tty.lstate.lock().column, 8);
    }

    #[test]
    fn test_eof_makes_empty_read() {
        let (k, _p, _s) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        // ^D on an empty line: the reader sees zero bytes, not a hang.
        tty.read_q.put(4);
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 8];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(n, 0);
        // And nothing was echoed for the EOF char.
        assert_eq!(drain_write_q(&tty), []);
    }

    #[test]
    fn test_kill_line() {
        let (k, _p, _s) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        for c in *b"abc" {
            tty.read_q.put(c);
        }
        tty.read_q.put(0o25); // ^U
        for c in *b"xy\n" {
            tty.read_q.put(c);
        }
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 16];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"xy\n");
    }

    #[test]
    fn test_werase_stops_at_word_boundary() {
        let (k, _p, _s) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        for c in *b"ls foo" {
            tty.read_q.put(c);
        }
        tty.read_q.put(0o27); // ^W
        tty.read_q.put(b'\n');
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 16];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls \n");
    }

    #[test]
    fn test_flow_control_stops_output() {
        let (k, _p, _s) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        tty.read_q.put(0o23); // ^S
        copy_to_cooked(&k, &tty);
        assert!(tty.stopped.load(core::sync::atomic::Ordering::Acquire));
        tty.read_q.put(0o21); // ^Q
        copy_to_cooked(&k, &tty);
        assert!(!tty.stopped.load(core::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn test_isig_sends_sigint_to_pgrp() {
        let (k, _p, sched) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        tty.pgrp.store(42, core::sync::atomic::Ordering::Release);
        tty.read_q.put(3); // ^C
        copy_to_cooked(&k, &tty);
        let log = sched.pgrp_signal_log.lock();
        assert!(log.contains(&(42, crate::sched::Signal::SigInt)));
        drop(log);
        // NOFLSH is off, so pending input was discarded.
        assert!(tty.secondary.is_empty());
    }

    #[test]
    fn test_lnext_escapes_control_chars() {
        let (k, _p, _s) = mock_kernel();
        let tty = test_tty(Termios::console_default());
        tty.read_q.put(0o26); // ^V
        tty.read_q.put(3); // literal ^C
        tty.read_q.put(b'\n');
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 8];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], [3, b'\n']);
    }

    #[test]
    fn test_noncanonical_vmin() {
        let (k, _p, _s) = mock_kernel();
        let mut termios = Termios::console_default();
        termios.c_lflag.remove(Lflag::ICANON);
        termios.c_lflag.remove(Lflag::ECHO);
        termios.c_cc[crate::drivers::char::termios::VMIN] = 2;
        termios.c_cc[crate::drivers::char::termios::VTIME] = 0;
        let tty = test_tty(termios);
        tty.read_q.put(b'x');
        tty.read_q.put(b'y');
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 8];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"xy");
    }

    #[test]
    fn test_parmrk_doubles_ff() {
        let (k, _p, _s) = mock_kernel();
        let mut termios = Termios::console_default();
        termios.c_lflag.remove(Lflag::ICANON);
        termios.c_lflag.remove(Lflag::ECHO);
        termios.c_iflag.insert(Iflag::PARMRK);
        let tty = test_tty(termios);
        tty.read_q.put(0o377);
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 8];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], [0o377, 0o377]);
    }

    #[test]
    fn test_break_injects_parmrk_sequence() {
        let (k, _p, _s) = mock_kernel();
        let mut termios = Termios::console_default();
        termios.c_lflag.remove(Lflag::ICANON);
        termios.c_lflag.remove(Lflag::ECHO);
        termios.c_iflag.insert(Iflag::PARMRK);
        termios.c_iflag.remove(Iflag::IGNBRK);
        let tty = test_tty(termios);
        crate::drivers::char::tty::tty_receive_byte(&k, &tty, 0, Some(TTY_BREAK));
        copy_to_cooked(&k, &tty);
        let mut buf = [0u8; 8];
        let n = NTty.read(&k, &tty, &test_file(true), &mut buf).unwrap();
        assert_eq!(&buf[..n], [0o377, 0, 0]);
    }
}
