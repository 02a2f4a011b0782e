// Cooperative scheduling primitives: wait queues, signal delivery hooks,
// bottom halves.
//
// The process layer itself (task structs, context switch, signal frames)
// is an external collaborator. The core only needs to park on a wait
// queue, wake it, and send signals to processes and process groups; the
// `Sched` capability carries those operations.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::klib::error::Result;

pub type Pid = i32;

/// Signal numbers delivered by the character core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Signal {
    SigHup = 1,
    SigInt = 2,
    SigQuit = 3,
    SigKill = 9,
    SigUsr1 = 10,
    SigUsr2 = 12,
    SigTerm = 15,
    SigCont = 18,
    SigTstp = 20,
    SigTtin = 21,
    SigTtou = 22,
    SigIo = 23,
    SigWinch = 28,
}

impl Signal {
    pub fn from_u32(signo: u32) -> Option<Self> {
        match signo {
            1 => Some(Signal::SigHup),
            2 => Some(Signal::SigInt),
            3 => Some(Signal::SigQuit),
            9 => Some(Signal::SigKill),
            10 => Some(Signal::SigUsr1),
            12 => Some(Signal::SigUsr2),
            15 => Some(Signal::SigTerm),
            18 => Some(Signal::SigCont),
            20 => Some(Signal::SigTstp),
            21 => Some(Signal::SigTtin),
            22 => Some(Signal::SigTtou),
            23 => Some(Signal::SigIo),
            28 => Some(Signal::SigWinch),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// A queue tasks park on while waiting for a condition.
///
/// The wakeup counter lets a sleeper detect a wake that raced ahead of
/// the sleep; the scheduler implementation compares it around the park.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: AtomicU32,
    wakeups: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicU32::new(0),
            wakeups: AtomicU64::new(0),
        }
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    pub fn wakeup_seq(&self) -> u64 {
        self.wakeups.load(Ordering::Acquire)
    }

    /// Bookkeeping called by the scheduler around a park.
    pub fn enter(&self) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Bump the wakeup counter; the scheduler unparks everyone here.
    pub fn post_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::AcqRel);
    }
}

/// Identity of the task currently inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Current {
    pub pid: Pid,
    pub pgrp: Pid,
    pub session: Pid,
    pub leader: bool,
    /// Superuser privilege.
    pub suser: bool,
    /// Controlling tty line, if any.
    pub tty: Option<usize>,
}

/// Scheduling capability provided by the process layer.
pub trait Sched: Send + Sync {
    /// Park until `wake_up` on the queue. Uninterruptible.
    fn sleep_on(&self, wq: &WaitQueue);

    /// Park until `wake_up` or a pending signal; Err(ERESTARTSYS) on
    /// signal.
    fn interruptible_sleep_on(&self, wq: &WaitQueue) -> Result<()>;

    /// Like `interruptible_sleep_on` with a tick deadline; Ok(true)
    /// when the deadline fired before a wakeup.
    fn interruptible_sleep_on_timeout(&self, wq: &WaitQueue, ticks: u64) -> Result<bool> {
        let _ = ticks;
        self.interruptible_sleep_on(wq).map(|()| false)
    }

    fn wake_up(&self, wq: &WaitQueue);

    /// Whether the current task has a pending, unblocked signal.
    fn signal_pending(&self) -> bool;

    /// Whether the current task blocks or ignores the signal.
    fn is_ignored(&self, sig: Signal) -> bool;

    fn send_signal(&self, pid: Pid, sig: Signal) -> Result<()>;

    /// Signal every member of a process group. `privileged` skips the
    /// permission check (kernel-originated job control).
    fn kill_pg(&self, pgrp: Pid, sig: Signal, privileged: bool) -> Result<()>;

    /// True when the process group has no member whose parent is in a
    /// different group of the same session (POSIX orphaned pgrp rule).
    fn is_orphaned_pgrp(&self, pgrp: Pid) -> bool;

    fn current(&self) -> Current;

    /// Record/clear the controlling tty of every task in a session
    /// (hangup and disassociate paths).
    fn clear_ctty_for_session(&self, session: Pid);

    /// Clear the controlling tty of every task attached to a line
    /// (last-close and hangup paths).
    fn clear_ctty_for_line(&self, line: usize);

    /// Set the controlling tty of the current task.
    fn set_current_tty(&self, tty: Option<usize>);
}

// Bottom halves: interrupt handlers mark a bit, the deferred work runs
// later with interrupts enabled.

pub const BH_TTY: u32 = 1 << 0;
pub const BH_KEYBOARD: u32 = 1 << 1;
pub const BH_SCSI: u32 = 1 << 2;

#[derive(Debug, Default)]
pub struct BottomHalves {
    pending: AtomicU32,
}

impl BottomHalves {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    pub fn mark(&self, bh: u32) {
        self.pending.fetch_or(bh, Ordering::AcqRel);
    }

    /// Take and clear the pending mask.
    pub fn take(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        assert_eq!(Signal::from_u32(2), Some(Signal::SigInt));
        assert_eq!(Signal::SigWinch.to_u32(), 28);
        assert_eq!(Signal::from_u32(99), None);
    }

    #[test]
    fn test_bh_mask() {
        let bh = BottomHalves::new();
        bh.mark(BH_TTY);
        bh.mark(BH_SCSI);
        assert_eq!(bh.take(), BH_TTY | BH_SCSI);
        assert_eq!(bh.pending(), 0);
    }

    #[test]
    fn test_waitqueue_counters() {
        let wq = WaitQueue::new();
        assert!(!wq.has_waiters());
        wq.enter();
        assert!(wq.has_waiters());
        wq.post_wakeup();
        assert_eq!(wq.wakeup_seq(), 1);
        wq.leave();
    }
}
