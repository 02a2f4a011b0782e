// The kernel context: every subsystem hangs off one of these, and all
// cross-references between them are resolved through it. Entry points
// take &self; interior locking is per-structure.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicI32;
use spin::Mutex;

use crate::drivers::char::console::Console;
use crate::drivers::char::keyboard::Keyboard;
use crate::drivers::char::ldisc::{LineDiscipline, NTty};
use crate::drivers::char::tty::{TtyTable, NR_LDISCS};
use crate::drivers::scsi::ScsiCore;
use crate::platform::Platform;
use crate::sched::{BottomHalves, Sched, WaitQueue, BH_KEYBOARD, BH_SCSI, BH_TTY};

pub struct Kernel {
    pub platform: Arc<dyn Platform>,
    pub sched: Arc<dyn Sched>,
    pub bh: BottomHalves,
    pub ttys: TtyTable,
    pub console: Console,
    pub kbd: Keyboard,
    pub scsi: ScsiCore,
    /// Console output redirect (TIOCCONS), -1 when unset.
    pub redirect: AtomicI32,
    /// Woken on every keypress (wait_for_keypress users).
    pub keypress_wait: WaitQueue,
    ldiscs: Mutex<Vec<Option<Arc<dyn LineDiscipline>>>>,
}

impl Kernel {
    pub fn new(platform: Arc<dyn Platform>, sched: Arc<dyn Sched>) -> Arc<Self> {
        let console = Console::new(&*platform);
        let mut ldiscs: Vec<Option<Arc<dyn LineDiscipline>>> = Vec::with_capacity(NR_LDISCS);
        ldiscs.push(Some(Arc::new(NTty)));
        for _ in 1..NR_LDISCS {
            ldiscs.push(None);
        }
        let k = Arc::new(Self {
            platform,
            sched,
            bh: BottomHalves::new(),
            ttys: TtyTable::new(),
            console,
            kbd: Keyboard::new(),
            scsi: ScsiCore::new(),
            redirect: AtomicI32::new(-1),
            keypress_wait: WaitQueue::new(),
            ldiscs: Mutex::new(ldiscs),
        });
        k.console.init(&k);
        k
    }

    pub fn ldisc(&self, id: usize) -> Option<Arc<dyn LineDiscipline>> {
        self.ldiscs.lock().get(id).and_then(|l| l.clone())
    }

    pub(crate) fn set_ldisc(&self, id: usize, ops: Option<Arc<dyn LineDiscipline>>) {
        self.ldiscs.lock()[id] = ops;
    }

    /// Run deferred work until the pending mask drains.
    pub fn run_bottom_halves(&self) {
        loop {
            let mask = self.bh.take();
            if mask == 0 {
                break;
            }
            if mask & BH_TTY != 0 {
                crate::drivers::char::tty::tty_bh(self);
            }
            if mask & BH_KEYBOARD != 0 {
                crate::drivers::char::keyboard::kbd_bh(self);
            }
            if mask & BH_SCSI != 0 {
                crate::drivers::scsi::scsi_bh(self);
            }
        }
    }

    /// Timer tick: expire deadlines, then run bottom halves.
    pub fn tick(&self) {
        let now = self.platform.ticks();
        self.console.tick(self, now);
        crate::drivers::scsi::scsi_tick(self, now);
        self.run_bottom_halves();
    }
}
