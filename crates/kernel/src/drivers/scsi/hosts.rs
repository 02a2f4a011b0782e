// Host adapter records and the Host Driver capability.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64};
use spin::Mutex;

use crate::drivers::scsi::ScsiCmd;
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::WaitQueue;

/// Scatter-gather capability hints.
pub const SG_NONE: usize = 0;
pub const SG_ALL: usize = 0xff;

/// Disk geometry reported by `bios_param`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiosGeometry {
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u32,
}

/// The low-level adapter interface. A driver provides either the
/// asynchronous `queuecommand` (and reports a nonzero `can_queue`) or
/// the synchronous `command`; the mid-layer picks based on `can_queue`.
pub trait HostDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn info(&self) -> &'static str {
        self.name()
    }

    /// Maximum simultaneously outstanding commands; 0 selects the
    /// synchronous `command` path.
    fn can_queue(&self) -> u32 {
        0
    }

    /// The initiator's own bus ID.
    fn this_id(&self) -> u8 {
        7
    }

    fn sg_tablesize(&self) -> usize {
        SG_NONE
    }

    fn cmd_per_lun(&self) -> usize {
        1
    }

    /// Adapter DMA cannot reach past the ISA threshold; buffers above
    /// it must be bounced.
    fn unchecked_isa_dma(&self) -> bool {
        false
    }

    /// Accept a command; completion arrives via `scsi::scsi_done`.
    fn queuecommand(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> Result<()> {
        let _ = (k, cmd);
        Err(Errno::ENODEV)
    }

    /// Synchronous submission; returns the composite result word.
    fn command(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> u32 {
        let _ = (k, cmd);
        crate::drivers::scsi::DID_NO_CONNECT << 16
    }

    /// Abort a command; false means the command could not be aborted
    /// (e.g. currently connected).
    fn abort(&self, k: &Kernel, cmd: &Arc<ScsiCmd>, code: u32) -> bool;

    /// Reset the bus.
    fn reset(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> bool;

    fn bios_param(&self, size_sectors: u64) -> BiosGeometry {
        // Classic translation: 64 heads, 32 sectors per track.
        BiosGeometry {
            heads: 64,
            sectors: 32,
            cylinders: (size_sectors / (64 * 32)) as u32,
        }
    }

    /// Deferred work hook, run from the SCSI bottom half.
    fn bh(&self, k: &Kernel) {
        let _ = k;
    }
}

pub struct ScsiHost {
    pub host_no: usize,
    pub driver: Arc<dyn HostDriver>,
    pub host_busy: AtomicU32,
    pub host_wait: WaitQueue,
    /// Tick stamp of the last bus reset; submissions stall until
    /// MIN_RESET_DELAY past it.
    pub last_reset: AtomicU64,
    /// Preallocated command slots, `cmd_per_lun` per attached device.
    pub cmds: Mutex<Vec<Arc<ScsiCmd>>>,
}

impl ScsiHost {
    pub fn new(host_no: usize, driver: Arc<dyn HostDriver>) -> Self {
        Self {
            host_no,
            driver,
            host_busy: AtomicU32::new(0),
            host_wait: WaitQueue::new(),
            last_reset: AtomicU64::new(0),
            cmds: Mutex::new(Vec::new()),
        }
    }
}
