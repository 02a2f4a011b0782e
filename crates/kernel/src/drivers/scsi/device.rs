// Per-target-per-lun device records built by the bus scan.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::sched::WaitQueue;

/// SCSI peripheral type codes (INQUIRY byte 0).
pub const TYPE_DISK: i32 = 0x00;
pub const TYPE_TAPE: i32 = 0x01;
pub const TYPE_WORM: i32 = 0x04;
pub const TYPE_ROM: i32 = 0x05;
pub const TYPE_MOD: i32 = 0x07;
pub const TYPE_NONE: i32 = -1;

/// Command-set levels.
pub const SCSI_UNKNOWN: u8 = 0;
pub const SCSI_1: u8 = 1;
pub const SCSI_1_CCS: u8 = 2;
pub const SCSI_2: u8 = 3;

pub struct ScsiDevice {
    /// Index into the global device table.
    pub index: usize,
    /// Index of the owning host.
    pub host: usize,
    pub id: u8,
    pub lun: u8,
    pub typ: AtomicI32,
    pub scsi_level: AtomicU8,
    // Capability bits, fixed at scan time.
    pub removable: AtomicBool,
    pub lockable: AtomicBool,
    pub writeable: AtomicBool,
    pub random: AtomicBool,
    pub tagged_supported: AtomicBool,
    // Dynamic state.
    pub changed: AtomicBool,
    pub busy: AtomicBool,
    pub disconnect: AtomicBool,
    /// Handshaking problems observed; force slow PIO.
    pub borken: AtomicBool,
    pub tagged_queue: AtomicBool,
    pub current_tag: AtomicU8,
    pub access_count: AtomicI32,
    /// Capacity in sectors, filled in by the disk client.
    pub capacity: AtomicI32,
    pub device_wait: WaitQueue,
}

impl ScsiDevice {
    pub fn new(index: usize, host: usize, id: u8, lun: u8) -> Self {
        Self {
            index,
            host,
            id,
            lun,
            typ: AtomicI32::new(TYPE_NONE),
            scsi_level: AtomicU8::new(SCSI_UNKNOWN),
            removable: AtomicBool::new(false),
            lockable: AtomicBool::new(false),
            writeable: AtomicBool::new(false),
            random: AtomicBool::new(false),
            tagged_supported: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            disconnect: AtomicBool::new(false),
            // Assume handshaking problems until the inquiry proves
            // otherwise.
            borken: AtomicBool::new(true),
            tagged_queue: AtomicBool::new(false),
            current_tag: AtomicU8::new(0),
            access_count: AtomicI32::new(0),
            capacity: AtomicI32::new(0),
            device_wait: WaitQueue::new(),
        }
    }

    /// Next queue tag, skipping 0 which means untagged.
    pub fn next_tag(&self) -> u8 {
        let mut tag = self.current_tag.load(Ordering::Acquire);
        if tag == 0 {
            tag = 1;
        }
        self.current_tag.store(tag.wrapping_add(1).max(1), Ordering::Release);
        tag
    }

    pub fn type_code(&self) -> i32 {
        self.typ.load(Ordering::Acquire)
    }
}
