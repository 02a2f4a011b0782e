// SCSI mid-layer: command descriptors, submission, completion
// classification with sense-driven retry/abort/reset escalation,
// timeout bookkeeping, and the DMA bounce pool.

pub mod adapter;
pub mod device;
pub mod disk;
pub mod dma;
pub mod hosts;
pub mod ioctl;
pub mod sg;
pub mod tape;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::{kdebug, kerror, kinfo, kwarn};

pub use device::ScsiDevice;
pub use dma::{DmaHandle, DmaPool, ISA_DMA_THRESHOLD};
pub use hosts::{BiosGeometry, HostDriver, ScsiHost};

// Command opcodes used by the core and its clients.
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REZERO_UNIT: u8 = 0x01;
pub const REQUEST_SENSE: u8 = 0x03;
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0a;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT: u8 = 0x15;
pub const ERASE: u8 = 0x19;
pub const MODE_SENSE: u8 = 0x1a;
pub const START_STOP: u8 = 0x1b;
pub const ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const READ_CAPACITY: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const WRITE_FILEMARKS: u8 = 0x10;
pub const SPACE: u8 = 0x11;
pub const MODE_SELECT_TAPE: u8 = 0x15;

/// CDB length by command group.
pub const SCSI_COMMAND_SIZE: [usize; 8] = [6, 10, 10, 12, 12, 12, 10, 10];

pub fn command_size(opcode: u8) -> usize {
    SCSI_COMMAND_SIZE[((opcode) >> 5) as usize & 7]
}

// Messages.
pub const COMMAND_COMPLETE: u8 = 0x00;
pub const SAVE_POINTERS: u8 = 0x02;
pub const RESTORE_POINTERS: u8 = 0x03;
pub const DISCONNECT: u8 = 0x04;
pub const ABORT_MSG: u8 = 0x06;
pub const MESSAGE_REJECT: u8 = 0x07;
pub const NOP_MSG: u8 = 0x08;
pub const LINKED_CMD_COMPLETE: u8 = 0x0a;
pub const LINKED_FLG_CMD_COMPLETE: u8 = 0x0b;
pub const SIMPLE_QUEUE_TAG: u8 = 0x20;
pub const HEAD_OF_QUEUE_TAG: u8 = 0x21;
pub const ORDERED_QUEUE_TAG: u8 = 0x22;
pub const IDENTIFY_BASE: u8 = 0x80;

pub fn identify(can_disconnect: bool, lun: u8) -> u8 {
    IDENTIFY_BASE | if can_disconnect { 0x40 } else { 0 } | (lun & 7)
}

// Status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x01;
pub const CONDITION_GOOD: u8 = 0x02;
pub const BUSY: u8 = 0x04;
pub const INTERMEDIATE_GOOD: u8 = 0x08;
pub const INTERMEDIATE_C_GOOD: u8 = 0x0a;
pub const RESERVATION_CONFLICT: u8 = 0x0c;
pub const STATUS_MASK: u8 = 0x1e;

// Host byte codes.
pub const DID_OK: u32 = 0x00;
pub const DID_NO_CONNECT: u32 = 0x01;
pub const DID_BUS_BUSY: u32 = 0x02;
pub const DID_TIME_OUT: u32 = 0x03;
pub const DID_BAD_TARGET: u32 = 0x04;
pub const DID_ABORT: u32 = 0x05;
pub const DID_PARITY: u32 = 0x06;
pub const DID_ERROR: u32 = 0x07;
pub const DID_RESET: u32 = 0x08;
pub const DID_BAD_INTR: u32 = 0x09;

// Driver byte codes and suggestions.
pub const DRIVER_OK: u32 = 0x00;
pub const DRIVER_SOFT: u32 = 0x02;
pub const DRIVER_ERROR: u32 = 0x04;
pub const DRIVER_INVALID: u32 = 0x05;
pub const DRIVER_TIMEOUT: u32 = 0x06;
pub const DRIVER_HARD: u32 = 0x07;
pub const DRIVER_SENSE: u32 = 0x08;
pub const SUGGEST_RETRY: u32 = 0x10;
pub const SUGGEST_ABORT: u32 = 0x20;
pub const SUGGEST_REMAP: u32 = 0x30;
pub const SUGGEST_DIE: u32 = 0x40;
pub const SUGGEST_SENSE: u32 = 0x80;
pub const SUGGEST_IS_OK: u32 = 0xff;

// Sense keys.
pub const NO_SENSE: u8 = 0x00;
pub const RECOVERED_ERROR: u8 = 0x01;
pub const NOT_READY: u8 = 0x02;
pub const MEDIUM_ERROR: u8 = 0x03;
pub const HARDWARE_ERROR: u8 = 0x04;
pub const ILLEGAL_REQUEST: u8 = 0x05;
pub const UNIT_ATTENTION: u8 = 0x06;
pub const DATA_PROTECT: u8 = 0x07;
pub const BLANK_CHECK: u8 = 0x08;
pub const ABORTED_COMMAND: u8 = 0x0b;
pub const VOLUME_OVERFLOW: u8 = 0x0d;

// Result-word accessors: status | message << 8 | host << 16 |
// driver << 24.
pub fn status_byte(result: u32) -> u8 {
    ((result & 0xff) as u8) & STATUS_MASK
}

pub fn msg_byte(result: u32) -> u8 {
    ((result >> 8) & 0xff) as u8
}

pub fn host_byte(result: u32) -> u32 {
    (result >> 16) & 0xff
}

pub fn driver_byte(result: u32) -> u32 {
    (result >> 24) & 0xff
}

pub fn make_result(status: u8, msg: u8, host: u32, driver: u32) -> u32 {
    u32::from(status) | (u32::from(msg) << 8) | (host << 16) | (driver << 24)
}

// Command flags.
pub const WAS_RESET: u32 = 0x01;
pub const WAS_TIMEDOUT: u32 = 0x02;
pub const WAS_SENSE: u32 = 0x04;
pub const IS_RESETTING: u32 = 0x08;
pub const ASKED_FOR_SENSE: u32 = 0x10;
pub const NEEDS_JUMPSTART: u32 = 0x20;

// Internal timeout state bits.
pub const NORMAL_TIMEOUT: u32 = 0;
pub const IN_ABORT: u32 = 1;
pub const IN_RESET: u32 = 2;

/// Timeouts, in ticks.
pub const SCSI_TIMEOUT: u64 = 100;
pub const SENSE_TIMEOUT: u64 = 50;
pub const ABORT_TIMEOUT: u64 = 50;
pub const RESET_TIMEOUT: u64 = 50;
pub const MIN_RESET_DELAY: u64 = 100;

pub const SENSE_BUFFER_SIZE: usize = 16;
pub const MAX_COMMAND_SIZE: usize = 12;

static GENERIC_SENSE: [u8; 6] = [REQUEST_SENSE, 0, 0, 0, SENSE_BUFFER_SIZE as u8, 0];

/// One segment of a data transfer: a caller buffer with its simulated
/// physical address, optionally shadowed by a pool bounce fragment.
pub struct DataSeg {
    pub address: u64,
    pub data: Vec<u8>,
    pub bounce: Option<DmaHandle>,
}

impl DataSeg {
    pub fn new(address: u64, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            bounce: None,
        }
    }
}

/// The command's data buffer: nothing, a single region, or a
/// scatter/gather list.
pub enum ScsiData {
    None,
    Single(DataSeg),
    Sg(Vec<DataSeg>),
}

impl ScsiData {
    pub fn segments(&mut self) -> &mut [DataSeg] {
        match self {
            ScsiData::None => &mut [],
            ScsiData::Single(seg) => core::slice::from_mut(seg),
            ScsiData::Sg(v) => v.as_mut_slice(),
        }
    }

    pub fn total_len(&self) -> usize {
        match self {
            ScsiData::None => 0,
            ScsiData::Single(seg) => seg.data.len(),
            ScsiData::Sg(v) => v.iter().map(|s| s.data.len()).sum(),
        }
    }
}

/// Whether a command moves data toward the target.
pub fn data_out_command(opcode: u8) -> bool {
    matches!(
        opcode,
        WRITE_6 | WRITE_10 | MODE_SELECT | WRITE_FILEMARKS | 0x2e /* WRITE VERIFY */
    )
}

/// Slot lifecycle: preallocated commands are reused by flipping the
/// busy marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Done,
}

pub type ScsiDone = Box<dyn FnOnce(&Kernel, &Arc<ScsiCmd>) + Send>;

pub struct CmdState {
    pub slot: SlotState,
    /// Active CDB, possibly rewritten for sense or retry.
    pub cmnd: [u8; MAX_COMMAND_SIZE],
    pub cmd_len: usize,
    /// Snapshot taken at submission, restored on retries.
    pub data_cmnd: [u8; MAX_COMMAND_SIZE],
    pub data_cmd_len: usize,
    pub data: ScsiData,
    pub sense_buffer: [u8; SENSE_BUFFER_SIZE],
    pub result: u32,
    pub flags: u32,
    pub retries: u32,
    pub allowed: u32,
    pub timeout_per_command: u64,
    /// Absolute tick deadline; None disables the timer.
    pub timeout_at: Option<u64>,
    pub internal_timeout: u32,
    pub tag: u8,
    pub done: Option<ScsiDone>,
    /// When the sense machinery borrows the command, data transfers
    /// target the sense buffer instead of `data`.
    pub sense_in_progress: bool,
    /// Follow-on command for linked CDBs.
    pub next_link: Option<Arc<ScsiCmd>>,
}

pub struct ScsiCmd {
    pub host: usize,
    pub dev: usize,
    pub target: u8,
    pub lun: u8,
    pub state: Mutex<CmdState>,
}

impl ScsiCmd {
    pub fn new(host: usize, dev: usize, target: u8, lun: u8) -> Self {
        Self {
            host,
            dev,
            target,
            lun,
            state: Mutex::new(CmdState {
                slot: SlotState::Idle,
                cmnd: [0; MAX_COMMAND_SIZE],
                cmd_len: 0,
                data_cmnd: [0; MAX_COMMAND_SIZE],
                data_cmd_len: 0,
                data: ScsiData::None,
                sense_buffer: [0; SENSE_BUFFER_SIZE],
                result: 0,
                flags: 0,
                retries: 0,
                allowed: 0,
                timeout_per_command: 0,
                timeout_at: None,
                internal_timeout: 0,
                tag: 0,
                done: None,
                sense_in_progress: false,
                next_link: None,
            }),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.state.lock().cmnd[0]
    }

    /// Flatten the outgoing payload, reading through bounce fragments
    /// where present.
    pub fn outgoing_bytes(&self, pool: &DmaPool) -> Vec<u8> {
        let mut st = self.state.lock();
        let mut out = Vec::new();
        for seg in st.data.segments() {
            match seg.bounce {
                Some(h) => {
                    let mut tmp = alloc::vec![0u8; seg.data.len()];
                    pool.read_bytes(h, &mut tmp);
                    out.extend_from_slice(&tmp);
                }
                None => out.extend_from_slice(&seg.data),
            }
        }
        out
    }

    /// Scatter an incoming payload into the data buffer (or, while a
    /// REQUEST SENSE is in flight, into the sense buffer).
    pub fn incoming_bytes(&self, pool: &DmaPool, bytes: &[u8]) {
        let mut st = self.state.lock();
        if st.sense_in_progress {
            let n = bytes.len().min(SENSE_BUFFER_SIZE);
            st.sense_buffer[..n].copy_from_slice(&bytes[..n]);
            return;
        }
        let mut at = 0;
        for seg in st.data.segments() {
            if at >= bytes.len() {
                break;
            }
            let n = seg.data.len().min(bytes.len() - at);
            match seg.bounce {
                Some(h) => pool.write_bytes(h, &bytes[at..at + n]),
                None => seg.data[..n].copy_from_slice(&bytes[at..at + n]),
            }
            at += n;
        }
    }
}

/// The mid-layer state: host list, device table, bounce pool, and the
/// character-client state (sg, tape).
pub struct ScsiCore {
    pub hosts: Mutex<Vec<Arc<ScsiHost>>>,
    pub devices: Mutex<Vec<Arc<ScsiDevice>>>,
    pub pool: DmaPool,
    pub sg: sg::SgState,
    pub tapes: tape::TapeState,
}

impl ScsiCore {
    pub fn new() -> Self {
        Self {
            hosts: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            pool: DmaPool::new(),
            sg: sg::SgState::new(),
            tapes: tape::TapeState::new(),
        }
    }

    pub fn host(&self, host_no: usize) -> Option<Arc<ScsiHost>> {
        self.hosts.lock().get(host_no).cloned()
    }

    pub fn device(&self, index: usize) -> Option<Arc<ScsiDevice>> {
        self.devices.lock().get(index).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Default for ScsiCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a host adapter; returns its host number.
pub fn scsi_register_host(k: &Kernel, driver: Arc<dyn HostDriver>) -> usize {
    let mut hosts = k.scsi.hosts.lock();
    let host_no = hosts.len();
    hosts.push(Arc::new(ScsiHost::new(host_no, driver)));
    kinfo!("scsi{} : registered", host_no);
    host_no
}

fn cmd_wait_spin(k: &Kernel, flag: &Arc<ScsiCmd>) -> bool {
    // Bounded pump: completions arrive from bottom halves and driver
    // callbacks.
    for _ in 0..100_000 {
        if flag.state.lock().slot == SlotState::Done {
            return true;
        }
        k.run_bottom_halves();
        let now = k.platform.ticks();
        scsi_tick(k, now);
        core::hint::spin_loop();
    }
    false
}

/// Submit and wait for completion; used by scan, ioctl, and the
/// character clients.
pub fn scsi_cmd_wait(
    k: &Kernel,
    cmd: &Arc<ScsiCmd>,
    cdb: &[u8],
    data: ScsiData,
    timeout: u64,
    retries: u32,
) -> u32 {
    scsi_do_cmd(
        k,
        cmd,
        cdb,
        data,
        Box::new(|_k: &Kernel, c: &Arc<ScsiCmd>| {
            c.state.lock().slot = SlotState::Done;
        }),
        timeout,
        retries,
    );
    if !cmd_wait_spin(k, cmd) {
        kerror!(
            "scsi{} : command {:02x} never completed",
            cmd.host,
            cmd.opcode()
        );
    }
    cmd.state.lock().result
}

/// Find an idle preallocated command slot for the device, optionally
/// sleeping until one frees up.
pub fn allocate_device(k: &Kernel, dev_index: usize, wait: bool) -> Result<Arc<ScsiCmd>> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let host = k.scsi.host(dev.host).ok_or(Errno::ENODEV)?;
    loop {
        {
            let cmds = host.cmds.lock();
            for cmd in cmds.iter() {
                if cmd.target == dev.id && cmd.lun == dev.lun {
                    let mut st = cmd.state.lock();
                    if st.slot == SlotState::Idle {
                        st.slot = SlotState::Busy;
                        return Ok(cmd.clone());
                    }
                }
            }
        }
        if !wait {
            return Err(Errno::EAGAIN);
        }
        k.sched.interruptible_sleep_on(&dev.device_wait)?;
    }
}

/// Return a slot to the pool and wake waiters.
pub fn release_cmd(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    cmd.state.lock().slot = SlotState::Idle;
    if let Some(dev) = k.scsi.device(cmd.dev) {
        k.sched.wake_up(&dev.device_wait);
    }
}

/// Arm the bounce machinery for segments the adapter cannot reach.
fn setup_bounce(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    let Some(host) = k.scsi.host(cmd.host) else {
        return;
    };
    if !host.driver.unchecked_isa_dma() {
        return;
    }
    let opcode;
    let mut shortfall = false;
    {
        let mut st = cmd.state.lock();
        opcode = st.cmnd[0];
        let pool = &k.scsi.pool;
        for seg in st.data.segments() {
            if seg.address <= ISA_DMA_THRESHOLD || seg.bounce.is_some() {
                continue;
            }
            let rounded = (seg.data.len() + 511) & !511;
            if rounded > 4096 || pool.free_sectors() < rounded / 512 + dma::DMA_HEADROOM_SECTORS
            {
                shortfall = true;
                continue;
            }
            match pool.alloc(rounded) {
                Some(h) => {
                    if data_out_command(opcode) {
                        pool.write_bytes(h, &seg.data);
                    }
                    seg.bounce = Some(h);
                }
                None => shortfall = true,
            }
        }
    }
    if shortfall {
        // The whole list could not be shadowed; collapse to a single
        // region so one fragment can cover the transfer.
        let mut st = cmd.state.lock();
        let data = core::mem::replace(&mut st.data, ScsiData::None);
        st.data = match data {
            ScsiData::Sg(mut segs) => {
                let mut flat = Vec::new();
                for seg in segs.iter_mut() {
                    if let Some(h) = seg.bounce.take() {
                        k.scsi.pool.free(h);
                    }
                    flat.extend_from_slice(&seg.data);
                }
                let mut single = DataSeg::new(ISA_DMA_THRESHOLD + 1, flat);
                let rounded = (single.data.len() + 511) & !511;
                if rounded > 0 && rounded <= 4096 {
                    if let Some(h) = k.scsi.pool.alloc(rounded) {
                        if data_out_command(opcode) {
                            k.scsi.pool.write_bytes(h, &single.data);
                        }
                        single.bounce = Some(h);
                    }
                }
                ScsiData::Single(single)
            }
            other => other,
        };
    }
}

/// Copy read-direction bounce fragments back and release them.
fn teardown_bounce(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    let mut st = cmd.state.lock();
    let opcode = st.data_cmnd[0];
    let write = data_out_command(opcode);
    let pool = &k.scsi.pool;
    for seg in st.data.segments() {
        if let Some(h) = seg.bounce.take() {
            if !write {
                let mut tmp = alloc::vec![0u8; seg.data.len()];
                pool.read_bytes(h, &mut tmp);
                seg.data.copy_from_slice(&tmp);
            }
            pool.free(h);
        }
    }
}

/// Hand a command to the low-level driver, stalling while the bus
/// settles after a reset.
pub fn internal_cmnd(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    let Some(host) = k.scsi.host(cmd.host) else {
        return;
    };
    // Honor the post-reset settle window.
    let settle_until = host.last_reset.load(Ordering::Acquire) + MIN_RESET_DELAY;
    while k.platform.ticks() < settle_until {
        core::hint::spin_loop();
    }

    let per_command = cmd.state.lock().timeout_per_command;
    update_timeout(k, cmd, per_command);
    setup_bounce(k, cmd);

    if host.driver.can_queue() > 0 {
        if host.driver.queuecommand(k, cmd).is_err() {
            cmd.state.lock().result = DID_NO_CONNECT << 16;
            scsi_done(k, cmd);
        }
    } else {
        let result = host.driver.command(k, cmd);
        cmd.state.lock().result = result;
        scsi_done(k, cmd);
    }
}

/// Build and issue REQUEST SENSE reusing the command descriptor; the
/// sense data replaces the original transfer until completion.
pub fn scsi_request_sense(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    {
        let mut st = cmd.state.lock();
        st.flags |= WAS_SENSE | ASKED_FOR_SENSE;
        st.cmnd = [0; MAX_COMMAND_SIZE];
        st.cmnd[..GENERIC_SENSE.len()].copy_from_slice(&GENERIC_SENSE);
        st.cmnd[1] = cmd.lun << 5;
        st.cmd_len = 6;
        st.sense_in_progress = true;
    }
    update_timeout(k, cmd, SENSE_TIMEOUT);
    internal_cmnd(k, cmd);
}

/// Submit a command. The CDB and buffer are snapshotted so retries can
/// restore them; the done callback fires exactly once, at final
/// completion.
pub fn scsi_do_cmd(
    k: &Kernel,
    cmd: &Arc<ScsiCmd>,
    cdb: &[u8],
    data: ScsiData,
    done: ScsiDone,
    timeout: u64,
    retries: u32,
) {
    let Some(host) = k.scsi.host(cmd.host) else {
        return;
    };
    // Keep within the adapter's outstanding-command budget.
    loop {
        let can_queue = host.driver.can_queue();
        if can_queue == 0 || host.host_busy.load(Ordering::Acquire) < can_queue {
            host.host_busy.fetch_add(1, Ordering::AcqRel);
            break;
        }
        k.sched.sleep_on(&host.host_wait);
    }
    {
        let mut st = cmd.state.lock();
        st.slot = SlotState::Busy;
        st.cmnd = [0; MAX_COMMAND_SIZE];
        st.cmnd[..cdb.len()].copy_from_slice(cdb);
        st.cmd_len = cdb.len();
        st.data_cmnd = st.cmnd;
        st.data_cmd_len = cdb.len();
        st.data = data;
        // Zero the sense buffer; 0 is not a valid sense code.
        st.sense_buffer = [0; SENSE_BUFFER_SIZE];
        st.result = 0;
        st.flags = 0;
        st.retries = 0;
        st.allowed = retries;
        st.timeout_per_command = timeout;
        st.internal_timeout = 0;
        st.tag = 0;
        st.done = Some(done);
        st.sense_in_progress = false;
    }
    internal_cmnd(k, cmd);
}

/// Force a bus reset, then jump-start the triggering command with a
/// sense request if the adapter needs it.
fn reset_and_jumpstart(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    cmd.state.lock().flags |= WAS_RESET | IS_RESETTING;
    scsi_reset(k, cmd);
    let needs = {
        let mut st = cmd.state.lock();
        let needs = st.flags & NEEDS_JUMPSTART != 0;
        st.flags &= !NEEDS_JUMPSTART;
        needs
    };
    if needs {
        scsi_request_sense(k, cmd);
    }
}

/// Classify the sense buffer into a retry suggestion.
fn check_sense(k: &Kernel, cmd: &Arc<ScsiCmd>) -> u32 {
    let mut st = cmd.state.lock();
    // No sense present: ask for it, unless we already did and the
    // firmware is just confused.
    if (st.sense_buffer[0] & 0x70) >> 4 != 7 {
        if st.flags & ASKED_FOR_SENSE == 0 {
            return SUGGEST_SENSE;
        }
        return SUGGEST_RETRY;
    }
    st.flags &= !ASKED_FOR_SENSE;
    if st.sense_buffer[2] & 0xe0 != 0 {
        return SUGGEST_ABORT;
    }
    let key = st.sense_buffer[2] & 0x0f;
    drop(st);
    match key {
        NO_SENSE => 0,
        RECOVERED_ERROR => {
            // Tapes report recovered errors in ordinary operation.
            let is_tape = k
                .scsi
                .device(cmd.dev)
                .map(|d| d.type_code() == device::TYPE_TAPE)
                .unwrap_or(false);
            if is_tape {
                SUGGEST_IS_OK
            } else {
                0
            }
        }
        ABORTED_COMMAND => SUGGEST_RETRY,
        UNIT_ATTENTION => {
            // On removable media this is a media change: latch it and
            // let the retry machinery finish the transfer.
            if let Some(dev) = k.scsi.device(cmd.dev) {
                if dev.removable.load(Ordering::Acquire) {
                    dev.changed.store(true, Ordering::Release);
                    return SUGGEST_RETRY;
                }
            }
            SUGGEST_ABORT
        }
        NOT_READY => SUGGEST_ABORT,
        MEDIUM_ERROR => SUGGEST_REMAP,
        _ => SUGGEST_ABORT,
    }
}

#[derive(PartialEq)]
enum DoneAction {
    Finished,
    MayRedo,
    Redo,
    Pending,
}

/// The mid-level completion routine. Exactly one of: finish the
/// command, requeue it, request sense, or reset the bus.
pub fn scsi_done(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    let result = cmd.state.lock().result;
    let oldto = update_timeout(k, cmd, 0);
    let mut action = DoneAction::Finished;
    let mut exit: u32 = 0;

    let host_code = host_byte(result);
    match host_code {
        DID_OK => {
            let flags = cmd.state.lock().flags;
            if flags & IS_RESETTING != 0 {
                cmd.state.lock().flags &= !IS_RESETTING;
                action = DoneAction::Redo;
            } else if status_byte(result) != GOOD && flags & WAS_SENSE != 0 {
                // The sense request itself failed.
                cmd.state.lock().flags &= !WAS_SENSE;
                if flags & WAS_RESET == 0 {
                    kwarn!(
                        "scsi{} : target {} lun {} request sense failed, performing reset",
                        cmd.host,
                        cmd.target,
                        cmd.lun
                    );
                    reset_and_jumpstart(k, cmd);
                    return;
                }
                exit = DRIVER_HARD | SUGGEST_ABORT;
                action = DoneAction::Finished;
            } else {
                match msg_byte(result) {
                    COMMAND_COMPLETE => match status_byte(result) {
                        GOOD => {
                            if flags & WAS_SENSE != 0 {
                                cmd.state.lock().flags &= !WAS_SENSE;
                                match check_sense(k, cmd) {
                                    0 | SUGGEST_SENSE => {
                                        update_timeout(k, cmd, oldto);
                                        action = DoneAction::Redo;
                                    }
                                    SUGGEST_IS_OK => {}
                                    SUGGEST_REMAP | SUGGEST_RETRY => {
                                        action = DoneAction::MayRedo;
                                        exit = DRIVER_SENSE | SUGGEST_RETRY;
                                    }
                                    SUGGEST_ABORT => {
                                        action = DoneAction::Finished;
                                        exit = DRIVER_SENSE | SUGGEST_ABORT;
                                    }
                                    _ => kerror!("scsi: bad sense suggestion"),
                                }
                            } else {
                                exit = DRIVER_OK;
                            }
                        }
                        CHECK_CONDITION => match check_sense(k, cmd) {
                            0 => {
                                update_timeout(k, cmd, oldto);
                                action = DoneAction::Redo;
                            }
                            SUGGEST_REMAP | SUGGEST_RETRY => {
                                action = DoneAction::MayRedo;
                                exit = DRIVER_SENSE | SUGGEST_RETRY;
                            }
                            SUGGEST_ABORT => {
                                action = DoneAction::Finished;
                                exit = DRIVER_SENSE | SUGGEST_ABORT;
                            }
                            SUGGEST_SENSE => {
                                scsi_request_sense(k, cmd);
                                action = DoneAction::Pending;
                            }
                            _ => {}
                        },
                        CONDITION_GOOD | INTERMEDIATE_GOOD | INTERMEDIATE_C_GOOD => {}
                        BUSY => {
                            update_timeout(k, cmd, oldto);
                            action = DoneAction::Redo;
                        }
                        RESERVATION_CONFLICT => {
                            kwarn!(
                                "scsi{} : reservation conflict, performing reset",
                                cmd.host
                            );
                            reset_and_jumpstart(k, cmd);
                            return;
                        }
                        other => {
                            kerror!("scsi: unexpected status byte {:#x}", other);
                        }
                    },
                    other => {
                        kerror!("scsi: unsupported message byte {} received", other);
                        exit = DRIVER_ERROR | SUGGEST_DIE;
                    }
                }
            }
        }
        DID_TIME_OUT => {
            let was = cmd.state.lock().flags & WAS_TIMEDOUT != 0;
            if was {
                exit = DRIVER_TIMEOUT | SUGGEST_ABORT;
            } else {
                cmd.state.lock().flags |= WAS_TIMEDOUT;
                action = DoneAction::Redo;
            }
        }
        DID_BUS_BUSY | DID_PARITY => action = DoneAction::Redo,
        DID_NO_CONNECT => exit = DRIVER_HARD | SUGGEST_ABORT,
        DID_ERROR => {
            action = DoneAction::MayRedo;
            exit = DRIVER_HARD | SUGGEST_ABORT;
        }
        DID_BAD_TARGET | DID_ABORT => exit = DRIVER_INVALID | SUGGEST_ABORT,
        DID_RESET => {
            if msg_byte(result) == GOOD && status_byte(result) == CHECK_CONDITION {
                match check_sense(k, cmd) {
                    0 => {
                        update_timeout(k, cmd, oldto);
                        action = DoneAction::Redo;
                    }
                    SUGGEST_REMAP | SUGGEST_RETRY => {
                        action = DoneAction::MayRedo;
                        exit = DRIVER_SENSE | SUGGEST_RETRY;
                    }
                    SUGGEST_ABORT => {
                        action = DoneAction::Finished;
                        exit = DRIVER_SENSE | SUGGEST_ABORT;
                    }
                    SUGGEST_SENSE => {
                        scsi_request_sense(k, cmd);
                        action = DoneAction::Pending;
                    }
                    _ => {}
                }
            } else {
                action = DoneAction::Redo;
                exit = SUGGEST_RETRY;
            }
        }
        _ => exit = DRIVER_ERROR | SUGGEST_DIE,
    }

    if action == DoneAction::MayRedo {
        let (retries, allowed, was_reset) = {
            let mut st = cmd.state.lock();
            st.retries += 1;
            (st.retries, st.allowed, st.flags & WAS_RESET != 0)
        };
        if retries < allowed {
            if retries >= allowed >> 1 && !was_reset {
                kwarn!("scsi{} : resetting for second half of retries", cmd.host);
                reset_and_jumpstart(k, cmd);
                return;
            }
            action = DoneAction::Redo;
        } else {
            action = DoneAction::Finished;
        }
    }

    match action {
        DoneAction::Finished => {
            if let Some(host) = k.scsi.host(cmd.host) {
                host.host_busy.fetch_sub(1, Ordering::AcqRel);
                k.sched.wake_up(&host.host_wait);
            }
            teardown_bounce(k, cmd);
            let done = {
                let mut st = cmd.state.lock();
                st.result = result | ((exit & 0xff) << 24);
                st.sense_in_progress = false;
                st.done.take()
            };
            if let Some(done) = done {
                done(k, cmd);
            } else {
                kwarn!("scsi{} : completion with no done function", cmd.host);
            }
        }
        DoneAction::Pending => {}
        DoneAction::Redo => {
            let was_sense = cmd.state.lock().flags & WAS_SENSE != 0;
            if was_sense {
                scsi_request_sense(k, cmd);
            } else {
                // Restore the submission snapshot before reissuing.
                {
                    let mut st = cmd.state.lock();
                    st.cmnd = st.data_cmnd;
                    st.cmd_len = st.data_cmd_len;
                    st.result = 0;
                    st.sense_in_progress = false;
                }
                internal_cmnd(k, cmd);
            }
        }
        DoneAction::MayRedo => unreachable!(),
    }
}

/// Abort through the host driver, guarding against reentry via the
/// internal-timeout bits. Returns true when the abort took.
pub fn scsi_abort(k: &Kernel, cmd: &Arc<ScsiCmd>, why: u32) -> bool {
    let Some(host) = k.scsi.host(cmd.host) else {
        return false;
    };
    loop {
        let reentered = {
            let mut st = cmd.state.lock();
            if st.internal_timeout & IN_ABORT != 0 {
                true
            } else {
                st.internal_timeout |= IN_ABORT;
                false
            }
        };
        if reentered {
            core::hint::spin_loop();
            continue;
        }
        let oldto = update_timeout(k, cmd, ABORT_TIMEOUT);
        let ok = host.host_busy.load(Ordering::Acquire) == 0
            || host.driver.abort(k, cmd, why);
        {
            let mut st = cmd.state.lock();
            st.internal_timeout &= !IN_ABORT;
        }
        update_timeout(k, cmd, oldto);
        return ok;
    }
}

/// Reset the bus. Outstanding commands on the host are aborted with
/// DID_RESET; the last-reset stamp makes later submissions stall for
/// the settle delay.
pub fn scsi_reset(k: &Kernel, cmd: &Arc<ScsiCmd>) -> bool {
    let Some(host) = k.scsi.host(cmd.host) else {
        return false;
    };
    loop {
        let reentered = {
            let mut st = cmd.state.lock();
            if st.internal_timeout & IN_RESET != 0 {
                true
            } else {
                st.internal_timeout |= IN_RESET;
                false
            }
        };
        if reentered {
            core::hint::spin_loop();
            continue;
        }
        let oldto = update_timeout(k, cmd, RESET_TIMEOUT);
        let ok;
        if host.host_busy.load(Ordering::Acquire) > 0 {
            let others: Vec<Arc<ScsiCmd>> = host
                .cmds
                .lock()
                .iter()
                .filter(|c| !Arc::ptr_eq(c, cmd))
                .cloned()
                .collect();
            for other in others {
                let busy = {
                    let st = other.state.lock();
                    st.slot == SlotState::Busy
                        && st.flags & IS_RESETTING == 0
                        && st.internal_timeout & IN_ABORT == 0
                };
                if busy {
                    scsi_abort(k, &other, DID_RESET);
                }
            }
            ok = host.driver.reset(k, cmd);
        } else {
            host.host_busy.fetch_add(1, Ordering::AcqRel);
            ok = host.driver.reset(k, cmd);
            host.last_reset.store(k.platform.ticks(), Ordering::Release);
            host.host_busy.fetch_sub(1, Ordering::AcqRel);
        }
        {
            let mut st = cmd.state.lock();
            st.internal_timeout &= !IN_RESET;
        }
        update_timeout(k, cmd, oldto);
        return ok;
    }
}

/// Escalation on expiry: abort, then reset, then give up loudly.
pub fn scsi_times_out(k: &Kernel, cmd: &Arc<ScsiCmd>) {
    let stage = cmd.state.lock().internal_timeout & (IN_ABORT | IN_RESET);
    match stage {
        NORMAL_TIMEOUT => {
            kwarn!("scsi{} : timed out - aborting command", cmd.host);
            if !scsi_abort(k, cmd, DID_TIME_OUT) {
                kwarn!("scsi{} : abort() timed out - resetting", cmd.host);
                if !scsi_reset(k, cmd) {
                    kerror!("scsi{} : unable to reset host", cmd.host);
                }
            }
        }
        _ => {
            kwarn!("scsi{} : abort() timed out - resetting", cmd.host);
            if !scsi_reset(k, cmd) {
                kerror!("scsi{} : unable to reset host", cmd.host);
            }
        }
    }
}

/// Rewrite a command's deadline; returns the ticks that were left.
pub fn update_timeout(k: &Kernel, cmd: &Arc<ScsiCmd>, timeout: u64) -> u64 {
    let now = k.platform.ticks();
    let mut st = cmd.state.lock();
    let oldto = st
        .timeout_at
        .map(|at| at.saturating_sub(now))
        .unwrap_or(0);
    st.timeout_at = if timeout > 0 { Some(now + timeout) } else { None };
    oldto
}

/// The SCSI timer: fire every expired command.
pub fn scsi_tick(k: &Kernel, now: u64) {
    loop {
        let mut fired = false;
        let expired: Vec<Arc<ScsiCmd>> = {
            let hosts = k.scsi.hosts.lock();
            let mut v = Vec::new();
            for host in hosts.iter() {
                for cmd in host.cmds.lock().iter() {
                    let mut st = cmd.state.lock();
                    if let Some(at) = st.timeout_at {
                        if at <= now {
                            st.timeout_at = None;
                            v.push(cmd.clone());
                        }
                    }
                }
            }
            v
        };
        for cmd in expired {
            fired = true;
            scsi_times_out(k, &cmd);
        }
        if !fired {
            break;
        }
    }
}

/// SCSI bottom half: let every adapter run its deferred work.
pub fn scsi_bh(k: &Kernel) {
    let hosts: Vec<Arc<ScsiHost>> = k.scsi.hosts.lock().clone();
    for host in hosts {
        host.driver.bh(k);
    }
}

/// Scan every host's bus for targets, populate the device table, and
/// preallocate command slots and the bounce pool.
pub fn scan_scsis(k: &Kernel) {
    let hosts: Vec<Arc<ScsiHost>> = k.scsi.hosts.lock().clone();
    for host in hosts.iter() {
        let this_id = host.driver.this_id();
        for id in 0..8u8 {
            if id == this_id {
                continue;
            }
            for lun in 0..8u8 {
                let index = k.scsi.device_count();
                let scan_cmd = Arc::new(ScsiCmd::new(host.host_no, index, id, lun));
                host.cmds.lock().push(scan_cmd.clone());
                // Provisional record so sense classification can see
                // the device type.
                k.scsi
                    .devices
                    .lock()
                    .push(Arc::new(ScsiDevice::new(index, host.host_no, id, lun)));

                let tur = [TEST_UNIT_READY, lun << 5, 0, 0, 0, 0];
                let result = scsi_cmd_wait(
                    k,
                    &scan_cmd,
                    &tur,
                    ScsiData::None,
                    SCSI_TIMEOUT + 400,
                    5,
                );
                // A unit that answers NOT READY or UNIT ATTENTION is
                // still present; other sense means an empty address,
                // and a senseless failure ends the lun walk.
                let (present, next_lun) = if result == 0 {
                    (true, false)
                } else {
                    let st = scan_cmd.state.lock();
                    let sense_valid = driver_byte(result) & DRIVER_SENSE != 0
                        && (st.sense_buffer[0] & 0x70) >> 4 == 7;
                    if sense_valid {
                        let key = st.sense_buffer[2];
                        let here = key & 0xe0 == 0
                            && matches!(key & 0x0f, NOT_READY | UNIT_ATTENTION);
                        (here, !here)
                    } else {
                        (false, false)
                    }
                };
                if !present {
                    remove_scan_entry(k, host, &scan_cmd, index);
                    if next_lun {
                        continue;
                    }
                    break;
                }

                let inq = [INQUIRY, (lun << 5) & 0xe0, 0, 0, 255, 0];
                let inq_data = ScsiData::Single(DataSeg::new(0, alloc::vec![0u8; 256]));
                let result =
                    scsi_cmd_wait(k, &scan_cmd, &inq, inq_data, SCSI_TIMEOUT, 3);
                if result != 0 {
                    remove_scan_entry(k, host, &scan_cmd, index);
                    break;
                }
                let response = {
                    let mut st = scan_cmd.state.lock();
                    let bytes = match &mut st.data {
                        ScsiData::Single(seg) => seg.data.clone(),
                        _ => Vec::new(),
                    };
                    bytes
                };
                remove_scan_entry(k, host, &scan_cmd, index);
                let stop = attach_device(k, host, id, lun, &response);
                if stop {
                    break;
                }
            }
        }
    }
    finish_scan(k);
}

fn remove_scan_entry(k: &Kernel, host: &Arc<ScsiHost>, scan_cmd: &Arc<ScsiCmd>, index: usize) {
    let mut cmds = host.cmds.lock();
    if let Some(pos) = cmds.iter().position(|c| Arc::ptr_eq(c, scan_cmd)) {
        cmds.swap_remove(pos);
    }
    let mut devices = k.scsi.devices.lock();
    if devices.len() == index + 1 && devices[index].type_code() == device::TYPE_NONE {
        devices.pop();
    }
}

/// Record a responding unit; returns true when further luns on this
/// target must not be probed.
fn attach_device(k: &Kernel, host: &Arc<ScsiHost>, id: u8, lun: u8, inq: &[u8]) -> bool {
    let typ = match i32::from(inq[0] & 0x1f) {
        t @ (device::TYPE_DISK | device::TYPE_TAPE | device::TYPE_MOD) => t,
        t @ (device::TYPE_WORM | device::TYPE_ROM) => t,
        _ => device::TYPE_NONE,
    };
    if typ == device::TYPE_NONE {
        return false;
    }
    let index = k.scsi.device_count();
    let dev = Arc::new(ScsiDevice::new(index, host.host_no, id, lun));
    dev.typ.store(typ, Ordering::Release);
    dev.removable.store(inq[1] & 0x80 != 0, Ordering::Release);
    dev.lockable.store(inq[1] & 0x80 != 0, Ordering::Release);
    dev.writeable.store(
        matches!(typ, device::TYPE_DISK | device::TYPE_TAPE | device::TYPE_MOD),
        Ordering::Release,
    );
    dev.random
        .store(typ != device::TYPE_TAPE, Ordering::Release);
    let mut level = inq[2] & 0x07;
    if level >= 2 || (level == 1 && inq[3] & 0x0f == 1) {
        level += 1;
    }
    dev.scsi_level.store(level, Ordering::Release);
    if level >= device::SCSI_2 && inq[7] & 2 != 0 {
        dev.tagged_supported.store(true, Ordering::Release);
        dev.current_tag.store(0, Ordering::Release);
    }
    // Known handshake troublemakers stay marked borken.
    let texel =
        inq.len() >= 22 && &inq[8..13] == b"TEXEL" && &inq[16..22] == b"CD-ROM";
    if !texel {
        dev.borken.store(false, Ordering::Release);
    }
    kinfo!(
        "scsi{} : detected type {} at id {}, lun {}",
        host.host_no,
        typ,
        id,
        lun
    );
    k.scsi.devices.lock().push(dev);

    // Some SCSI-1 peripherals do not handle lun != 0.
    let raw_level = inq[2] & 0x07;
    raw_level == 0 || (raw_level == 1 && inq[3] & 0x0f == 0)
}

/// Preallocate per-device command slots and size the bounce pool.
fn finish_scan(k: &Kernel) {
    let devices: Vec<Arc<ScsiDevice>> = k.scsi.devices.lock().clone();
    let mut dma_sectors = 16usize;
    for dev in devices.iter() {
        let Some(host) = k.scsi.host(dev.host) else {
            continue;
        };
        let per_lun = host.driver.cmd_per_lun().max(1);
        {
            let mut cmds = host.cmds.lock();
            for _ in 0..per_lun {
                cmds.push(Arc::new(ScsiCmd::new(dev.host, dev.index, dev.id, dev.lun)));
            }
        }
        if host.driver.unchecked_isa_dma() && dev.type_code() != device::TYPE_TAPE {
            dma_sectors += 8 * per_lun;
        }
    }
    k.scsi.pool.init(dma_sectors);
    kdebug!(
        "scsi : {} devices, {} dma sectors",
        devices.len(),
        k.scsi.pool.total_sectors()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{mock_kernel, MockHost, ScriptedOutcome};
    use crate::drivers::mock::host::valid_sense;

    fn setup() -> (Arc<crate::Kernel>, Arc<MockHost>) {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        scsi_register_host(&k, host.clone());
        scan_scsis(&k);
        (k, host)
    }

    #[test]
    fn test_scan_finds_one_disk() {
        let (k, host) = setup();
        assert_eq!(k.scsi.device_count(), 1);
        let dev = k.scsi.device(0).unwrap();
        assert_eq!((dev.id, dev.lun), (0, 0));
        assert_eq!(dev.type_code(), device::TYPE_DISK);
        assert_eq!(dev.scsi_level.load(Ordering::Acquire), device::SCSI_2);
        assert!(!dev.borken.load(Ordering::Acquire));
        // Slots were preallocated, cmd_per_lun for the one device.
        let h = k.scsi.host(0).unwrap();
        assert_eq!(h.cmds.lock().len(), host.cmd_per_lun());
        // The pool was sized and is fully free.
        assert!(k.scsi.pool.total_sectors() >= 16);
        assert!(k.scsi.pool.check_invariant());
    }

    #[test]
    fn test_result_word_layout() {
        let r = make_result(CHECK_CONDITION, COMMAND_COMPLETE, DID_OK, DRIVER_SENSE);
        assert_eq!(status_byte(r), CHECK_CONDITION);
        assert_eq!(msg_byte(r), COMMAND_COMPLETE);
        assert_eq!(host_byte(r), DID_OK);
        assert_eq!(driver_byte(r), DRIVER_SENSE);
    }

    #[test]
    fn test_busy_host_retries_until_good() {
        let (k, host) = setup();
        host.push(ScriptedOutcome::host_error(DID_BUS_BUSY));
        host.push(ScriptedOutcome::host_error(DID_BUS_BUSY));
        host.push(ScriptedOutcome::good());
        let cmd = allocate_device(&k, 0, true).unwrap();
        let tur = [TEST_UNIT_READY, 0, 0, 0, 0, 0];
        let result = scsi_cmd_wait(&k, &cmd, &tur, ScsiData::None, SCSI_TIMEOUT, 5);
        release_cmd(&k, &cmd);
        assert_eq!(result, 0);
        let turs = host
            .call_log
            .lock()
            .iter()
            .filter(|(op, _, _)| *op == TEST_UNIT_READY)
            .count();
        assert!(turs >= 3);
    }

    #[test]
    fn test_sense_cascade_marks_media_change() {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new_removable();
        scsi_register_host(&k, host.clone());
        scan_scsis(&k);
        let dev = k.scsi.device(0).unwrap();
        assert!(dev.removable.load(Ordering::Acquire));

        // CHECK CONDITION with no sense data; the core must fetch it.
        host.push(ScriptedOutcome::status(CHECK_CONDITION));
        host.push(ScriptedOutcome::good().with_data(valid_sense(UNIT_ATTENTION, 0x28).to_vec()));

        let cmd = allocate_device(&k, 0, true).unwrap();
        let cdb = [READ_6, 0, 0, 0, 1, 0];
        let data = ScsiData::Single(DataSeg::new(0, alloc::vec![0u8; 512]));
        let result = scsi_cmd_wait(&k, &cmd, &cdb, data, SCSI_TIMEOUT, 5);
        release_cmd(&k, &cmd);

        assert_eq!(host_byte(result), DID_OK);
        assert_eq!(status_byte(result), GOOD);
        assert!(dev.changed.load(Ordering::Acquire));
        // The sense request went out exactly once.
        let senses = host
            .call_log
            .lock()
            .iter()
            .filter(|(op, _, _)| *op == REQUEST_SENSE)
            .count();
        assert_eq!(senses, 1);
        // Subsequent open observes and clears the change.
        assert!(dev.changed.load(Ordering::Acquire));
        disk::sd_open(&k, 0).unwrap();
        assert!(!dev.changed.load(Ordering::Acquire));
    }

    #[test]
    fn test_sense_request_has_no_infinite_loop() {
        let (k, host) = setup();
        // Sense requested, but the sense command itself also fails
        // with a check condition and no data: bounded escalation.
        host.push(ScriptedOutcome::status(CHECK_CONDITION));
        host.push(ScriptedOutcome::status(CHECK_CONDITION));
        let cmd = allocate_device(&k, 0, true).unwrap();
        let tur = [TEST_UNIT_READY, 0, 0, 0, 0, 0];
        let result = scsi_cmd_wait(&k, &cmd, &tur, ScsiData::None, SCSI_TIMEOUT, 2);
        release_cmd(&k, &cmd);
        // It completed one way or another, without hanging.
        assert_ne!(result & 0xffff_0000, u32::MAX);
        assert!(host.resets.load(Ordering::Acquire) >= 1);
    }

    #[test]
    fn test_timeout_escalates_to_abort() {
        let (k, host) = setup();
        let cmd = allocate_device(&k, 0, true).unwrap();
        let h = k.scsi.host(0).unwrap();
        h.host_busy.fetch_add(1, Ordering::AcqRel);
        cmd.state.lock().done = Some(Box::new(|_k, c| {
            c.state.lock().slot = SlotState::Done;
        }));
        update_timeout(&k, &cmd, 5);
        let now = k.platform.ticks() + 100;
        scsi_tick(&k, now);
        // The expiry escalated through abort; the aborted command was
        // retried once (WAS_TIMEDOUT) and then completed.
        assert_eq!(host.aborts.load(Ordering::Acquire), 1);
        let st = cmd.state.lock();
        assert!(st.flags & WAS_TIMEDOUT != 0);
        assert_eq!(st.slot, SlotState::Done);
        drop(st);
        release_cmd(&k, &cmd);
    }

    #[test]
    fn test_retry_midpoint_forces_reset() {
        let (k, host) = setup();
        // Media errors suggest remap -> MAYREDO; half the allowance
        // triggers a bus reset before the next attempt.
        for _ in 0..3 {
            host.push(
                ScriptedOutcome::status(CHECK_CONDITION)
            );
            host.push(ScriptedOutcome::good().with_data(valid_sense(MEDIUM_ERROR, 0).to_vec()));
        }
        let cmd = allocate_device(&k, 0, true).unwrap();
        let cdb = [READ_6, 0, 0, 0, 1, 0];
        let data = ScsiData::Single(DataSeg::new(0, alloc::vec![0u8; 512]));
        let _result = scsi_cmd_wait(&k, &cmd, &cdb, data, SCSI_TIMEOUT, 4);
        release_cmd(&k, &cmd);
        assert!(host.resets.load(Ordering::Acquire) >= 1);
    }

    #[test]
    fn test_bounce_buffering_round_trip() {
        struct IsaEcho {
            seen: spin::Mutex<Vec<u8>>,
            pool_free_during: core::sync::atomic::AtomicUsize,
        }
        impl HostDriver for IsaEcho {
            fn name(&self) -> &'static str {
                "isaecho"
            }
            fn unchecked_isa_dma(&self) -> bool {
                true
            }
            fn cmd_per_lun(&self) -> usize {
                1
            }
            fn command(&self, k: &crate::Kernel, cmd: &Arc<ScsiCmd>) -> u32 {
                let op = cmd.opcode();
                match op {
                    TEST_UNIT_READY => 0,
                    INQUIRY => {
                        let inq = crate::drivers::mock::host::mock_inquiry(false, false, 0);
                        cmd.incoming_bytes(&k.scsi.pool, &inq);
                        0
                    }
                    WRITE_6 => {
                        self.pool_free_during.store(
                            k.scsi.pool.free_sectors(),
                            core::sync::atomic::Ordering::Release,
                        );
                        *self.seen.lock() = cmd.outgoing_bytes(&k.scsi.pool);
                        0
                    }
                    READ_6 => {
                        let len = cmd.state.lock().data.total_len();
                        let pat: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                        cmd.incoming_bytes(&k.scsi.pool, &pat);
                        0
                    }
                    _ => 0,
                }
            }
            fn abort(&self, _k: &crate::Kernel, _cmd: &Arc<ScsiCmd>, _code: u32) -> bool {
                true
            }
            fn reset(&self, _k: &crate::Kernel, _cmd: &Arc<ScsiCmd>) -> bool {
                true
            }
        }

        let (k, _p, _s) = mock_kernel();
        let host = Arc::new(IsaEcho {
            seen: spin::Mutex::new(Vec::new()),
            pool_free_during: core::sync::atomic::AtomicUsize::new(0),
        });
        scsi_register_host(&k, host.clone());
        scan_scsis(&k);
        let total = k.scsi.pool.total_sectors();

        // A write from an unreachable address goes through a pool
        // fragment.
        let payload: Vec<u8> = (0..512u32).map(|i| (i % 199) as u8).collect();
        let cmd = allocate_device(&k, 0, true).unwrap();
        let cdb = [WRITE_6, 0, 0, 0, 1, 0];
        let seg = DataSeg::new(ISA_DMA_THRESHOLD + 4096, payload.clone());
        let result = scsi_cmd_wait(
            &k,
            &cmd,
            &cdb,
            ScsiData::Sg(alloc::vec![seg]),
            SCSI_TIMEOUT,
            3,
        );
        release_cmd(&k, &cmd);
        assert_eq!(result, 0);
        assert_eq!(*host.seen.lock(), payload);
        // The fragment was held during the transfer and released
        // after.
        assert!(host.pool_free_during.load(core::sync::atomic::Ordering::Acquire) < total);
        assert_eq!(k.scsi.pool.free_sectors(), total);

        // Reads copy back through the fragment.
        let cmd = allocate_device(&k, 0, true).unwrap();
        let cdb = [READ_6, 0, 0, 0, 1, 0];
        let seg = DataSeg::new(ISA_DMA_THRESHOLD + 8192, alloc::vec![0u8; 512]);
        let result = scsi_cmd_wait(
            &k,
            &cmd,
            &cdb,
            ScsiData::Sg(alloc::vec![seg]),
            SCSI_TIMEOUT,
            3,
        );
        let got = {
            let mut st = cmd.state.lock();
            match core::mem::replace(&mut st.data, ScsiData::None) {
                ScsiData::Sg(mut v) => v.remove(0).data,
                _ => Vec::new(),
            }
        };
        release_cmd(&k, &cmd);
        assert_eq!(result, 0);
        let expect: Vec<u8> = (0..512usize).map(|i| (i % 251) as u8).collect();
        assert_eq!(got, expect);
        assert_eq!(k.scsi.pool.free_sectors(), total);
    }

    #[test]
    fn test_allocate_device_nonblocking_exhaustion() {
        let (k, _host) = setup();
        let a = allocate_device(&k, 0, false).unwrap();
        let b = allocate_device(&k, 0, false).unwrap();
        assert_eq!(allocate_device(&k, 0, false).err(), Some(crate::Errno::EAGAIN));
        release_cmd(&k, &a);
        release_cmd(&k, &b);
        assert!(allocate_device(&k, 0, false).is_ok());
    }

    #[test]
    fn test_ioctl_surface() {
        let (k, host) = setup();
        let mut id = 0u32;
        ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::GetIdlun(&mut id)).unwrap();
        assert_eq!(id, 0);
        let mut info = Vec::new();
        ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::ProbeHost(&mut info)).unwrap();
        assert_eq!(info, b"mockhost");
        let r = ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::TestUnitReady).unwrap();
        assert_eq!(r, 0);
        // Send an INQUIRY through the pass-through block.
        let mut blk = ioctl::SendCommandBlock {
            inlen: 0,
            outlen: 36,
            cdb: alloc::vec![INQUIRY, 0, 0, 0, 255, 0],
            data: Vec::new(),
        };
        let r = ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::SendCommand(&mut blk)).unwrap();
        assert_eq!(r, 0);
        assert_eq!(blk.data.len(), 36);
        assert_eq!(&blk.data[8..12], b"MOCK");
        let _ = host;
    }

    #[test]
    fn test_tagged_enable_requires_support() {
        let (k, _host) = setup();
        // The default mock inquiry does not advertise tagged queueing.
        assert!(
            ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::TaggedEnable).is_err()
        );
        let dev = k.scsi.device(0).unwrap();
        dev.tagged_supported.store(true, Ordering::Release);
        dev.scsi_level.store(device::SCSI_2, Ordering::Release);
        ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::TaggedEnable).unwrap();
        assert!(dev.tagged_queue.load(Ordering::Acquire));
        ioctl::scsi_ioctl(&k, 0, &mut ioctl::ScsiIoctl::TaggedDisable).unwrap();
        assert!(!dev.tagged_queue.load(Ordering::Acquire));
    }
}
