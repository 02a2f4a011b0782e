// Generic host adapter engine for 5380-style parallel SCSI
// controllers. The board itself is behind the BusPort capability; this
// module owns the nexus state machine: a cooperative main loop that
// drains the issue queue, selection with IDENTIFY (and queue tags),
// the information-transfer phase loop, disconnect handling, and
// reselection of I_T_L / I_T_L_Q nexuses.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::drivers::scsi::hosts::{HostDriver, SG_ALL};
use crate::drivers::scsi::{
    self, command_size, data_out_command, identify, ScsiCmd, ABORT_MSG, CHECK_CONDITION,
    COMMAND_COMPLETE, DID_ABORT, DID_BAD_TARGET, DID_ERROR, DID_RESET, DISCONNECT,
    HEAD_OF_QUEUE_TAG, LINKED_CMD_COMPLETE, LINKED_FLG_CMD_COMPLETE, MESSAGE_REJECT,
    NEEDS_JUMPSTART, NOP_MSG, ORDERED_QUEUE_TAG, REQUEST_SENSE, RESTORE_POINTERS, SAVE_POINTERS,
    SENSE_BUFFER_SIZE, SIMPLE_QUEUE_TAG,
};
use crate::kernel::Kernel;
use crate::klib::error::Result;
use crate::{kdebug, kwarn};

// Register offsets.
pub const OUTPUT_DATA_REG: u8 = 0;
pub const INITIATOR_COMMAND_REG: u8 = 1;
pub const MODE_REG: u8 = 2;
pub const TARGET_COMMAND_REG: u8 = 3;
/// Read: bus status. Write: reselection-enable mask.
pub const STATUS_REG: u8 = 4;
pub const SELECT_ENABLE_REG: u8 = 4;
pub const BUS_AND_STATUS_REG: u8 = 5;
/// Read: current data on the bus.
pub const CURRENT_SCSI_DATA_REG: u8 = 6;
pub const INPUT_DATA_REG: u8 = 6;

// Initiator command register bits.
pub const ICR_ASSERT_RST: u8 = 0x80;
pub const ICR_ARBITRATION_PROGRESS: u8 = 0x40;
pub const ICR_ARBITRATION_LOST: u8 = 0x20;
pub const ICR_ASSERT_ACK: u8 = 0x10;
pub const ICR_ASSERT_BSY: u8 = 0x08;
pub const ICR_ASSERT_SEL: u8 = 0x04;
pub const ICR_ASSERT_ATN: u8 = 0x02;
pub const ICR_ASSERT_DATA: u8 = 0x01;
pub const ICR_BASE: u8 = 0;

// Mode register bits.
pub const MR_DMA_MODE: u8 = 0x02;
pub const MR_ARBITRATE: u8 = 0x01;
pub const MR_BASE: u8 = 0;

// Status register bits.
pub const SR_RST: u8 = 0x80;
pub const SR_BSY: u8 = 0x40;
pub const SR_REQ: u8 = 0x20;
pub const SR_MSG: u8 = 0x10;
pub const SR_CD: u8 = 0x08;
pub const SR_IO: u8 = 0x04;
pub const SR_SEL: u8 = 0x02;

// Bus phases, encoded in the MSG/CD/IO status bits.
pub const PHASE_MASK: u8 = SR_MSG | SR_CD | SR_IO;
pub const PHASE_DATAOUT: u8 = 0;
pub const PHASE_DATAIN: u8 = SR_IO;
pub const PHASE_CMDOUT: u8 = SR_CD;
pub const PHASE_STATIN: u8 = SR_CD | SR_IO;
pub const PHASE_MSGOUT: u8 = SR_MSG | SR_CD;
pub const PHASE_MSGIN: u8 = SR_MSG | SR_CD | SR_IO;

/// Tag argument for selection.
pub const TAG_NEXT: i32 = -1;
pub const TAG_NONE: i32 = -2;

/// Polling bound standing in for the 250 ms selection window and the
/// REQ/ACK handshake timeouts.
const POLL_LIMIT: usize = 100_000;

/// Register-level access to the board.
pub trait BusPort: Send + Sync {
    fn read(&self, reg: u8) -> u8;
    fn write(&self, reg: u8, val: u8);
}

/// Saved data pointers for a nexus; implicitly preserved across
/// disconnects.
struct Scp {
    out_data: Vec<u8>,
    out_pos: usize,
    in_data: Vec<u8>,
    expected_in: usize,
    status: u8,
    message: u8,
}

struct Nexus {
    cmd: Arc<ScsiCmd>,
    tag: u8,
    scp: Scp,
}

struct AdapterState {
    issue_queue: VecDeque<Arc<ScsiCmd>>,
    disconnected: Vec<Nexus>,
    connected: Option<Nexus>,
    busy: [u8; 8],
    last_message: u8,
}

pub struct GenericAdapter {
    bus: Arc<dyn BusPort>,
    this_id: u8,
    can_disconnect: bool,
    unchecked_isa_dma: bool,
    st: Mutex<AdapterState>,
    /// Re-entry guard: only one caller runs the coroutine.
    main_running: AtomicBool,
}

impl GenericAdapter {
    pub fn new(bus: Arc<dyn BusPort>, this_id: u8, can_disconnect: bool) -> Self {
        Self {
            bus,
            this_id,
            can_disconnect,
            unchecked_isa_dma: false,
            st: Mutex::new(AdapterState {
                issue_queue: VecDeque::new(),
                disconnected: Vec::new(),
                connected: None,
                busy: [0; 8],
                last_message: NOP_MSG,
            }),
            main_running: AtomicBool::new(false),
        }
    }

    pub fn with_isa_dma(mut self) -> Self {
        self.unchecked_isa_dma = true;
        self
    }

    fn id_mask(&self) -> u8 {
        1 << self.this_id
    }

    /// Exactly-one-connected invariant, for the test suite.
    pub fn connected_count(&self) -> usize {
        usize::from(self.st.lock().connected.is_some())
    }

    pub fn disconnected_count(&self) -> usize {
        self.st.lock().disconnected.len()
    }

    fn initialize_scp(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> Scp {
        let (opcode, sense, expected) = {
            let mut st = cmd.state.lock();
            (st.cmnd[0], st.sense_in_progress, st.data.total_len())
        };
        if sense || opcode == REQUEST_SENSE {
            Scp {
                out_data: Vec::new(),
                out_pos: 0,
                in_data: Vec::new(),
                expected_in: SENSE_BUFFER_SIZE,
                status: 0,
                message: 0,
            }
        } else if data_out_command(opcode) {
            Scp {
                out_data: cmd.outgoing_bytes(&k.scsi.pool),
                out_pos: 0,
                in_data: Vec::new(),
                expected_in: 0,
                status: 0,
                message: 0,
            }
        } else {
            Scp {
                out_data: Vec::new(),
                out_pos: 0,
                in_data: Vec::new(),
                expected_in: expected,
                status: 0,
                message: 0,
            }
        }
    }

    /// Poll for a condition on the status register.
    fn wait_status(&self, mask: u8, set: bool) -> bool {
        for _ in 0..POLL_LIMIT {
            let sr = self.bus.read(STATUS_REG);
            if (sr & mask != 0) == set {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    /// Polled transfer in the given phase. Returns Err on a phase
    /// mismatch before all bytes moved; the count of bytes moved comes
    /// back either way.
    fn transfer_pio(
        &self,
        phase: u8,
        data: &mut [u8],
        direction_out: bool,
    ) -> (usize, core::result::Result<(), u8>) {
        let mut moved = 0;
        let total = data.len();
        for (i, byte) in data.iter_mut().enumerate() {
            if !self.wait_status(SR_REQ, true) {
                return (moved, Err(0xff));
            }
            let sr = self.bus.read(STATUS_REG);
            if sr & PHASE_MASK != phase {
                return (moved, Err(sr & PHASE_MASK));
            }
            if direction_out {
                // ATN stays up through a MESSAGE OUT until the final
                // byte's ACK, so the target keeps taking messages.
                let atn = if phase == PHASE_MSGOUT && i + 1 < total {
                    ICR_ASSERT_ATN
                } else {
                    0
                };
                self.bus.write(OUTPUT_DATA_REG, *byte);
                self.bus.write(
                    INITIATOR_COMMAND_REG,
                    ICR_BASE | ICR_ASSERT_DATA | ICR_ASSERT_ACK | atn,
                );
                if !self.wait_status(SR_REQ, false) {
                    self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
                    return (moved, Err(0xff));
                }
                self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE | atn);
            } else {
                *byte = self.bus.read(INPUT_DATA_REG);
                self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ACK);
                if !self.wait_status(SR_REQ, false) {
                    self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
                    return (moved, Err(0xff));
                }
                self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
            }
            moved += 1;
        }
        (moved, Ok(()))
    }

    /// Pseudo-DMA block transfer: the handshake runs without phase
    /// checks between bytes.
    fn transfer_pdma(&self, data: &mut [u8], direction_out: bool) -> usize {
        self.bus.write(MODE_REG, MR_BASE | MR_DMA_MODE);
        let mut moved = 0;
        for byte in data.iter_mut() {
            if !self.wait_status(SR_REQ, true) {
                break;
            }
            if direction_out {
                self.bus.write(OUTPUT_DATA_REG, *byte);
            } else {
                *byte = self.bus.read(INPUT_DATA_REG);
            }
            self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ACK);
            if !self.wait_status(SR_REQ, false) {
                self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
                break;
            }
            self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
            moved += 1;
        }
        self.bus.write(MODE_REG, MR_BASE);
        moved
    }

    /// Establish an I_T_L or I_T_L_Q nexus: arbitration, selection
    /// with ATN, and the initial IDENTIFY (+ queue tag) message.
    ///
    /// Err(()) means arbitration or the bus lost; the caller requeues.
    /// Ok(()) covers both success and a dead target (which is completed
    /// with DID_BAD_TARGET here).
    fn select(&self, k: &Kernel, cmd: Arc<ScsiCmd>, tag: i32) -> core::result::Result<(), ()> {
        // Phase bits zero so the data bus drives during selection.
        self.bus.write(TARGET_COMMAND_REG, 0);
        self.bus.write(OUTPUT_DATA_REG, self.id_mask());
        self.bus.write(MODE_REG, MR_ARBITRATE);
        for _ in 0..POLL_LIMIT {
            if self.bus.read(INITIATOR_COMMAND_REG) & ICR_ARBITRATION_PROGRESS != 0 {
                break;
            }
            core::hint::spin_loop();
        }
        if self.bus.read(INITIATOR_COMMAND_REG) & ICR_ARBITRATION_LOST != 0 {
            self.bus.write(MODE_REG, MR_BASE);
            return Err(());
        }
        self.bus
            .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_SEL);
        if self.bus.read(INITIATOR_COMMAND_REG) & ICR_ARBITRATION_LOST != 0 {
            self.bus.write(MODE_REG, MR_BASE);
            self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
            return Err(());
        }

        // Assert our ID and the target's, with ATN raised while SEL is
        // still true so the target must enter MESSAGE OUT.
        self.bus
            .write(OUTPUT_DATA_REG, self.id_mask() | (1 << cmd.target));
        self.bus.write(
            INITIATOR_COMMAND_REG,
            ICR_BASE | ICR_ASSERT_BSY | ICR_ASSERT_DATA | ICR_ASSERT_ATN | ICR_ASSERT_SEL,
        );
        self.bus.write(MODE_REG, MR_BASE);
        // Reselect interrupts off before BSY drops.
        self.bus.write(SELECT_ENABLE_REG, 0);
        self.bus.write(
            INITIATOR_COMMAND_REG,
            ICR_BASE | ICR_ASSERT_DATA | ICR_ASSERT_ATN | ICR_ASSERT_SEL,
        );

        // The 250 ms post-BSY window for target detection.
        let responded = self.wait_status(SR_BSY, true);
        self.bus
            .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ATN);
        if !responded {
            self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
            cmd.state.lock().result = DID_BAD_TARGET << 16;
            self.bus.write(SELECT_ENABLE_REG, self.id_mask());
            scsi::scsi_done(k, &cmd);
            return Ok(());
        }

        self.wait_status(SR_REQ, true);

        let mut msg = [0u8; 3];
        msg[0] = identify(self.can_disconnect, cmd.lun);
        let mut len = 1;
        let mut cmd_tag = 0u8;
        let tagged = k
            .scsi
            .device(cmd.dev)
            .map(|d| d.tagged_queue.load(Ordering::Acquire))
            .unwrap_or(false);
        if tagged && tag != TAG_NONE {
            msg[1] = SIMPLE_QUEUE_TAG;
            cmd_tag = if tag == TAG_NEXT {
                k.scsi
                    .device(cmd.dev)
                    .map(|d| d.next_tag())
                    .unwrap_or(1)
            } else {
                tag as u8
            };
            msg[2] = cmd_tag;
            self.st.lock().last_message = SIMPLE_QUEUE_TAG;
            len = 3;
        }
        cmd.state.lock().tag = cmd_tag;

        let _ = self.transfer_pio(PHASE_MSGOUT, &mut msg[..len], true);

        let scp = self.initialize_scp(k, &cmd);
        {
            let mut st = self.st.lock();
            if cmd_tag == 0 {
                st.busy[cmd.target as usize] |= 1 << cmd.lun;
            }
            st.connected = Some(Nexus {
                cmd,
                tag: cmd_tag,
                scp,
            });
        }
        Ok(())
    }

    /// Run the bus phases the target walks us through, operating on
    /// the connected nexus. Returns when the target disconnects, the
    /// command completes, or the bus goes quiet.
    fn information_transfer(&self, k: &Kernel) {
        let mut msgout = NOP_MSG;
        loop {
            let sr = self.bus.read(STATUS_REG);
            if sr & SR_REQ == 0 {
                // Bus settled with no request: nothing more to do now.
                return;
            }
            let phase = sr & PHASE_MASK;
            match phase {
                PHASE_DATAOUT | PHASE_DATAIN => {
                    let (borken, transfersize) = {
                        let st = self.st.lock();
                        let Some(nexus) = st.connected.as_ref() else {
                            return;
                        };
                        let borken = k
                            .scsi
                            .device(nexus.cmd.dev)
                            .map(|d| d.borken.load(Ordering::Acquire))
                            .unwrap_or(true);
                        (borken, 512usize)
                    };
                    let mut st = self.st.lock();
                    let Some(nexus) = st.connected.as_mut() else {
                        return;
                    };
                    if phase == PHASE_DATAOUT {
                        let remaining = nexus.scp.out_data.len() - nexus.scp.out_pos;
                        if remaining == 0 {
                            // The target wants more than we have; let
                            // the pio loop report the mismatch.
                            let mut empty = [0u8; 1];
                            drop(st);
                            let _ = self.transfer_pio(PHASE_DATAOUT, &mut empty[..0], true);
                            return;
                        }
                        let pos = nexus.scp.out_pos;
                        let use_pdma = !borken && remaining % transfersize == 0;
                        let mut chunk: Vec<u8> =
                            nexus.scp.out_data[pos..pos + remaining].to_vec();
                        drop(st);
                        let moved = if use_pdma {
                            self.transfer_pdma(&mut chunk, true)
                        } else {
                            self.transfer_pio(PHASE_DATAOUT, &mut chunk, true).0
                        };
                        let mut st = self.st.lock();
                        if let Some(nexus) = st.connected.as_mut() {
                            nexus.scp.out_pos += moved;
                        }
                    } else {
                        let remaining =
                            nexus.scp.expected_in.saturating_sub(nexus.scp.in_data.len());
                        let want = remaining.max(1);
                        let use_pdma = !borken && remaining > 0 && remaining % transfersize == 0;
                        let mut chunk = alloc::vec![0u8; want];
                        drop(st);
                        let moved = if use_pdma {
                            self.transfer_pdma(&mut chunk, false)
                        } else {
                            self.transfer_pio(PHASE_DATAIN, &mut chunk, false).0
                        };
                        let mut st = self.st.lock();
                        if let Some(nexus) = st.connected.as_mut() {
                            nexus.scp.in_data.extend_from_slice(&chunk[..moved]);
                        }
                    }
                }
                PHASE_MSGIN => {
                    let mut msg = [0u8; 1];
                    let _ = self.transfer_pio(PHASE_MSGIN, &mut msg, false);
                    let tmp = msg[0];
                    {
                        let mut st = self.st.lock();
                        if let Some(nexus) = st.connected.as_mut() {
                            nexus.scp.message = tmp;
                        }
                    }
                    match tmp {
                        COMMAND_COMPLETE | ABORT_MSG => {
                            if self.finish_connected(k) {
                                return;
                            }
                        }
                        LINKED_CMD_COMPLETE | LINKED_FLG_CMD_COMPLETE => {
                            self.linked_complete(k, &mut msgout);
                        }
                        MESSAGE_REJECT => {
                            // A rejected queue tag means the target
                            // lied about tagged queueing: fall back to
                            // untagged operation.
                            let mut st = self.st.lock();
                            let last = st.last_message;
                            let ident = st
                                .connected
                                .as_ref()
                                .map(|n| (n.cmd.dev, n.cmd.target, n.cmd.lun));
                            if let Some((dev_idx, target, lun)) = ident {
                                if matches!(
                                    last,
                                    SIMPLE_QUEUE_TAG | HEAD_OF_QUEUE_TAG | ORDERED_QUEUE_TAG
                                ) {
                                    if let Some(dev) = k.scsi.device(dev_idx) {
                                        dev.tagged_queue.store(false, Ordering::Release);
                                    }
                                    st.busy[target as usize] |= 1 << lun;
                                }
                            }
                        }
                        DISCONNECT => {
                            let mut st = self.st.lock();
                            if let Some(nexus) = st.connected.take() {
                                if let Some(dev) = k.scsi.device(nexus.cmd.dev) {
                                    dev.disconnect.store(true, Ordering::Release);
                                }
                                st.disconnected.push(nexus);
                            }
                            drop(st);
                            // Re-enable reselection before the bus
                            // clears.
                            self.bus.write(SELECT_ENABLE_REG, self.id_mask());
                            return;
                        }
                        // The data pointer is implicitly saved on
                        // disconnect; some drives omit SAVE POINTERS
                        // entirely, so both are no-ops.
                        SAVE_POINTERS | RESTORE_POINTERS => {}
                        other => {
                            kwarn!("scsi: rejecting unknown message {:#x}", other);
                            // ATN must be up before the final ACK of
                            // the rejected byte.
                            self.bus
                                .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ATN);
                            msgout = MESSAGE_REJECT;
                        }
                    }
                }
                PHASE_MSGOUT => {
                    let mut msg = [msgout];
                    self.st.lock().last_message = msgout;
                    let _ = self.transfer_pio(PHASE_MSGOUT, &mut msg, true);
                    if msgout == ABORT_MSG {
                        let mut st = self.st.lock();
                        if let Some(nexus) = st.connected.take() {
                            let (t, l) = (nexus.cmd.target, nexus.cmd.lun);
                            st.busy[t as usize] &= !(1 << l);
                            drop(st);
                            nexus.cmd.state.lock().result = DID_ERROR << 16;
                            self.bus.write(SELECT_ENABLE_REG, self.id_mask());
                            scsi::scsi_done(k, &nexus.cmd);
                        }
                        return;
                    }
                    msgout = NOP_MSG;
                }
                PHASE_CMDOUT => {
                    let mut cdb = {
                        let st = self.st.lock();
                        let Some(nexus) = st.connected.as_ref() else {
                            return;
                        };
                        let cst = nexus.cmd.state.lock();
                        let len = command_size(cst.cmnd[0]);
                        cst.cmnd[..len].to_vec()
                    };
                    let _ = self.transfer_pio(PHASE_CMDOUT, &mut cdb, true);
                }
                PHASE_STATIN => {
                    let mut status = [0u8; 1];
                    let _ = self.transfer_pio(PHASE_STATIN, &mut status, false);
                    let mut st = self.st.lock();
                    if let Some(nexus) = st.connected.as_mut() {
                        nexus.scp.status = status[0];
                    }
                }
                _ => {
                    kwarn!("scsi: unknown phase {:#x}", phase);
                    return;
                }
            }
        }
    }

    /// COMMAND COMPLETE: deliver the result, or auto-schedule a
    /// REQUEST SENSE on a check condition. Returns true when the
    /// caller should leave the transfer loop.
    fn finish_connected(&self, k: &Kernel) -> bool {
        let nexus = {
            let mut st = self.st.lock();
            let Some(nexus) = st.connected.take() else {
                return true;
            };
            st.busy[nexus.cmd.target as usize] &= !(1 << nexus.cmd.lun);
            nexus
        };
        let cmd = nexus.cmd;
        let (opcode, was_sense) = {
            let st = cmd.state.lock();
            (st.cmnd[0], st.sense_in_progress)
        };

        // Deliver received bytes.
        if !nexus.scp.in_data.is_empty() {
            cmd.incoming_bytes(&k.scsi.pool, &nexus.scp.in_data);
        }

        {
            let mut st = cmd.state.lock();
            if opcode != REQUEST_SENSE {
                st.result = u32::from(nexus.scp.status) | (u32::from(nexus.scp.message) << 8);
            } else if nexus.scp.status != scsi::GOOD {
                st.result = (st.result & 0x00ffff) | (DID_ERROR << 16);
            }
        }

        if opcode != REQUEST_SENSE && nexus.scp.status == CHECK_CONDITION {
            // Contingent allegiance: grab the sense data before any
            // other command clears it.
            kdebug!("scsi{} : performing request sense", cmd.host);
            {
                let mut st = cmd.state.lock();
                let lun_bits = st.cmnd[1] & 0xe0;
                st.cmnd = [0; scsi::MAX_COMMAND_SIZE];
                st.cmnd[0] = REQUEST_SENSE;
                st.cmnd[1] = lun_bits;
                st.cmnd[4] = SENSE_BUFFER_SIZE as u8;
                st.cmd_len = 6;
                st.sense_in_progress = true;
            }
            self.st.lock().issue_queue.push_front(cmd);
        } else {
            if was_sense {
                cmd.state.lock().sense_in_progress = false;
            }
            self.bus.write(SELECT_ENABLE_REG, self.id_mask());
            scsi::scsi_done(k, &cmd);
            return true;
        }
        self.bus.write(SELECT_ENABLE_REG, self.id_mask());
        true
    }

    /// Linked command complete: the follow-on command inherits the
    /// nexus and the tag.
    fn linked_complete(&self, k: &Kernel, msgout: &mut u8) {
        let mut st = self.st.lock();
        let Some(nexus) = st.connected.as_mut() else {
            return;
        };
        let next = nexus.cmd.state.lock().next_link.take();
        match next {
            None => {
                kwarn!(
                    "scsi{} : linked command complete with no next_link",
                    nexus.cmd.host
                );
                *msgout = ABORT_MSG;
                self.bus
                    .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ATN);
            }
            Some(next) => {
                {
                    let mut nst = next.state.lock();
                    nst.tag = nexus.tag;
                }
                let done_cmd = nexus.cmd.clone();
                {
                    let mut cst = done_cmd.state.lock();
                    cst.result =
                        u32::from(nexus.scp.status) | (u32::from(nexus.scp.message) << 8);
                }
                let scp = self.initialize_scp(k, &next);
                nexus.cmd = next;
                nexus.scp = scp;
                drop(st);
                scsi::scsi_done(k, &done_cmd);
            }
        }
    }

    /// Reselection: the target raised SEL+I/O with BSY clear. Assert
    /// BSY, wait for SEL to drop, read the IDENTIFY (and optional
    /// tag), and restore the matching nexus.
    pub fn reselect(&self, _k: &Kernel) {
        let target_mask = self.bus.read(CURRENT_SCSI_DATA_REG) & !self.id_mask();
        self.bus
            .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_BSY);
        self.wait_status(SR_SEL, false);
        self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
        self.wait_status(SR_REQ, true);

        let mut msg = [0u8; 3];
        let (moved, _) = self.transfer_pio(PHASE_MSGIN, &mut msg, false);
        // Three bytes means IDENTIFY + queue-tag message; one means an
        // untagged I_T_L nexus.
        let tag = if moved == 3 { msg[2] } else { 0 };

        let mut abort = msg[0] & 0x80 == 0;
        if !abort {
            let lun = msg[0] & 0x07;
            let mut st = self.st.lock();
            let found = st.disconnected.iter().position(|n| {
                target_mask == 1 << n.cmd.target && lun == n.cmd.lun && tag == n.tag
            });
            match found {
                Some(pos) => {
                    let nexus = st.disconnected.remove(pos);
                    st.connected = Some(nexus);
                }
                None => {
                    kwarn!(
                        "scsi : target mask {:#04x} lun {} tag {} not disconnected",
                        target_mask,
                        lun,
                        tag
                    );
                    abort = true;
                }
            }
        } else {
            kwarn!("scsi : reselection without IDENTIFY");
        }
        if abort {
            let mut out = [ABORT_MSG];
            self.bus
                .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ATN);
            let _ = self.transfer_pio(PHASE_MSGOUT, &mut out, true);
        }
    }

    /// Interrupt entry: reselection detection, then more main-loop
    /// work.
    pub fn intr(&self, k: &Kernel) {
        let sr = self.bus.read(STATUS_REG);
        if sr & (SR_SEL | SR_IO) == (SR_SEL | SR_IO) && sr & SR_BSY == 0 {
            self.reselect(k);
        }
        self.run_main(k);
    }

    /// The cooperative coroutine. Guarded so it never runs reentrant.
    pub fn run_main(&self, k: &Kernel) {
        if self.main_running.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let mut progressed = false;
            // With no nexus, walk the issue queue for a command whose
            // (target, lun) is not busy; REQUEST SENSE bypasses the
            // check because it must run under contingent allegiance.
            let next = {
                let mut st = self.st.lock();
                if st.connected.is_some() {
                    None
                } else {
                    let pos = st.issue_queue.iter().position(|cmd| {
                        cmd.opcode() == REQUEST_SENSE
                            || st.busy[cmd.target as usize] & (1 << cmd.lun) == 0
                    });
                    pos.and_then(|p| st.issue_queue.remove(p))
                }
            };
            if let Some(cmd) = next {
                let tag = if cmd.opcode() == REQUEST_SENSE {
                    TAG_NONE
                } else {
                    TAG_NEXT
                };
                match self.select(k, cmd.clone(), tag) {
                    Ok(()) => progressed = true,
                    Err(()) => {
                        // Lost arbitration; put it back and try later.
                        self.st.lock().issue_queue.push_front(cmd);
                    }
                }
            }
            if self.st.lock().connected.is_some() {
                self.information_transfer(k);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        self.main_running.store(false, Ordering::Release);
    }
}

impl HostDriver for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic5380"
    }

    fn can_queue(&self) -> u32 {
        16
    }

    fn this_id(&self) -> u8 {
        self.this_id
    }

    fn sg_tablesize(&self) -> usize {
        SG_ALL
    }

    fn cmd_per_lun(&self) -> usize {
        2
    }

    fn unchecked_isa_dma(&self) -> bool {
        self.unchecked_isa_dma
    }

    fn queuecommand(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> Result<()> {
        {
            let mut st = self.st.lock();
            // REQUEST SENSE goes to the head: the sense data is only
            // valid while the contingent allegiance condition exists.
            if cmd.opcode() == REQUEST_SENSE {
                st.issue_queue.push_front(cmd.clone());
            } else {
                st.issue_queue.push_back(cmd.clone());
            }
        }
        self.run_main(k);
        Ok(())
    }

    fn abort(&self, k: &Kernel, cmd: &Arc<ScsiCmd>, code: u32) -> bool {
        let code = if code == 0 { DID_ABORT } else { code };

        // Case 1: still on the issue queue; splice it out.
        {
            let mut st = self.st.lock();
            if let Some(pos) = st
                .issue_queue
                .iter()
                .position(|c| Arc::ptr_eq(c, cmd))
            {
                st.issue_queue.remove(pos);
                drop(st);
                cmd.state.lock().result = code << 16;
                scsi::scsi_done(k, cmd);
                return true;
            }
        }

        // Case 2: currently connected; we cannot abort it cleanly.
        {
            let st = self.st.lock();
            if st
                .connected
                .as_ref()
                .map(|n| Arc::ptr_eq(&n.cmd, cmd))
                .unwrap_or(false)
            {
                return false;
            }
        }

        // Case 3: disconnected; re-establish the nexus and send ABORT.
        let disconnected = {
            let st = self.st.lock();
            st.disconnected.iter().any(|n| Arc::ptr_eq(&n.cmd, cmd))
        };
        if disconnected {
            let tag = i32::from(cmd.state.lock().tag);
            if self.select(k, cmd.clone(), tag).is_err() {
                return false;
            }
            let mut out = [ABORT_MSG];
            self.bus
                .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_ATN);
            let _ = self.transfer_pio(PHASE_MSGOUT, &mut out, true);
            let mut st = self.st.lock();
            st.connected = None;
            if let Some(pos) = st
                .disconnected
                .iter()
                .position(|n| Arc::ptr_eq(&n.cmd, cmd))
            {
                st.disconnected.remove(pos);
            }
            drop(st);
            cmd.state.lock().result = code << 16;
            scsi::scsi_done(k, cmd);
            return true;
        }

        // Case 4: not in any queue; it probably completed while the
        // abort raced it.
        kwarn!("scsi : command probably completed before abortion");
        true
    }

    fn reset(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> bool {
        // Pulse RST for at least a microsecond.
        self.bus
            .write(INITIATOR_COMMAND_REG, ICR_BASE | ICR_ASSERT_RST);
        let settle = k.platform.us_clock() + 1;
        while k.platform.us_clock() < settle {
            core::hint::spin_loop();
        }
        self.bus.write(INITIATOR_COMMAND_REG, ICR_BASE);
        cmd.state.lock().flags |= NEEDS_JUMPSTART;

        // The bus reset killed every nexus on the wire.
        let (connected, disconnected) = {
            let mut st = self.st.lock();
            st.busy = [0; 8];
            (st.connected.take(), core::mem::take(&mut st.disconnected))
        };
        for nexus in connected.into_iter().chain(disconnected) {
            if !Arc::ptr_eq(&nexus.cmd, cmd) {
                nexus.cmd.state.lock().result = DID_RESET << 16;
                scsi::scsi_done(k, &nexus.cmd);
            }
        }
        self.bus.write(SELECT_ENABLE_REG, self.id_mask());
        true
    }

    fn bh(&self, k: &Kernel) {
        self.intr(k);
    }
}
