// SCSI test doubles: a synchronous scripted host for mid-layer tests
// (in the spirit of a debug adapter that fakes a bus), and a
// register-level target emulator that speaks the 5380 handshake for
// the adapter engine.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::drivers::scsi::adapter::{
    BusPort, ICR_ARBITRATION_PROGRESS, ICR_ASSERT_ACK, ICR_ASSERT_ATN, ICR_ASSERT_BSY,
    ICR_ASSERT_RST, ICR_ASSERT_SEL, INITIATOR_COMMAND_REG, INPUT_DATA_REG, MODE_REG, MR_ARBITRATE,
    OUTPUT_DATA_REG, SELECT_ENABLE_REG, SR_BSY, SR_CD, SR_IO, SR_MSG, SR_REQ, SR_SEL, STATUS_REG,
    TARGET_COMMAND_REG,
};
use crate::drivers::scsi::hosts::HostDriver;
use crate::drivers::scsi::{
    self, command_size, ScsiCmd, ABORT_MSG, COMMAND_COMPLETE, DISCONNECT, GOOD, IDENTIFY_BASE,
    INQUIRY, READ_10, READ_6, REQUEST_SENSE, SIMPLE_QUEUE_TAG, TEST_UNIT_READY, WRITE_10, WRITE_6,
};
use crate::kernel::Kernel;

/// Canned INQUIRY data: direct-access, SCSI-2, tagged-queueing
/// capable.
pub fn mock_inquiry(removable: bool, tagged: bool, type_code: u8) -> Vec<u8> {
    let mut inq = alloc::vec![0u8; 36];
    inq[0] = type_code;
    inq[1] = if removable { 0x80 } else { 0 };
    inq[2] = 0x02;
    inq[3] = 0x02;
    inq[4] = 31;
    inq[7] = if tagged { 0x02 } else { 0 };
    inq[8..16].copy_from_slice(b"MOCK    ");
    inq[16..32].copy_from_slice(b"FAKE DISK       ");
    inq[32..36].copy_from_slice(b"1.0 ");
    inq
}

/// One scripted completion for the synchronous host: consumed in
/// order, one per command.
#[derive(Clone)]
pub struct ScriptedOutcome {
    pub result: u32,
    /// Payload delivered on success (or sense bytes for a REQUEST
    /// SENSE).
    pub data: Option<Vec<u8>>,
}

impl ScriptedOutcome {
    pub fn good() -> Self {
        Self {
            result: 0,
            data: None,
        }
    }

    pub fn status(status: u8) -> Self {
        Self {
            result: scsi::make_result(status, COMMAND_COMPLETE, scsi::DID_OK, 0),
            data: None,
        }
    }

    pub fn host_error(host: u32) -> Self {
        Self {
            result: host << 16,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }
}

/// Synchronous scripted host adapter. With an empty script it behaves
/// like a well-behaved one-disk bus.
pub struct MockHost {
    pub script: Mutex<VecDeque<ScriptedOutcome>>,
    /// (id, lun) pairs that respond to selection.
    pub targets: Mutex<BTreeSet<(u8, u8)>>,
    pub call_log: Mutex<Vec<(u8, u8, u8)>>,
    pub written: Mutex<Vec<Vec<u8>>>,
    pub aborts: AtomicU32,
    pub resets: AtomicU32,
    pub jumpstart_on_reset: AtomicBool,
    /// Sense delivered by default REQUEST SENSE handling.
    pub current_sense: Mutex<[u8; scsi::SENSE_BUFFER_SIZE]>,
    pub removable: AtomicBool,
    pub tagged: AtomicBool,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        let mut targets = BTreeSet::new();
        targets.insert((0, 0));
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            targets: Mutex::new(targets),
            call_log: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            aborts: AtomicU32::new(0),
            resets: AtomicU32::new(0),
            jumpstart_on_reset: AtomicBool::new(false),
            current_sense: Mutex::new(valid_sense(scsi::NO_SENSE, 0)),
            removable: AtomicBool::new(false),
            tagged: AtomicBool::new(false),
        })
    }

    pub fn new_removable() -> Arc<Self> {
        let host = Self::new();
        host.removable.store(true, Ordering::Release);
        host
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().push_back(outcome);
    }
}

/// A sense buffer with the valid bit and a key.
pub fn valid_sense(key: u8, asc: u8) -> [u8; scsi::SENSE_BUFFER_SIZE] {
    let mut sense = [0u8; scsi::SENSE_BUFFER_SIZE];
    sense[0] = 0x70;
    sense[2] = key;
    sense[12] = asc;
    sense
}

impl HostDriver for MockHost {
    fn name(&self) -> &'static str {
        "mockhost"
    }

    fn cmd_per_lun(&self) -> usize {
        2
    }

    fn command(&self, k: &Kernel, cmd: &Arc<ScsiCmd>) -> u32 {
        let opcode = cmd.opcode();
        self.call_log.lock().push((opcode, cmd.target, cmd.lun));

        if let Some(outcome) = self.script.lock().pop_front() {
            if let Some(data) = outcome.data {
                cmd.incoming_bytes(&k.scsi.pool, &data);
            }
            return outcome.result;
        }

        if !self.targets.lock().contains(&(cmd.target, cmd.lun)) {
            return scsi::DID_NO_CONNECT << 16;
        }
        match opcode {
            TEST_UNIT_READY => 0,
            INQUIRY => {
                let inq = mock_inquiry(
                    self.removable.load(Ordering::Acquire),
                    self.tagged.load(Ordering::Acquire),
                    0,
                );
                cmd.incoming_bytes(&k.scsi.pool, &inq);
                0
            }
            REQUEST_SENSE => {
                let sense = *self.current_sense.lock();
                cmd.incoming_bytes(&k.scsi.pool, &sense);
                0
            }
            READ_6 | READ_10 => {
                let len = cmd.state.lock().data.total_len();
                let data: Vec<u8> = (0..len).map(|i| (i & 0xff) as u8).collect();
                cmd.incoming_bytes(&k.scsi.pool, &data);
                0
            }
            WRITE_6 | WRITE_10 => {
                let data = cmd.outgoing_bytes(&k.scsi.pool);
                self.written.lock().push(data);
                0
            }
            _ => 0,
        }
    }

    fn abort(&self, k: &Kernel, cmd: &Arc<ScsiCmd>, code: u32) -> bool {
        self.aborts.fetch_add(1, Ordering::AcqRel);
        let code = if code == 0 { scsi::DID_ABORT } else { code };
        cmd.state.lock().result = code << 16;
        scsi::scsi_done(k, cmd);
        true
    }

    fn reset(&self, _k: &Kernel, cmd: &Arc<ScsiCmd>) -> bool {
        self.resets.fetch_add(1, Ordering::AcqRel);
        if self.jumpstart_on_reset.load(Ordering::Acquire) {
            cmd.state.lock().flags |= scsi::NEEDS_JUMPSTART;
        }
        true
    }
}

// Register-level target emulator for the adapter engine.

/// What the emulated target does with one command.
#[derive(Clone)]
pub struct TargetScript {
    pub data_in: Option<Vec<u8>>,
    pub status: u8,
    /// Disconnect after the CDB; the test later calls
    /// `trigger_reselect` to resume.
    pub disconnect_before_data: bool,
}

impl TargetScript {
    pub fn good() -> Self {
        Self {
            data_in: None,
            status: GOOD,
            disconnect_before_data: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TPhase {
    BusFree,
    MsgOut,
    CmdOut,
    DataIn,
    DataOut,
    Status,
    MsgIn,
}

struct PendingNexus {
    target: u8,
    lun: u8,
    tag: u8,
    script: TargetScript,
}

struct BusState {
    prev_icr: u8,
    icr_readback: u8,
    out_data: u8,
    sel_enable: u8,
    phase: TPhase,
    req: bool,
    bsy: bool,
    sel: bool,
    io_resel: bool,
    current_data: u8,
    selected_target: u8,
    selected_lun: u8,
    current_tag: u8,
    msgout: Vec<u8>,
    cdb: Vec<u8>,
    data_out_expected: usize,
    data_out: Vec<u8>,
    in_queue: VecDeque<u8>,
    after_in: TPhase,
    /// Data queued to follow a reselection identify.
    resume_data: Option<VecDeque<u8>>,
    status_byte: u8,
    pending: Option<PendingNexus>,
    resuming: Option<PendingNexus>,
}

/// The emulated bus + single target board.
pub struct MockBus {
    st: Mutex<BusState>,
    pub targets: Mutex<BTreeSet<(u8, u8)>>,
    pub scripts: Mutex<VecDeque<TargetScript>>,
    pub cmd_log: Mutex<Vec<Vec<u8>>>,
    pub written: Mutex<Vec<Vec<u8>>>,
    pub sense: Mutex<[u8; scsi::SENSE_BUFFER_SIZE]>,
    pub tagged: AtomicBool,
    pub reject_tags: AtomicBool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        let mut targets = BTreeSet::new();
        targets.insert((1, 0));
        Arc::new(Self {
            st: Mutex::new(BusState {
                prev_icr: 0,
                icr_readback: 0,
                out_data: 0,
                sel_enable: 0,
                phase: TPhase::BusFree,
                req: false,
                bsy: false,
                sel: false,
                io_resel: false,
                current_data: 0,
                selected_target: 0,
                selected_lun: 0,
                current_tag: 0,
                msgout: Vec::new(),
                cdb: Vec::new(),
                data_out_expected: 0,
                data_out: Vec::new(),
                in_queue: VecDeque::new(),
                after_in: TPhase::BusFree,
                resume_data: None,
                status_byte: GOOD,
                pending: None,
                resuming: None,
            }),
            targets: Mutex::new(targets),
            scripts: Mutex::new(VecDeque::new()),
            cmd_log: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            sense: Mutex::new(valid_sense(scsi::NO_SENSE, 0)),
            tagged: AtomicBool::new(false),
            reject_tags: AtomicBool::new(false),
        })
    }

    pub fn add_target(&self, id: u8, lun: u8) {
        self.targets.lock().insert((id, lun));
    }

    pub fn push_script(&self, s: TargetScript) {
        self.scripts.lock().push_back(s);
    }

    /// The disconnected target wants the bus back.
    pub fn trigger_reselect(&self, initiator_mask: u8) -> bool {
        let mut st = self.st.lock();
        let Some(pending) = st.pending.take() else {
            return false;
        };
        st.sel = true;
        st.io_resel = true;
        st.bsy = false;
        st.current_data = (1 << pending.target) | initiator_mask;
        st.resuming = Some(pending);
        true
    }

    pub fn has_pending_disconnect(&self) -> bool {
        self.st.lock().pending.is_some()
    }

    fn begin_command(&self, st: &mut BusState) {
        let cdb = core::mem::take(&mut st.cdb);
        self.cmd_log.lock().push(cdb.clone());
        let opcode = cdb[0];
        let lun_known = self
            .targets
            .lock()
            .contains(&(st.selected_target, st.selected_lun));
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_script(&cdb, lun_known));

        if script.disconnect_before_data {
            st.in_queue = VecDeque::from(alloc::vec![DISCONNECT]);
            st.phase = TPhase::MsgIn;
            st.after_in = TPhase::BusFree;
            st.req = true;
            st.pending = Some(PendingNexus {
                target: st.selected_target,
                lun: st.selected_lun,
                tag: st.current_tag,
                script: TargetScript {
                    disconnect_before_data: false,
                    ..script
                },
            });
            return;
        }
        self.run_script(st, opcode, &cdb, script);
    }

    fn default_script(&self, cdb: &[u8], lun_known: bool) -> TargetScript {
        match cdb[0] {
            INQUIRY => {
                // A real target answers selection for any lun but
                // reports no device on the unconfigured ones.
                let mut inq =
                    mock_inquiry(false, self.tagged.load(Ordering::Acquire), 0);
                if !lun_known {
                    inq[0] = 0x7f;
                }
                TargetScript {
                    data_in: Some(inq),
                    status: GOOD,
                    disconnect_before_data: false,
                }
            }
            REQUEST_SENSE => TargetScript {
                data_in: Some(self.sense.lock().to_vec()),
                status: GOOD,
                disconnect_before_data: false,
            },
            READ_6 | READ_10 => {
                let len = read_len(cdb);
                TargetScript {
                    data_in: Some((0..len).map(|i| (i & 0xff) as u8).collect()),
                    status: GOOD,
                    disconnect_before_data: false,
                }
            }
            _ => TargetScript::good(),
        }
    }

    fn run_script(&self, st: &mut BusState, opcode: u8, cdb: &[u8], script: TargetScript) {
        st.status_byte = script.status;
        if matches!(opcode, WRITE_6 | WRITE_10) {
            st.data_out_expected = write_len(cdb);
            st.data_out.clear();
            st.phase = TPhase::DataOut;
            st.req = true;
        } else if let Some(data) = script.data_in {
            st.in_queue = data.into();
            st.phase = TPhase::DataIn;
            st.after_in = TPhase::Status;
            st.req = true;
        } else {
            st.phase = TPhase::Status;
            st.req = true;
        }
    }

    /// Advance after the initiator completed one REQ/ACK handshake.
    fn ack_fall(&self, st: &mut BusState, atn: bool) {
        match st.phase {
            TPhase::MsgOut => {
                // ATN down means the message is complete.
                if atn {
                    st.req = true;
                    return;
                }
                let msg = core::mem::take(&mut st.msgout);
                if msg.first() == Some(&ABORT_MSG) {
                    self.to_bus_free(st);
                    return;
                }
                if msg.first().map(|m| m & 0x80 != 0) == Some(true) {
                    st.selected_lun = msg[0] & 7;
                    if msg.len() >= 3 && msg[1] == SIMPLE_QUEUE_TAG {
                        if self.reject_tags.load(Ordering::Acquire) {
                            st.current_tag = 0;
                            st.in_queue =
                                VecDeque::from(alloc::vec![crate::drivers::scsi::MESSAGE_REJECT]);
                            st.phase = TPhase::MsgIn;
                            st.after_in = TPhase::CmdOut;
                            st.req = true;
                            return;
                        }
                        st.current_tag = msg[2];
                    } else {
                        st.current_tag = 0;
                    }
                }
                if let Some(resume) = st.resuming.take() {
                    // Unexpected: initiator responded to reselection
                    // with a message out (abort).
                    let _ = resume;
                    self.to_bus_free(st);
                    return;
                }
                st.cdb.clear();
                st.phase = TPhase::CmdOut;
                st.req = true;
            }
            TPhase::CmdOut => {
                let want = command_size(st.cdb[0]);
                if st.cdb.len() >= want {
                    self.begin_command(st);
                } else {
                    st.req = true;
                }
            }
            TPhase::DataOut => {
                if st.data_out.len() >= st.data_out_expected {
                    self.written.lock().push(core::mem::take(&mut st.data_out));
                    st.phase = TPhase::Status;
                }
                st.req = true;
            }
            TPhase::DataIn => {
                if st.in_queue.is_empty() {
                    st.phase = st.after_in;
                    match st.phase {
                        TPhase::Status => st.req = true,
                        TPhase::BusFree => self.to_bus_free(st),
                        _ => st.req = true,
                    }
                } else {
                    st.req = true;
                }
            }
            TPhase::Status => {
                st.in_queue = VecDeque::from(alloc::vec![COMMAND_COMPLETE]);
                st.phase = TPhase::MsgIn;
                st.after_in = TPhase::BusFree;
                st.req = true;
            }
            TPhase::MsgIn => {
                if st.in_queue.is_empty() {
                    match st.after_in {
                        TPhase::BusFree => self.to_bus_free(st),
                        TPhase::DataIn => {
                            st.in_queue = st.resume_data.take().unwrap_or_default();
                            st.phase = TPhase::DataIn;
                            st.after_in = TPhase::Status;
                            st.req = true;
                        }
                        next => {
                            st.phase = next;
                            st.req = true;
                        }
                    }
                } else {
                    st.req = true;
                }
            }
            TPhase::BusFree => {}
        }
    }

    fn to_bus_free(&self, st: &mut BusState) {
        st.phase = TPhase::BusFree;
        st.bsy = false;
        st.req = false;
        st.sel = false;
        st.io_resel = false;
    }

    fn reset_bus(&self, st: &mut BusState) {
        self.to_bus_free(st);
        st.pending = None;
        st.resuming = None;
        st.msgout.clear();
        st.cdb.clear();
        st.in_queue.clear();
    }
}

fn read_len(cdb: &[u8]) -> usize {
    match cdb[0] {
        READ_6 => {
            let blocks = cdb[4] as usize;
            (if blocks == 0 { 256 } else { blocks }) * 512
        }
        READ_10 => usize::from(u16::from_be_bytes([cdb[7], cdb[8]])) * 512,
        REQUEST_SENSE => cdb[4] as usize,
        _ => 0,
    }
}

fn write_len(cdb: &[u8]) -> usize {
    match cdb[0] {
        WRITE_6 => {
            let blocks = cdb[4] as usize;
            (if blocks == 0 { 256 } else { blocks }) * 512
        }
        WRITE_10 => usize::from(u16::from_be_bytes([cdb[7], cdb[8]])) * 512,
        _ => 0,
    }
}

impl BusPort for MockBus {
    fn read(&self, reg: u8) -> u8 {
        let st = self.st.lock();
        match reg {
            STATUS_REG => {
                let mut sr = 0u8;
                if st.bsy {
                    sr |= SR_BSY;
                }
                if st.req {
                    sr |= SR_REQ;
                }
                if st.sel {
                    sr |= SR_SEL;
                }
                if st.io_resel {
                    sr |= SR_IO;
                }
                sr |= match st.phase {
                    TPhase::MsgOut => SR_MSG | SR_CD,
                    TPhase::CmdOut => SR_CD,
                    TPhase::DataIn => SR_IO,
                    TPhase::DataOut => 0,
                    TPhase::Status => SR_CD | SR_IO,
                    TPhase::MsgIn => SR_MSG | SR_CD | SR_IO,
                    TPhase::BusFree => 0,
                };
                sr
            }
            INITIATOR_COMMAND_REG => st.icr_readback,
            INPUT_DATA_REG => {
                if st.sel && st.io_resel {
                    return st.current_data;
                }
                match st.phase {
                    TPhase::DataIn | TPhase::MsgIn => st.in_queue.front().copied().unwrap_or(0),
                    TPhase::Status => st.status_byte,
                    _ => st.current_data,
                }
            }
            _ => 0,
        }
    }

    fn write(&self, reg: u8, val: u8) {
        let mut st = self.st.lock();
        match reg {
            OUTPUT_DATA_REG => st.out_data = val,
            TARGET_COMMAND_REG => {}
            SELECT_ENABLE_REG => st.sel_enable = val,
            MODE_REG => {
                if val & MR_ARBITRATE != 0 {
                    // Arbitration always completes and is never lost.
                    st.icr_readback |= ICR_ARBITRATION_PROGRESS;
                } else {
                    st.icr_readback &= !ICR_ARBITRATION_PROGRESS;
                }
            }
            INITIATOR_COMMAND_REG => {
                let prev = st.prev_icr;
                st.prev_icr = val;
                st.icr_readback = (st.icr_readback & ICR_ARBITRATION_PROGRESS) | val;

                if val & ICR_ASSERT_RST != 0 {
                    self.reset_bus(&mut st);
                    return;
                }

                // Selection: SEL stays up while the initiator stops
                // driving BSY.
                if prev & (ICR_ASSERT_SEL | ICR_ASSERT_BSY) == (ICR_ASSERT_SEL | ICR_ASSERT_BSY)
                    && val & ICR_ASSERT_SEL != 0
                    && val & ICR_ASSERT_BSY == 0
                {
                    // The data bus carries the initiator's ID and the
                    // target's; answer if one of ours is addressed.
                    let bits = st.out_data;
                    let targets = self.targets.lock();
                    for id in 0..8u8 {
                        if bits & (1 << id) != 0 && targets.iter().any(|(t, _)| *t == id) {
                            st.selected_target = id;
                            st.bsy = true;
                            st.phase = TPhase::MsgOut;
                            st.msgout.clear();
                            st.req = true;
                            break;
                        }
                    }
                    return;
                }

                // Reselection response: initiator asserts BSY while we
                // drive SEL.
                if st.sel && st.io_resel && val & ICR_ASSERT_BSY != 0 {
                    st.sel = false;
                    st.io_resel = false;
                    st.bsy = true;
                    if let Some(resume) = st.resuming.take() {
                        let mut msgs = alloc::vec![IDENTIFY_BASE | (resume.lun & 7)];
                        if resume.tag != 0 {
                            msgs.push(SIMPLE_QUEUE_TAG);
                            msgs.push(resume.tag);
                        }
                        st.in_queue = msgs.into();
                        st.phase = TPhase::MsgIn;
                        st.req = true;
                        st.selected_target = resume.target;
                        st.selected_lun = resume.lun;
                        st.current_tag = resume.tag;
                        st.status_byte = resume.script.status;
                        // The saved script resumes after the identify.
                        if let Some(data) = resume.script.data_in {
                            st.after_in = TPhase::DataIn;
                            st.resume_data = Some(data.into());
                        } else {
                            st.after_in = TPhase::Status;
                        }
                    }
                    return;
                }

                // REQ/ACK handshake edges.
                let ack_rise = prev & ICR_ASSERT_ACK == 0 && val & ICR_ASSERT_ACK != 0;
                let ack_fall = prev & ICR_ASSERT_ACK != 0 && val & ICR_ASSERT_ACK == 0;
                if ack_rise && st.req {
                    let out_data = st.out_data;
                    match st.phase {
                        TPhase::MsgOut => st.msgout.push(out_data),
                        TPhase::CmdOut => st.cdb.push(out_data),
                        TPhase::DataOut => st.data_out.push(out_data),
                        TPhase::DataIn | TPhase::MsgIn => {
                            st.in_queue.pop_front();
                        }
                        TPhase::Status => {}
                        TPhase::BusFree => {}
                    }
                    st.req = false;
                }
                if ack_fall {
                    let atn = val & ICR_ASSERT_ATN != 0;
                    self.ack_fall(&mut st, atn);
                }
            }
            _ => {}
        }
    }
}
