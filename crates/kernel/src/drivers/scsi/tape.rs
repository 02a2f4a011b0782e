// Tape client surface: the MTIOCTOP operation family, status queries,
// and end-of-medium semantics (ENOSPC on write at EOM, EIO afterwards
// until rewound).

use alloc::collections::BTreeMap;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::drivers::scsi::{
    self, allocate_device, device, release_cmd, scsi_cmd_wait, DataSeg, ScsiData, ERASE,
    MODE_SELECT, READ_6, SPACE, VOLUME_OVERFLOW, WRITE_6, WRITE_FILEMARKS,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};

const ST_TIMEOUT: u64 = 900;
const ST_LONG_TIMEOUT: u64 = 14000;
const ST_RETRIES: u32 = 3;

/// Tape REWIND opcode.
pub const REWIND: u8 = 0x01;
/// SCSI-2 LOCATE opcode for MTSEEK.
pub const LOCATE: u8 = 0x2b;

/// MTIOCTOP sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtOp {
    Rew,
    Fsf,
    Bsf,
    Fsr,
    Bsr,
    Weof,
    Eom,
    Erase,
    Seek,
    SetBlk,
    SetDensity,
    SetDrvBuffer,
}

/// MTIOCGET report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtGet {
    pub mt_type: u32,
    pub mt_resid: i32,
    pub mt_dsreg: u32,
    pub mt_gstat: u32,
    pub mt_erreg: u32,
    pub mt_fileno: i32,
    pub mt_blkno: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TapeStatus {
    pub file_no: i32,
    pub block_no: i32,
    pub block_size: u32,
    pub density: u8,
    pub drv_buffer: u8,
    pub at_eom: bool,
    pub last_sense: u8,
}

/// Per-tape state, keyed by device index.
pub struct TapeState {
    tapes: Mutex<BTreeMap<usize, TapeStatus>>,
}

impl TapeState {
    pub fn new() -> Self {
        Self {
            tapes: Mutex::new(BTreeMap::new()),
        }
    }

    fn with<R>(&self, dev_index: usize, f: impl FnOnce(&mut TapeStatus) -> R) -> R {
        let mut tapes = self.tapes.lock();
        f(tapes.entry(dev_index).or_default())
    }
}

impl Default for TapeState {
    fn default() -> Self {
        Self::new()
    }
}

fn tape_dev(k: &Kernel, dev_index: usize) -> Result<()> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    if dev.type_code() != device::TYPE_TAPE {
        return Err(Errno::ENODEV);
    }
    Ok(())
}

fn issue(
    k: &Kernel,
    dev_index: usize,
    cdb: &[u8],
    data: ScsiData,
    timeout: u64,
) -> Result<(u32, [u8; scsi::SENSE_BUFFER_SIZE], ScsiData)> {
    let cmd = allocate_device(k, dev_index, true)?;
    let result = scsi_cmd_wait(k, &cmd, cdb, data, timeout, ST_RETRIES);
    let (sense, data) = {
        let mut st = cmd.state.lock();
        (
            st.sense_buffer,
            core::mem::replace(&mut st.data, ScsiData::None),
        )
    };
    release_cmd(k, &cmd);
    Ok((result, sense, data))
}

fn count_bytes(count: i32) -> [u8; 3] {
    let c = count.to_be_bytes();
    [c[1], c[2], c[3]]
}

/// Execute one MTIOCTOP sub-command.
pub fn st_mtioctop(k: &Kernel, dev_index: usize, op: MtOp, count: i32) -> Result<()> {
    tape_dev(k, dev_index)?;
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let lun5 = dev.lun << 5;
    let c = count_bytes(count);
    let (cdb, timeout): ([u8; 6], u64) = match op {
        MtOp::Rew => ([REWIND, lun5, 0, 0, 0, 0], ST_LONG_TIMEOUT),
        MtOp::Fsf => ([SPACE, lun5 | 1, c[0], c[1], c[2], 0], ST_LONG_TIMEOUT),
        MtOp::Bsf => {
            let c = count_bytes(-count);
            ([SPACE, lun5 | 1, c[0], c[1], c[2], 0], ST_LONG_TIMEOUT)
        }
        MtOp::Fsr => ([SPACE, lun5, c[0], c[1], c[2], 0], ST_TIMEOUT),
        MtOp::Bsr => {
            let c = count_bytes(-count);
            ([SPACE, lun5, c[0], c[1], c[2], 0], ST_TIMEOUT)
        }
        MtOp::Weof => ([WRITE_FILEMARKS, lun5, c[0], c[1], c[2], 0], ST_TIMEOUT),
        MtOp::Eom => ([SPACE, lun5 | 3, 0, 0, 0, 0], ST_LONG_TIMEOUT),
        MtOp::Erase => ([ERASE, lun5 | 1, 0, 0, 0, 0], ST_LONG_TIMEOUT),
        MtOp::Seek => {
            let b = (count as u32).to_be_bytes();
            // LOCATE is a 10-byte CDB; issued separately below.
            let cdb10 = [LOCATE, lun5, 0, b[0], b[1], b[2], b[3], 0, 0, 0];
            let (result, sense, _) =
                issue(k, dev_index, &cdb10, ScsiData::None, ST_LONG_TIMEOUT)?;
            return finish_op(k, dev_index, op, count, result, sense);
        }
        MtOp::SetBlk | MtOp::SetDensity | MtOp::SetDrvBuffer => {
            // MODE SELECT with a block-descriptor page.
            let mut page = alloc::vec![0u8; 12];
            let st = k.scsi.tapes.with(dev_index, |t| *t);
            let blk = match op {
                MtOp::SetBlk => count as u32,
                _ => st.block_size,
            };
            let density = match op {
                MtOp::SetDensity => count as u8,
                _ => st.density,
            };
            if matches!(op, MtOp::SetDrvBuffer) {
                page[2] = ((count as u8) & 7) << 4;
            }
            page[3] = 8;
            page[4] = density;
            let b = blk.to_be_bytes();
            page[9] = b[1];
            page[10] = b[2];
            page[11] = b[3];
            let cdb6 = [MODE_SELECT, lun5, 0, 0, 12, 0];
            let (result, sense, _) = issue(
                k,
                dev_index,
                &cdb6,
                ScsiData::Single(DataSeg::new(0, page)),
                ST_TIMEOUT,
            )?;
            return finish_op(k, dev_index, op, count, result, sense);
        }
    };
    let (result, sense, _) = issue(k, dev_index, &cdb, ScsiData::None, timeout)?;
    finish_op(k, dev_index, op, count, result, sense)
}

fn finish_op(
    k: &Kernel,
    dev_index: usize,
    op: MtOp,
    count: i32,
    result: u32,
    sense: [u8; scsi::SENSE_BUFFER_SIZE],
) -> Result<()> {
    if result != 0 {
        k.scsi.tapes.with(dev_index, |t| t.last_sense = sense[2] & 0x0f);
        return Err(Errno::EIO);
    }
    k.scsi.tapes.with(dev_index, |t| {
        t.last_sense = 0;
        match op {
            MtOp::Rew => {
                t.file_no = 0;
                t.block_no = 0;
                t.at_eom = false;
            }
            MtOp::Fsf => {
                t.file_no += count;
                t.block_no = 0;
            }
            MtOp::Bsf => {
                t.file_no -= count;
                t.block_no = 0;
            }
            MtOp::Fsr => t.block_no += count,
            MtOp::Bsr => t.block_no -= count,
            MtOp::Weof => {
                t.file_no += count;
                t.block_no = 0;
            }
            MtOp::Eom => {
                t.file_no = -1;
                t.block_no = -1;
            }
            MtOp::Erase => {
                t.file_no = 0;
                t.block_no = 0;
                t.at_eom = false;
            }
            MtOp::Seek => t.block_no = count,
            MtOp::SetBlk => t.block_size = count as u32,
            MtOp::SetDensity => t.density = count as u8,
            MtOp::SetDrvBuffer => t.drv_buffer = count as u8,
        }
    });
    Ok(())
}

/// MTIOCGET.
pub fn st_get_status(k: &Kernel, dev_index: usize) -> Result<MtGet> {
    tape_dev(k, dev_index)?;
    Ok(k.scsi.tapes.with(dev_index, |t| MtGet {
        mt_type: 1,
        mt_resid: 0,
        mt_dsreg: t.block_size,
        mt_gstat: if t.at_eom { 1 << 2 } else { 0 },
        mt_erreg: u32::from(t.last_sense) << 16,
        mt_fileno: t.file_no,
        mt_blkno: t.block_no,
    }))
}

/// MTIOCPOS: current block number.
pub fn st_get_position(k: &Kernel, dev_index: usize) -> Result<i32> {
    tape_dev(k, dev_index)?;
    Ok(k.scsi.tapes.with(dev_index, |t| t.block_no))
}

/// Fixed-block read.
pub fn st_read(k: &Kernel, dev_index: usize, blocks: u32) -> Result<alloc::vec::Vec<u8>> {
    tape_dev(k, dev_index)?;
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    // Past the end of medium, everything fails until a rewind.
    if k.scsi.tapes.with(dev_index, |t| t.at_eom) {
        return Err(Errno::EIO);
    }
    let bs = k.scsi.tapes.with(dev_index, |t| t.block_size.max(512));
    let b = blocks.to_be_bytes();
    let cdb = [READ_6, (dev.lun << 5) | 1, b[1], b[2], b[3], 0];
    let len = (blocks * bs) as usize;
    let (result, _sense, data) = issue(
        k,
        dev_index,
        &cdb,
        ScsiData::Single(DataSeg::new(0, alloc::vec![0u8; len])),
        ST_TIMEOUT,
    )?;
    if result != 0 {
        return Err(Errno::EIO);
    }
    k.scsi.tapes.with(dev_index, |t| t.block_no += blocks as i32);
    match data {
        ScsiData::Single(seg) => Ok(seg.data),
        _ => Ok(alloc::vec::Vec::new()),
    }
}

/// Fixed-block write; end-of-medium surfaces as ENOSPC.
pub fn st_write(k: &Kernel, dev_index: usize, data: alloc::vec::Vec<u8>) -> Result<usize> {
    tape_dev(k, dev_index)?;
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    if k.scsi.tapes.with(dev_index, |t| t.at_eom) {
        return Err(Errno::ENOSPC);
    }
    let bs = k.scsi.tapes.with(dev_index, |t| t.block_size.max(512));
    let blocks = (data.len() as u32) / bs;
    if blocks == 0 {
        return Err(Errno::EINVAL);
    }
    let n = data.len();
    let b = blocks.to_be_bytes();
    let cdb = [WRITE_6, (dev.lun << 5) | 1, b[1], b[2], b[3], 0];
    let (result, sense, _) = issue(
        k,
        dev_index,
        &cdb,
        ScsiData::Single(DataSeg::new(0, data)),
        ST_TIMEOUT,
    )?;
    if result != 0 {
        // EOM shows as VOLUME OVERFLOW or the EOM bit in the sense
        // data.
        let key = sense[2] & 0x0f;
        let eom_bit = sense[2] & 0x40 != 0;
        if key == VOLUME_OVERFLOW || eom_bit {
            k.scsi.tapes.with(dev_index, |t| t.at_eom = true);
            return Err(Errno::ENOSPC);
        }
        return Err(Errno::EIO);
    }
    k.scsi.tapes.with(dev_index, |t| t.block_no += blocks as i32);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::host::{mock_inquiry, valid_sense};
    use crate::drivers::mock::{mock_kernel, MockHost, ScriptedOutcome};
    use crate::drivers::scsi::{scan_scsis, scsi_register_host};
    use alloc::sync::Arc;

    fn setup_tape() -> (Arc<crate::Kernel>, Arc<MockHost>) {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        // The scan's INQUIRY reports a sequential-access device.
        host.push(ScriptedOutcome::good()); // TEST UNIT READY
        host.push(ScriptedOutcome::good().with_data(mock_inquiry(false, false, 1)));
        scsi_register_host(&k, host.clone());
        scan_scsis(&k);
        (k, host)
    }

    #[test]
    fn test_scan_detects_tape() {
        let (k, _host) = setup_tape();
        let dev = k.scsi.device(0).unwrap();
        assert_eq!(dev.type_code(), device::TYPE_TAPE);
    }

    #[test]
    fn test_mtioctop_bookkeeping() {
        let (k, _host) = setup_tape();
        st_mtioctop(&k, 0, MtOp::Fsf, 2).unwrap();
        st_mtioctop(&k, 0, MtOp::Fsr, 5).unwrap();
        let get = st_get_status(&k, 0).unwrap();
        assert_eq!(get.mt_fileno, 2);
        assert_eq!(get.mt_blkno, 5);
        assert_eq!(st_get_position(&k, 0).unwrap(), 5);
        st_mtioctop(&k, 0, MtOp::Rew, 1).unwrap();
        let get = st_get_status(&k, 0).unwrap();
        assert_eq!((get.mt_fileno, get.mt_blkno), (0, 0));
    }

    #[test]
    fn test_eom_write_gives_enospc_until_rewind() {
        let (k, host) = setup_tape();
        host.push(ScriptedOutcome {
            result: crate::drivers::scsi::make_result(
                crate::drivers::scsi::CHECK_CONDITION,
                0,
                crate::drivers::scsi::DID_OK,
                crate::drivers::scsi::DRIVER_SENSE,
            ),
            data: None,
        });
        // The failing write carries EOM sense.
        {
            let mut sense = valid_sense(VOLUME_OVERFLOW, 0);
            sense[2] |= 0x40;
            *host.current_sense.lock() = sense;
        }
        // Prime the sense delivered by the follow-up REQUEST SENSE.
        host.push(ScriptedOutcome::good().with_data({
            let mut s = valid_sense(VOLUME_OVERFLOW, 0).to_vec();
            s[2] |= 0x40;
            s
        }));
        let r = st_write(&k, 0, alloc::vec![0u8; 512]);
        assert_eq!(r.err(), Some(Errno::ENOSPC));
        // Until a rewind, writes keep failing without touching the
        // bus.
        let calls_before = host.call_log.lock().len();
        assert_eq!(
            st_write(&k, 0, alloc::vec![0u8; 512]).err(),
            Some(Errno::ENOSPC)
        );
        assert_eq!(host.call_log.lock().len(), calls_before);
        st_mtioctop(&k, 0, MtOp::Rew, 1).unwrap();
        assert!(st_write(&k, 0, alloc::vec![0u8; 512]).is_ok());
    }

    #[test]
    fn test_setblk_changes_block_size() {
        let (k, _host) = setup_tape();
        st_mtioctop(&k, 0, MtOp::SetBlk, 1024).unwrap();
        let get = st_get_status(&k, 0).unwrap();
        assert_eq!(get.mt_dsreg, 1024);
    }
}
