// The SCSI ioctl surface shared by every upper-level client.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::drivers::scsi::{
    self, allocate_device, command_size, device, release_cmd, scsi_cmd_wait, DataSeg, ScsiCmd,
    ScsiData, ALLOW_MEDIUM_REMOVAL, ILLEGAL_REQUEST, NOT_READY, START_STOP, TEST_UNIT_READY,
    UNIT_ATTENTION,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::{kinfo, kwarn};

pub const MAX_RETRIES: u32 = 5;
pub const MAX_TIMEOUT: u64 = 200;
/// SEND_COMMAND payloads are bounded by one pool page run.
pub const MAX_BUF: usize = 4096;

/// SCSI_IOCTL_SEND_COMMAND block: lengths, CDB, and the shared payload
/// area. On failure the sense buffer lands in `data`.
pub struct SendCommandBlock {
    pub inlen: usize,
    pub outlen: usize,
    pub cdb: Vec<u8>,
    pub data: Vec<u8>,
}

pub enum ScsiIoctl<'a> {
    ProbeHost(&'a mut Vec<u8>),
    SendCommand(&'a mut SendCommandBlock),
    TestUnitReady,
    DoorLock,
    DoorUnlock,
    GetIdlun(&'a mut u32),
    TaggedEnable,
    TaggedDisable,
}

/// Issue a six-byte housekeeping command and absorb the benign sense
/// conditions.
pub fn ioctl_internal_command(k: &Kernel, dev_index: usize, cdb: &[u8]) -> Result<u32> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let cmd = allocate_device(k, dev_index, true)?;
    let mut result = scsi_cmd_wait(k, &cmd, cdb, ScsiData::None, MAX_TIMEOUT, MAX_RETRIES);
    if scsi::driver_byte(result) != 0 {
        let key = cmd.state.lock().sense_buffer[2] & 0x0f;
        match key {
            ILLEGAL_REQUEST => {
                if cdb[0] == ALLOW_MEDIUM_REMOVAL {
                    dev.lockable.store(false, Ordering::Release);
                } else {
                    kwarn!("scsi (ioctl) : device reports ILLEGAL REQUEST");
                }
            }
            NOT_READY => {
                if dev.removable.load(Ordering::Acquire) {
                    kinfo!("scsi : device not ready, no medium?");
                }
            }
            UNIT_ATTENTION => {
                if dev.removable.load(Ordering::Acquire) {
                    dev.changed.store(true, Ordering::Release);
                    // No longer considered an error.
                    result = 0;
                    cmd.state.lock().result = 0;
                    kinfo!("scsi : disc change detected");
                }
            }
            _ => {
                kwarn!(
                    "scsi : ioctl error on host {} id {} lun {}, result {:#x}",
                    dev.host,
                    dev.id,
                    dev.lun,
                    result
                );
            }
        }
    }
    release_cmd(k, &cmd);
    Ok(result)
}

fn ioctl_send_command(k: &Kernel, dev_index: usize, blk: &mut SendCommandBlock) -> Result<u32> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    if blk.cdb.is_empty() {
        return Err(Errno::EINVAL);
    }
    let cmdlen = command_size(blk.cdb[0]);
    if blk.cdb.len() < cmdlen {
        return Err(Errno::EINVAL);
    }
    let needed = blk.inlen.max(blk.outlen);
    let needed = if needed > 0 {
        ((needed + 511) & !511).min(MAX_BUF)
    } else {
        0
    };
    let mut cdb = blk.cdb[..cmdlen].to_vec();
    cdb[1] = (cdb[1] & 0x1f) | (dev.lun << 5);

    let mut payload = alloc::vec![0u8; needed];
    let n = blk.inlen.min(needed).min(blk.data.len());
    payload[..n].copy_from_slice(&blk.data[..n]);

    let cmd = allocate_device(k, dev_index, true)?;
    let data = if needed > 0 {
        ScsiData::Single(DataSeg::new(0, payload))
    } else {
        ScsiData::None
    };
    let result = scsi_cmd_wait(k, &cmd, &cdb, data, MAX_TIMEOUT, MAX_RETRIES);
    if result != 0 {
        // Pass the sense information back in the payload area.
        let sense = cmd.state.lock().sense_buffer;
        blk.data = sense.to_vec();
    } else {
        let mut st = cmd.state.lock();
        blk.data = match &mut st.data {
            ScsiData::Single(seg) => {
                let keep = blk.outlen.min(seg.data.len());
                seg.data[..keep].to_vec()
            }
            _ => Vec::new(),
        };
    }
    release_cmd(k, &cmd);
    Ok(result)
}

/// The numbered ioctl surface. SEND_COMMAND is privileged.
pub fn scsi_ioctl(k: &Kernel, dev_index: usize, cmd: &mut ScsiIoctl<'_>) -> Result<isize> {
    let dev: Arc<device::ScsiDevice> = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    match cmd {
        ScsiIoctl::GetIdlun(out) => {
            **out = u32::from(dev.id)
                | (u32::from(dev.lun) << 8)
                | ((dev.host as u32) << 16);
            Ok(0)
        }
        ScsiIoctl::TaggedEnable => {
            if !k.sched.current().suser {
                return Err(Errno::EACCES);
            }
            if dev.scsi_level.load(Ordering::Acquire) < device::SCSI_2
                || !dev.tagged_supported.load(Ordering::Acquire)
            {
                return Err(Errno::EINVAL);
            }
            dev.tagged_queue.store(true, Ordering::Release);
            dev.current_tag.store(1, Ordering::Release);
            Ok(0)
        }
        ScsiIoctl::TaggedDisable => {
            if !k.sched.current().suser {
                return Err(Errno::EACCES);
            }
            dev.tagged_queue.store(false, Ordering::Release);
            dev.current_tag.store(0, Ordering::Release);
            Ok(0)
        }
        ScsiIoctl::ProbeHost(out) => {
            let host = k.scsi.host(dev.host).ok_or(Errno::ENODEV)?;
            **out = host.driver.info().as_bytes().to_vec();
            Ok(1)
        }
        ScsiIoctl::SendCommand(blk) => {
            if !k.sched.current().suser {
                return Err(Errno::EPERM);
            }
            let result = ioctl_send_command(k, dev_index, blk)?;
            Ok(result as isize)
        }
        ScsiIoctl::DoorLock | ScsiIoctl::DoorUnlock => {
            if !dev.removable.load(Ordering::Acquire) {
                return Err(Errno::EINVAL);
            }
            let lock = matches!(cmd, ScsiIoctl::DoorLock);
            let cdb = [
                ALLOW_MEDIUM_REMOVAL,
                dev.lun << 5,
                0,
                0,
                u8::from(lock),
                0,
            ];
            let result = ioctl_internal_command(k, dev_index, &cdb)?;
            if result != 0 {
                return Err(Errno::EIO);
            }
            Ok(0)
        }
        ScsiIoctl::TestUnitReady => {
            let cdb = [TEST_UNIT_READY, dev.lun << 5, 0, 0, 0, 0];
            let result = ioctl_internal_command(k, dev_index, &cdb)?;
            Ok(if result == 0 { 0 } else { 1 })
        }
    }
}

/// Spin a removable unit up or down (used by the disk client).
pub fn scsi_start_stop(k: &Kernel, dev_index: usize, start: bool) -> Result<()> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let cdb = [START_STOP, dev.lun << 5, 0, 0, u8::from(start), 0];
    let result = ioctl_internal_command(k, dev_index, &cdb)?;
    if result != 0 {
        return Err(Errno::EIO);
    }
    Ok(())
}
