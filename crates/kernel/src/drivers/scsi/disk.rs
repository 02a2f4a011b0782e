// Disk client surface: capacity probe, geometry, sector I/O, and
// media-change revalidation.

use core::sync::atomic::Ordering;

use crate::drivers::scsi::{
    self, allocate_device, device, release_cmd, scsi_cmd_wait, BiosGeometry, DataSeg, ScsiData,
    READ_10, READ_CAPACITY, WRITE_10,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::kinfo;

const SD_TIMEOUT: u64 = 300;
const SD_RETRIES: u32 = 5;

fn is_disk(type_code: i32) -> bool {
    matches!(
        type_code,
        device::TYPE_DISK | device::TYPE_MOD | device::TYPE_ROM | device::TYPE_WORM
    )
}

/// READ CAPACITY: record the size in sectors.
pub fn sd_read_capacity(k: &Kernel, dev_index: usize) -> Result<u32> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let cdb = [READ_CAPACITY, dev.lun << 5, 0, 0, 0, 0, 0, 0, 0, 0];
    let cmd = allocate_device(k, dev_index, true)?;
    let data = ScsiData::Single(DataSeg::new(0, alloc::vec![0u8; 8]));
    let result = scsi_cmd_wait(k, &cmd, &cdb, data, SD_TIMEOUT, SD_RETRIES);
    let capacity = {
        let mut st = cmd.state.lock();
        match &mut st.data {
            ScsiData::Single(seg) if seg.data.len() >= 4 => u32::from_be_bytes([
                seg.data[0],
                seg.data[1],
                seg.data[2],
                seg.data[3],
            ])
            .wrapping_add(1),
            _ => 0,
        }
    };
    release_cmd(k, &cmd);
    if result != 0 {
        return Err(Errno::EIO);
    }
    dev.capacity.store(capacity as i32, Ordering::Release);
    Ok(capacity)
}

/// Open: bump the access count; changed removable media force a
/// revalidation before any transfer goes through.
pub fn sd_open(k: &Kernel, dev_index: usize) -> Result<()> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    if !is_disk(dev.type_code()) {
        return Err(Errno::ENODEV);
    }
    if dev.removable.load(Ordering::Acquire) && dev.changed.load(Ordering::Acquire) {
        // Re-read the size (standing in for the partition re-read) and
        // clear the change condition.
        kinfo!("scsi : revalidating changed medium at index {}", dev_index);
        sd_read_capacity(k, dev_index)?;
        dev.changed.store(false, Ordering::Release);
    }
    dev.access_count.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

pub fn sd_release(k: &Kernel, dev_index: usize) {
    if let Some(dev) = k.scsi.device(dev_index) {
        dev.access_count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn sd_geometry(k: &Kernel, dev_index: usize) -> Result<BiosGeometry> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let host = k.scsi.host(dev.host).ok_or(Errno::ENODEV)?;
    Ok(host
        .driver
        .bios_param(dev.capacity.load(Ordering::Acquire).max(0) as u64))
}

fn sd_rw(
    k: &Kernel,
    dev_index: usize,
    write: bool,
    block: u32,
    data: alloc::vec::Vec<u8>,
) -> Result<alloc::vec::Vec<u8>> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    if !is_disk(dev.type_code()) {
        return Err(Errno::ENODEV);
    }
    // A pending media change fails I/O until the next open.
    if dev.changed.load(Ordering::Acquire) {
        return Err(Errno::ENOMEDIUM);
    }
    if write && !dev.writeable.load(Ordering::Acquire) {
        return Err(Errno::EACCES);
    }
    let sectors = (data.len() / 512) as u16;
    if sectors == 0 || data.len() % 512 != 0 {
        return Err(Errno::EINVAL);
    }
    let opcode = if write { WRITE_10 } else { READ_10 };
    let b = block.to_be_bytes();
    let s = sectors.to_be_bytes();
    let cdb = [opcode, dev.lun << 5, b[0], b[1], b[2], b[3], 0, s[0], s[1], 0];
    let cmd = allocate_device(k, dev_index, true)?;
    let result = scsi_cmd_wait(
        k,
        &cmd,
        &cdb,
        ScsiData::Single(DataSeg::new(0, data)),
        SD_TIMEOUT,
        SD_RETRIES,
    );
    let out = {
        let mut st = cmd.state.lock();
        match core::mem::replace(&mut st.data, ScsiData::None) {
            ScsiData::Single(seg) => seg.data,
            _ => alloc::vec::Vec::new(),
        }
    };
    release_cmd(k, &cmd);
    if result != 0 {
        // A unit attention latched by the retry machinery surfaces as
        // missing media.
        if scsi::driver_byte(result) & scsi::DRIVER_SENSE != 0
            && dev.changed.load(Ordering::Acquire)
        {
            return Err(Errno::ENOMEDIUM);
        }
        return Err(Errno::EIO);
    }
    Ok(out)
}

pub fn sd_read(k: &Kernel, dev_index: usize, block: u32, sectors: usize) -> Result<alloc::vec::Vec<u8>> {
    sd_rw(k, dev_index, false, block, alloc::vec![0u8; sectors * 512])
}

pub fn sd_write(k: &Kernel, dev_index: usize, block: u32, data: alloc::vec::Vec<u8>) -> Result<()> {
    sd_rw(k, dev_index, true, block, data).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{mock_kernel, MockHost, ScriptedOutcome};
    use crate::drivers::scsi::{scan_scsis, scsi_register_host};
    use alloc::sync::Arc;

    fn setup() -> (Arc<crate::Kernel>, Arc<MockHost>) {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        scsi_register_host(&k, host.clone());
        scan_scsis(&k);
        (k, host)
    }

    #[test]
    fn test_read_write_round() {
        let (k, host) = setup();
        let data = sd_read(&k, 0, 0, 1).unwrap();
        assert_eq!(data.len(), 512);
        assert_eq!(data[5], 5);
        let payload = alloc::vec![0x5Au8; 512];
        sd_write(&k, 0, 8, payload.clone()).unwrap();
        assert_eq!(host.written.lock().last().unwrap(), &payload);
    }

    #[test]
    fn test_capacity_and_geometry() {
        let (k, host) = setup();
        host.push(ScriptedOutcome::good().with_data(alloc::vec![0, 0, 0x3f, 0xff, 0, 0, 2, 0]));
        let cap = sd_read_capacity(&k, 0).unwrap();
        assert_eq!(cap, 0x4000);
        let geom = sd_geometry(&k, 0).unwrap();
        assert_eq!(geom.heads, 64);
        assert_eq!(geom.sectors, 32);
        assert_eq!(geom.cylinders, 0x4000 / (64 * 32));
    }

    #[test]
    fn test_media_change_blocks_io_until_open() {
        let (k, _host) = setup();
        let dev = k.scsi.device(0).unwrap();
        dev.removable.store(true, Ordering::Release);
        dev.changed.store(true, Ordering::Release);
        assert_eq!(sd_read(&k, 0, 0, 1).err(), Some(Errno::ENOMEDIUM));
        sd_open(&k, 0).unwrap();
        assert!(!dev.changed.load(Ordering::Acquire));
        assert!(sd_read(&k, 0, 0, 1).is_ok());
        sd_release(&k, 0);
    }

    #[test]
    fn test_bad_lengths_rejected() {
        let (k, _host) = setup();
        assert_eq!(
            sd_write(&k, 0, 0, alloc::vec![0u8; 100]).err(),
            Some(Errno::EINVAL)
        );
    }
}
