// SCSI-generic pass-through. User space writes a packet (header, CDB,
// outbound data) and reads the same header back followed by the reply.
// One big bounce buffer is shared across the driver, guarded by a
// single-slot wait queue.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::drivers::scsi::{
    self, allocate_device, command_size, release_cmd, scsi_cmd_wait, DataSeg, ScsiData,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::WaitQueue;

/// The shared transfer buffer size, fixed at build time.
pub const SG_BIG_BUFF: usize = 32768;

pub const SG_DEFAULT_TIMEOUT: u64 = 6000;
pub const SG_DEFAULT_RETRIES: u32 = 1;

pub const SG_HEADER_SIZE: usize = 16;

/// The packet header, carried in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgHeader {
    /// Length of the incoming packet, header included.
    pub pack_len: u32,
    /// Maximum expected reply length.
    pub reply_len: u32,
    /// Caller's packet id, echoed back.
    pub pack_id: u32,
    /// 0 on success, otherwise an errno value.
    pub result: u32,
}

impl SgHeader {
    pub fn to_bytes(self) -> [u8; SG_HEADER_SIZE] {
        let mut out = [0u8; SG_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.pack_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.reply_len.to_le_bytes());
        out[8..12].copy_from_slice(&self.pack_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.result.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SG_HEADER_SIZE {
            return None;
        }
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Some(Self {
            pack_len: word(0),
            reply_len: word(4),
            pack_id: word(8),
            result: word(12),
        })
    }
}

struct Pending {
    header: SgHeader,
    reply: Vec<u8>,
}

struct PerDevice {
    exclusive: bool,
    open_count: u32,
    timeout: u64,
    pending: Option<Pending>,
}

impl Default for PerDevice {
    fn default() -> Self {
        Self {
            exclusive: false,
            open_count: 0,
            timeout: SG_DEFAULT_TIMEOUT,
            pending: None,
        }
    }
}

/// Driver-wide state living on the ScsiCore.
pub struct SgState {
    big_buff_in_use: AtomicBool,
    pub big_buff_wait: WaitQueue,
    per_dev: Mutex<Vec<PerDevice>>,
    pub read_wait: WaitQueue,
}

impl SgState {
    pub fn new() -> Self {
        Self {
            big_buff_in_use: AtomicBool::new(false),
            big_buff_wait: WaitQueue::new(),
            per_dev: Mutex::new(Vec::new()),
            read_wait: WaitQueue::new(),
        }
    }
}

impl Default for SgState {
    fn default() -> Self {
        Self::new()
    }
}

fn with_dev<R>(k: &Kernel, dev_index: usize, f: impl FnOnce(&mut PerDevice) -> R) -> R {
    let mut per = k.scsi.sg.per_dev.lock();
    while per.len() <= dev_index {
        per.push(PerDevice::default());
    }
    f(&mut per[dev_index])
}

pub fn sg_open(k: &Kernel, dev_index: usize, exclusive: bool) -> Result<()> {
    k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    with_dev(k, dev_index, |d| {
        if d.exclusive || (exclusive && d.open_count > 0) {
            return Err(Errno::EBUSY);
        }
        d.exclusive = exclusive;
        d.open_count += 1;
        Ok(())
    })
}

pub fn sg_release(k: &Kernel, dev_index: usize) {
    with_dev(k, dev_index, |d| {
        d.open_count = d.open_count.saturating_sub(1);
        if d.open_count == 0 {
            d.exclusive = false;
        }
    });
}

pub fn sg_set_timeout(k: &Kernel, dev_index: usize, timeout: u64) {
    with_dev(k, dev_index, |d| d.timeout = timeout);
}

pub fn sg_get_timeout(k: &Kernel, dev_index: usize) -> u64 {
    with_dev(k, dev_index, |d| d.timeout)
}

/// Grab the shared buffer, sleeping in line for the single slot.
fn claim_big_buff(k: &Kernel) -> Result<()> {
    while k.scsi.sg.big_buff_in_use.swap(true, Ordering::AcqRel) {
        k.sched.interruptible_sleep_on(&k.scsi.sg.big_buff_wait)?;
    }
    Ok(())
}

fn release_big_buff(k: &Kernel) {
    k.scsi.sg.big_buff_in_use.store(false, Ordering::Release);
    k.sched.wake_up(&k.scsi.sg.big_buff_wait);
}

/// Submit a packet: header, CDB sized by its opcode, then outbound
/// data. The reply is picked up with `sg_read`.
pub fn sg_write(k: &Kernel, dev_index: usize, buf: &[u8]) -> Result<usize> {
    let dev = k.scsi.device(dev_index).ok_or(Errno::ENODEV)?;
    let header = SgHeader::from_bytes(buf).ok_or(Errno::EINVAL)?;
    if buf.len() < SG_HEADER_SIZE + 6 {
        return Err(Errno::EINVAL);
    }
    let opcode = buf[SG_HEADER_SIZE];
    let cmdlen = command_size(opcode);
    if buf.len() < SG_HEADER_SIZE + cmdlen {
        return Err(Errno::EINVAL);
    }
    let data_in = &buf[SG_HEADER_SIZE + cmdlen..];
    let reply_len = header.reply_len as usize;
    if reply_len > SG_BIG_BUFF || data_in.len() > SG_BIG_BUFF {
        return Err(Errno::EINVAL);
    }
    // One outstanding packet per device.
    let busy = with_dev(k, dev_index, |d| d.pending.is_some());
    if busy {
        return Err(Errno::EBUSY);
    }

    claim_big_buff(k)?;
    let mut payload = alloc::vec![0u8; reply_len.max(data_in.len())];
    payload[..data_in.len()].copy_from_slice(data_in);

    let mut cdb = buf[SG_HEADER_SIZE..SG_HEADER_SIZE + cmdlen].to_vec();
    cdb[1] = (cdb[1] & 0x1f) | (dev.lun << 5);

    let timeout = with_dev(k, dev_index, |d| d.timeout);
    let cmd = match allocate_device(k, dev_index, true) {
        Ok(c) => c,
        Err(e) => {
            release_big_buff(k);
            return Err(e);
        }
    };
    let data = if payload.is_empty() {
        ScsiData::None
    } else {
        ScsiData::Single(DataSeg::new(0, payload))
    };
    let result = scsi_cmd_wait(k, &cmd, &cdb, data, timeout, SG_DEFAULT_RETRIES);

    let reply = {
        let mut st = cmd.state.lock();
        if result != 0 {
            st.sense_buffer.to_vec()
        } else {
            match &mut st.data {
                ScsiData::Single(seg) => {
                    let keep = reply_len.min(seg.data.len());
                    seg.data[..keep].to_vec()
                }
                _ => Vec::new(),
            }
        }
    };
    release_cmd(k, &cmd);
    release_big_buff(k);

    let posix_result = if result == 0 {
        0
    } else if scsi::host_byte(result) != scsi::DID_OK {
        Errno::EBUSY as u32
    } else {
        Errno::EIO as u32
    };
    with_dev(k, dev_index, |d| {
        d.pending = Some(Pending {
            header: SgHeader {
                pack_len: (SG_HEADER_SIZE + reply.len()) as u32,
                reply_len: header.reply_len,
                pack_id: header.pack_id,
                result: posix_result,
            },
            reply,
        });
    });
    k.sched.wake_up(&k.scsi.sg.read_wait);
    Ok(buf.len())
}

/// Collect the reply: the echoed header followed by inbound data.
pub fn sg_read(k: &Kernel, dev_index: usize, buf: &mut [u8], nonblock: bool) -> Result<usize> {
    if buf.len() < SG_HEADER_SIZE {
        return Err(Errno::EINVAL);
    }
    loop {
        let taken = with_dev(k, dev_index, |d| d.pending.take());
        if let Some(p) = taken {
            let hdr = p.header.to_bytes();
            buf[..SG_HEADER_SIZE].copy_from_slice(&hdr);
            let n = p.reply.len().min(buf.len() - SG_HEADER_SIZE);
            buf[SG_HEADER_SIZE..SG_HEADER_SIZE + n].copy_from_slice(&p.reply[..n]);
            return Ok(SG_HEADER_SIZE + n);
        }
        if nonblock {
            return Err(Errno::EAGAIN);
        }
        k.sched.interruptible_sleep_on(&k.scsi.sg.read_wait)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::{mock_kernel, MockHost};
    use crate::drivers::scsi::{scan_scsis, scsi_register_host, INQUIRY};

    #[test]
    fn test_header_round_trip() {
        let h = SgHeader {
            pack_len: 52,
            reply_len: 36,
            pack_id: 9,
            result: 0,
        };
        assert_eq!(SgHeader::from_bytes(&h.to_bytes()), Some(h));
        assert_eq!(SgHeader::from_bytes(&[0u8; 4]), None);
    }

    #[test]
    fn test_packet_round_trip() {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        scsi_register_host(&k, host);
        scan_scsis(&k);
        sg_open(&k, 0, false).unwrap();

        let header = SgHeader {
            pack_len: (SG_HEADER_SIZE + 6) as u32,
            reply_len: 36,
            pack_id: 42,
            result: 0,
        };
        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(&[INQUIRY, 0, 0, 0, 255, 0]);
        sg_write(&k, 0, &packet).unwrap();

        let mut reply = [0u8; 128];
        let n = sg_read(&k, 0, &mut reply, true).unwrap();
        let back = SgHeader::from_bytes(&reply).unwrap();
        assert_eq!(back.pack_id, 42);
        assert_eq!(back.result, 0);
        assert_eq!(n, SG_HEADER_SIZE + 36);
        assert_eq!(&reply[SG_HEADER_SIZE + 8..SG_HEADER_SIZE + 12], b"MOCK");
        sg_release(&k, 0);
    }

    #[test]
    fn test_exclusive_open() {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        scsi_register_host(&k, host);
        scan_scsis(&k);
        sg_open(&k, 0, true).unwrap();
        assert_eq!(sg_open(&k, 0, false).err(), Some(Errno::EBUSY));
        sg_release(&k, 0);
        sg_open(&k, 0, false).unwrap();
        sg_open(&k, 0, false).unwrap();
        assert_eq!(sg_open(&k, 0, true).err(), Some(Errno::EBUSY));
    }

    #[test]
    fn test_read_without_packet_does_not_block_in_nonblock() {
        let (k, _p, _s) = mock_kernel();
        let host = MockHost::new();
        scsi_register_host(&k, host);
        scan_scsis(&k);
        let mut reply = [0u8; 64];
        assert_eq!(sg_read(&k, 0, &mut reply, true).err(), Some(Errno::EAGAIN));
    }
}
