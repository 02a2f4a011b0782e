// DMA-safe sector pool. The region is partitioned into 512-byte
// sectors addressed in 16-sector pages; a 16-bit occupancy mask per
// page permits power-of-two runs of 1..16 sectors aligned within the
// page. Requests larger than one page fail.

use alloc::vec::Vec;
use spin::Mutex;

use crate::kwarn;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = 16;

/// Callers must leave this many sectors free for concurrent requests,
/// or risk deadlocking the pool.
pub const DMA_HEADROOM_SECTORS: usize = 5;

/// Simulated ISA reachability limit: buffers above this need bouncing.
pub const ISA_DMA_THRESHOLD: u64 = 16 * 1024 * 1024;

/// A pool fragment: sector offset and length in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHandle {
    pub offset: usize,
    pub len: usize,
}

struct PoolInner {
    freelist: Vec<u16>,
    buffer: Vec<u8>,
    free_sectors: usize,
}

pub struct DmaPool {
    inner: Mutex<PoolInner>,
}

impl DmaPool {
    /// An empty pool; `init` sizes it once device scan has counted the
    /// consumers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                freelist: Vec::new(),
                buffer: Vec::new(),
                free_sectors: 0,
            }),
        }
    }

    /// Size the pool. The sector count is rounded up to a whole page.
    pub fn init(&self, sectors: usize) {
        let sectors = (sectors + SECTORS_PER_PAGE - 1) & !(SECTORS_PER_PAGE - 1);
        let mut inner = self.inner.lock();
        inner.freelist = alloc::vec![0u16; sectors / SECTORS_PER_PAGE];
        inner.buffer = alloc::vec![0u8; sectors * SECTOR_SIZE];
        inner.free_sectors = sectors;
    }

    pub fn free_sectors(&self) -> usize {
        self.inner.lock().free_sectors
    }

    pub fn total_sectors(&self) -> usize {
        self.inner.lock().freelist.len() * SECTORS_PER_PAGE
    }

    /// Allocate `len` bytes (a multiple of 512, at most 4096).
    pub fn alloc(&self, len: usize) -> Option<DmaHandle> {
        if len == 0 || len % SECTOR_SIZE != 0 || len > 4096 {
            kwarn!("dma pool: inappropriate buffer size {}", len);
            return None;
        }
        let nbits = len / SECTOR_SIZE;
        let mask = (1u32 << nbits) - 1;
        let mut inner = self.inner.lock();
        for page in 0..inner.freelist.len() {
            for shift in 0..=(SECTORS_PER_PAGE - nbits) {
                let m = (mask << shift) as u16;
                if inner.freelist[page] & m == 0 {
                    inner.freelist[page] |= m;
                    inner.free_sectors -= nbits;
                    return Some(DmaHandle {
                        offset: (page * SECTORS_PER_PAGE + shift) * SECTOR_SIZE,
                        len,
                    });
                }
            }
        }
        None
    }

    pub fn free(&self, handle: DmaHandle) {
        let sector = handle.offset / SECTOR_SIZE;
        let nbits = handle.len / SECTOR_SIZE;
        let page = sector / SECTORS_PER_PAGE;
        let shift = sector % SECTORS_PER_PAGE;
        let mask = (((1u32 << nbits) - 1) << shift) as u16;
        let mut inner = self.inner.lock();
        if page >= inner.freelist.len() {
            kwarn!("dma pool: free of bad page {}", page);
            return;
        }
        if inner.freelist[page] & mask != mask {
            kwarn!("dma pool: freeing unused sectors at {}", handle.offset);
            return;
        }
        inner.freelist[page] &= !mask;
        inner.free_sectors += nbits;
    }

    /// Copy caller bytes into a fragment (write-direction bounce).
    pub fn write_bytes(&self, handle: DmaHandle, data: &[u8]) {
        let mut inner = self.inner.lock();
        let n = data.len().min(handle.len);
        let off = handle.offset;
        inner.buffer[off..off + n].copy_from_slice(&data[..n]);
    }

    /// Copy a fragment back out (read-direction bounce).
    pub fn read_bytes(&self, handle: DmaHandle, out: &mut [u8]) {
        let inner = self.inner.lock();
        let n = out.len().min(handle.len);
        out[..n].copy_from_slice(&inner.buffer[handle.offset..handle.offset + n]);
    }

    /// The occupancy invariant: no page has overlapping runs, and the
    /// free counter matches the mask population.
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        let used: usize = inner.freelist.iter().map(|m| m.count_ones() as usize).sum();
        inner.free_sectors == inner.freelist.len() * SECTORS_PER_PAGE - used
    }
}

impl Default for DmaPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two_runs() {
        let pool = DmaPool::new();
        pool.init(32);
        let a = pool.alloc(512).unwrap();
        let b = pool.alloc(1024).unwrap();
        let c = pool.alloc(4096).unwrap();
        assert!(pool.check_invariant());
        assert_eq!(pool.free_sectors(), 32 - 1 - 2 - 8);
        pool.free(b);
        pool.free(a);
        pool.free(c);
        assert_eq!(pool.free_sectors(), 32);
        assert!(pool.check_invariant());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let pool = DmaPool::new();
        pool.init(16);
        assert!(pool.alloc(100).is_none());
        assert!(pool.alloc(8192).is_none());
        assert!(pool.alloc(0).is_none());
    }

    #[test]
    fn test_exhaustion() {
        let pool = DmaPool::new();
        pool.init(16);
        let a = pool.alloc(4096).unwrap();
        let b = pool.alloc(4096).unwrap();
        assert!(pool.alloc(512).is_some());
        // 3 sectors left; a page-sized run cannot fit.
        assert!(pool.alloc(4096).is_none());
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_bounce_copies() {
        let pool = DmaPool::new();
        pool.init(16);
        let h = pool.alloc(512).unwrap();
        pool.write_bytes(h, &[0xAB; 512]);
        let mut out = [0u8; 512];
        pool.read_bytes(h, &mut out);
        assert_eq!(out, [0xAB; 512]);
        pool.free(h);
    }
}
