// Input strategies shared by the property suites: arbitrary byte
// streams for the emulator and the line discipline, and allocation
// scripts for the sector pool.

/// Queue operation for the ring-invariant suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Put(u8),
    PutFlagged(u8),
    Get,
}

/// Pool operation for the occupancy suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOp {
    /// Allocation size in sectors (1, 2, 4 or 8).
    Alloc(u8),
    /// Free the nth outstanding allocation, modulo the live count.
    Free(u8),
}

#[cfg(test)]
mod tests {
    use super::*;
    use charon_kernel::drivers::char::queue::{QueueInner, TTY_BUF_SIZE};
    use charon_kernel::drivers::mock::mock_kernel;
    use charon_kernel::drivers::scsi::DmaPool;
    use proptest::prelude::*;

    fn queue_op() -> impl Strategy<Value = QueueOp> {
        prop_oneof![
            any::<u8>().prop_map(QueueOp::Put),
            any::<u8>().prop_map(QueueOp::PutFlagged),
            Just(QueueOp::Get),
        ]
    }

    fn pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            prop::sample::select(vec![1u8, 2, 4, 8]).prop_map(PoolOp::Alloc),
            any::<u8>().prop_map(PoolOp::Free),
        ]
    }

    proptest! {
        /// After any operation sequence, the occupancy stays inside
        /// the ring and flags only mark in-use slots.
        #[test]
        fn ring_occupancy_invariant(ops in prop::collection::vec(queue_op(), 0..600)) {
            let mut q = QueueInner::new();
            let mut model: alloc_model::Model = Default::default();
            for op in ops {
                match op {
                    QueueOp::Put(c) => {
                        q.put(c);
                        model.put(c, false);
                    }
                    QueueOp::PutFlagged(c) => {
                        q.put_flagged(c);
                        model.put(c, true);
                    }
                    QueueOp::Get => {
                        let got = q.get();
                        prop_assert_eq!(got, model.get());
                    }
                }
                prop_assert!(q.chars() < TTY_BUF_SIZE);
                prop_assert_eq!(q.chars(), model.len());
                // Any flag bit outside the used region is a leak.
                for idx in 0..TTY_BUF_SIZE {
                    if q.flag_at(idx) {
                        prop_assert!(q.in_use(idx), "flag outside used region at {}", idx);
                    }
                }
            }
        }

        /// FIFO order and flag pairing survive arbitrary interleaving.
        #[test]
        fn ring_is_fifo(bytes in prop::collection::vec(any::<u8>(), 0..500)) {
            let mut q = QueueInner::new();
            for &b in &bytes {
                q.put(b);
            }
            let kept = bytes.len().min(TTY_BUF_SIZE - 1);
            for item in bytes.iter().take(kept) {
                prop_assert_eq!(q.get(), Some((*item, false)));
            }
            prop_assert!(q.get().is_none());
        }

        /// Pool masks never overlap and the free counter matches the
        /// popcount complement.
        #[test]
        fn dma_pool_conservation(ops in prop::collection::vec(pool_op(), 0..200)) {
            let pool = DmaPool::new();
            pool.init(64);
            let total = pool.total_sectors();
            let mut live = Vec::new();
            for op in ops {
                match op {
                    PoolOp::Alloc(sectors) => {
                        if let Some(h) = pool.alloc(usize::from(sectors) * 512) {
                            live.push(h);
                        }
                    }
                    PoolOp::Free(n) => {
                        if !live.is_empty() {
                            let h = live.swap_remove(usize::from(n) % live.len());
                            pool.free(h);
                        }
                    }
                }
                prop_assert!(pool.check_invariant());
                let used: usize = live.iter().map(|h| h.len / 512).sum();
                prop_assert_eq!(pool.free_sectors(), total - used);
            }
            for h in live {
                pool.free(h);
            }
            prop_assert_eq!(pool.free_sectors(), total);
        }

        /// The emulator's cursor stays on screen under arbitrary input.
        #[test]
        fn vt_cursor_stays_in_bounds(bytes in prop::collection::vec(any::<u8>(), 0..400)) {
            let (k, _p, _s) = mock_kernel();
            let file = charon_kernel::drivers::char::tty::tty_open(
                &k,
                1,
                charon_kernel::drivers::char::tty::OpenFlags {
                    nonblock: true,
                    noctty: false,
                },
            )
            .unwrap();
            let _ = charon_kernel::drivers::char::tty::tty_write(&k, &file, &bytes);
            let st = k.console.state.lock();
            let vc = &st.vcs[0];
            prop_assert!(vc.x < st.cols);
            prop_assert!(vc.y < st.rows);
            prop_assert!(vc.top < vc.bottom);
            prop_assert!(vc.bottom <= st.rows);
        }

        /// Whatever the termios flags, cooked bytes never exceed what
        /// arrived (plus the PARMRK doubling bound).
        #[test]
        fn ldisc_conserves_bytes(bytes in prop::collection::vec(any::<u8>(), 0..300)) {
            let (k, _p, _s) = mock_kernel();
            let file = charon_kernel::drivers::char::tty::tty_open(
                &k,
                128,
                charon_kernel::drivers::char::tty::OpenFlags {
                    nonblock: true,
                    noctty: false,
                },
            )
            .unwrap();
            let _slave = charon_kernel::drivers::char::tty::tty_open(
                &k,
                192,
                charon_kernel::drivers::char::tty::OpenFlags {
                    nonblock: true,
                    noctty: false,
                },
            )
            .unwrap();
            // Raw master: bytes pass through unmodified.
            let wrote = charon_kernel::drivers::char::tty::tty_write(&k, &file, &bytes)
                .unwrap_or(0);
            let tty = k.ttys.get(192).unwrap();
            let cooked = tty.secondary.chars();
            prop_assert!(cooked <= 2 * wrote + 2);
        }
    }

    mod alloc_model {
        use std::collections::VecDeque;

        /// Reference model of the ring: unbounded FIFO truncated at
        /// capacity - 1.
        #[derive(Default)]
        pub struct Model {
            items: VecDeque<(u8, bool)>,
        }

        impl Model {
            pub fn put(&mut self, c: u8, flagged: bool) {
                if self.items.len() < super::TTY_BUF_SIZE - 1 {
                    self.items.push_back((c, flagged));
                }
            }

            pub fn get(&mut self) -> Option<(u8, bool)> {
                self.items.pop_front()
            }

            pub fn len(&self) -> usize {
                self.items.len()
            }
        }
    }
}
