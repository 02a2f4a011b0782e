// Pseudo-terminal pairs. The master and slave are two cross-linked
// lines; the device "hardware" is a byte pump that moves one side's
// write queue into the other side's raw queue and kicks the paired
// line discipline.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use lazy_static::lazy_static;

use crate::drivers::char::tty::{
    self, is_a_pty_master, is_a_pty_slave, Tty, TtyDriver, TTY_SLAVE_CLOSED,
};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};

pub struct PtyDriver;

lazy_static! {
    static ref PTY_DRIVER: Arc<PtyDriver> = Arc::new(PtyDriver);
}

pub fn driver() -> Arc<dyn TtyDriver> {
    PTY_DRIVER.clone()
}

impl TtyDriver for PtyDriver {
    fn open(&self, k: &Kernel, tty: &Arc<Tty>) -> Result<()> {
        let link = tty::linked_tty(k, tty).ok_or(Errno::ENODEV)?;
        if is_a_pty_slave(tty.line) {
            link.clear_flag(TTY_SLAVE_CLOSED);
        }
        k.sched.wake_up(&tty.read_q.wait);
        // A slave open blocks until the master side shows up.
        if is_a_pty_slave(tty.line) {
            while link.count.load(Ordering::Acquire) == 0 {
                if k.sched.signal_pending() {
                    return Err(Errno::ERESTARTSYS);
                }
                k.sched.interruptible_sleep_on(&link.read_q.wait)?;
            }
        }
        Ok(())
    }

    fn close(&self, k: &Kernel, tty: &Arc<Tty>) {
        k.sched.wake_up(&tty.read_q.wait);
        let Some(link) = tty::linked_tty(k, tty) else {
            return;
        };
        if is_a_pty_master(tty.line) {
            if tty.count.load(Ordering::Acquire) == 1 {
                tty::tty_hangup(k, &link);
            }
        } else if tty.count.load(Ordering::Acquire) == 2 {
            // The master's reference is the only one left.
            link.set_flag(TTY_SLAVE_CLOSED);
            k.sched.wake_up(&link.secondary.wait);
        }
    }

    fn write(&self, k: &Kernel, tty: &Arc<Tty>) {
        let Some(to) = tty::linked_tty(k, tty) else {
            return;
        };
        if to.count.load(Ordering::Acquire) == 0 {
            return;
        }
        loop {
            {
                let to_q = to.read_q.inner.lock();
                if to_q.is_full() {
                    break;
                }
            }
            let Some((c, _)) = tty.write_q.get() else {
                break;
            };
            to.read_q.put(c);
        }
        // Cook the far side immediately so loopback traffic completes
        // without waiting for the bottom half.
        tty::tty_read_flush(k, &to);
        k.sched.wake_up(&tty.write_q.wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::tty::{
        tty_ioctl, tty_open, tty_read, tty_write, OpenFlags, TtyIoctl, TIOCPKT_DATA, TIOCPKT_STOP,
    };
    use crate::drivers::mock::mock_kernel;

    const MASTER: usize = 128;
    const SLAVE: usize = 192;

    fn open_pair(
        k: &Arc<crate::Kernel>,
    ) -> (
        Arc<crate::drivers::char::tty::TtyFile>,
        Arc<crate::drivers::char::tty::TtyFile>,
    ) {
        let m = tty_open(k, MASTER, OpenFlags { nonblock: true, noctty: false }).unwrap();
        let s = tty_open(k, SLAVE, OpenFlags { nonblock: true, noctty: false }).unwrap();
        (m, s)
    }

    #[test]
    fn test_master_single_open() {
        let (k, _p, _s) = mock_kernel();
        let (_m, _sl) = open_pair(&k);
        assert_eq!(
            tty_open(&k, MASTER, OpenFlags::default()).err(),
            Some(Errno::EAGAIN)
        );
    }

    #[test]
    fn test_loopback_line() {
        let (k, _p, _s) = mock_kernel();
        let (m, s) = open_pair(&k);
        // The master side is raw; the slave cooks canonically.
        let n = tty_write(&k, &m, b"hi\n").unwrap();
        assert_eq!(n, 3);
        let mut buf = [0u8; 16];
        let n = tty_read(&k, &s, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
        // The slave echoed back through the master, with ONLCR
        // expansion.
        let n = tty_read(&k, &m, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\r\n");
    }

    #[test]
    fn test_slave_close_flags_master() {
        let (k, _p, _s) = mock_kernel();
        let (m, s) = open_pair(&k);
        crate::drivers::char::tty::tty_release(&k, &s);
        let mtty = k.ttys.get(MASTER).unwrap();
        assert!(mtty.test_flag(crate::drivers::char::tty::TTY_SLAVE_CLOSED));
        // Reads on the master now fail.
        let mut buf = [0u8; 4];
        assert_eq!(tty_read(&k, &m, &mut buf), Err(Errno::EIO));
    }

    #[test]
    fn test_packet_mode_reports_stop() {
        let (k, _p, _s) = mock_kernel();
        let (m, s) = open_pair(&k);
        let mut cmd = TtyIoctl::Tiocpkt(true);
        tty_ioctl(&k, &m, &mut cmd).unwrap();
        // ^S typed into the slave engages flow control and raises a
        // control-status byte for the master.
        let stty = k.ttys.get(SLAVE).unwrap();
        stty.read_q.put(0o23);
        crate::drivers::char::tty::tty_read_flush(&k, &stty);
        let mut buf = [0u8; 4];
        let n = tty_read(&k, &m, &mut buf).unwrap();
        assert_eq!(&buf[..n], [TIOCPKT_STOP]);
        // Ordinary data is prefixed with the data marker.
        tty_write(&k, &s, b"ok").unwrap();
        let n = tty_read(&k, &m, &mut buf).unwrap();
        assert_eq!(&buf[..n], [TIOCPKT_DATA, b'o', b'k']);
    }

    #[test]
    fn test_master_hangup_on_close() {
        let (k, _p, _s) = mock_kernel();
        let (m, s) = open_pair(&k);
        crate::drivers::char::tty::tty_release(&k, &m);
        // The slave saw a hangup: reads return EOF.
        let mut buf = [0u8; 4];
        assert_eq!(tty_read(&k, &s, &mut buf), Ok(0));
    }
}
