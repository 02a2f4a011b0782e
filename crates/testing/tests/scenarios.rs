// End-to-end scenarios across the wired kernel: canonical editing,
// emulator behavior, SCSI retry and sense handling, and console
// switching with a dead controlling process.

use charon_kernel::drivers::char::termios::{Termios, VERASE};
use charon_kernel::drivers::char::tty::{
    tty_ioctl, tty_open, tty_read, tty_write, OpenFlags, TtyIoctl,
};
use charon_kernel::drivers::char::vt::{VtIoctl, VtStat};
use charon_kernel::drivers::char::console::{VtMode, VtSwitchMode};
use charon_kernel::drivers::mock::host::valid_sense;
use charon_kernel::drivers::mock::{mock_kernel, MockHost, ScriptedOutcome};
use charon_kernel::drivers::scsi::{
    self, allocate_device, release_cmd, scan_scsis, scsi_cmd_wait, scsi_register_host, DataSeg,
    ScsiData,
};
use charon_kernel::sched::Signal;

use core::sync::atomic::Ordering;

/// Canonical echo & erase: `a b c \b \n` reads back "ab\n" and echoes
/// the visual rub-out.
#[test]
fn canonical_echo_and_erase_through_pty() {
    let (k, _p, _s) = mock_kernel();
    let master = tty_open(&k, 128, OpenFlags { nonblock: true, noctty: false }).unwrap();
    let slave = tty_open(&k, 192, OpenFlags { nonblock: true, noctty: false }).unwrap();
    {
        let tty = k.ttys.get(192).unwrap();
        let mut t: Termios = *tty.termios.read();
        t.c_cc[VERASE] = 8;
        let mut cmd = TtyIoctl::Tcsets(&t);
        tty_ioctl(&k, &slave, &mut cmd).unwrap();
    }
    tty_write(&k, &master, &[b'a', b'b', b'c', 8, b'\n']).unwrap();

    let mut buf = [0u8; 16];
    let n = tty_read(&k, &slave, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ab\n");

    // Echo observed from the master side: a b c, rub-out, CR LF.
    let n = tty_read(&k, &master, &mut buf).unwrap();
    assert_eq!(&buf[..n], [b'a', b'b', b'c', 8, b' ', 8, b'\r', b'\n']);
}

/// VT cursor positioning after `ESC [ 2 J ESC [ 5 ; 10 H X`.
#[test]
fn vt_cursor_positioning() {
    let (k, p, _s) = mock_kernel();
    let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
    tty_write(&k, &file, b"\x1b[2J\x1b[5;10HX").unwrap();
    assert_eq!(p.cell(4 * 80 + 9) & 0xff, 0x58);
    let st = k.console.state.lock();
    assert_eq!((st.vcs[0].x, st.vcs[0].y), (10, 4));
    assert!(!st.vcs[0].need_wrap);
}

/// `ESC [ 2 J ESC [ H` leaves erase characters everywhere, cursor at
/// the origin, wrap pending cleared.
#[test]
fn vt_clear_home_law() {
    let (k, p, _s) = mock_kernel();
    let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
    tty_write(&k, &file, b"garbage\x1b[2J\x1b[H").unwrap();
    for off in 0..80 * 25 {
        assert_eq!(p.cell(off), 0x0720);
    }
    let st = k.console.state.lock();
    assert_eq!((st.vcs[0].x, st.vcs[0].y), (0, 0));
    assert!(!st.vcs[0].need_wrap);
}

/// Tab expansion under OPOST|XTABS from column 3.
#[test]
fn tab_expansion() {
    let (k, _p, _s) = mock_kernel();
    let master = tty_open(&k, 128, OpenFlags { nonblock: true, noctty: false }).unwrap();
    let slave = tty_open(&k, 192, OpenFlags { nonblock: true, noctty: false }).unwrap();
    {
        let tty = k.ttys.get(192).unwrap();
        let mut t: Termios = *tty.termios.read();
        t.c_oflag |= charon_kernel::drivers::char::termios::Oflag::XTABS;
        let mut cmd = TtyIoctl::Tcsets(&t);
        tty_ioctl(&k, &slave, &mut cmd).unwrap();
    }
    // Write "abc" then a tab through the slave; the master sees the
    // expansion.
    tty_write(&k, &slave, b"abc\t").unwrap();
    let mut buf = [0u8; 16];
    let n = tty_read(&k, &master, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"abc     ");
    let tty = k.ttys.get(192).unwrap();
    assert_eq!(tty.lstate.lock().column, 8);
}

/// A host that fails two submissions with bus-busy completes on the
/// third with a clean result word.
#[test]
fn scsi_busy_retry() {
    let (k, _p, _s) = mock_kernel();
    let host = MockHost::new();
    scsi_register_host(&k, host.clone());
    scan_scsis(&k);
    host.push(ScriptedOutcome::host_error(scsi::DID_BUS_BUSY));
    host.push(ScriptedOutcome::host_error(scsi::DID_BUS_BUSY));
    host.push(ScriptedOutcome::good());
    let cmd = allocate_device(&k, 0, true).unwrap();
    let tur = [scsi::TEST_UNIT_READY, 0, 0, 0, 0, 0];
    let result = scsi_cmd_wait(&k, &cmd, &tur, ScsiData::None, scsi::SCSI_TIMEOUT, 5);
    release_cmd(&k, &cmd);
    assert_eq!(result, 0);
}

/// The sense cascade: CHECK CONDITION with no sense triggers REQUEST
/// SENSE; UNIT ATTENTION on removable media marks the change and the
/// read completes after an internal retry.
#[test]
fn scsi_sense_cascade() {
    let (k, _p, _s) = mock_kernel();
    let host = MockHost::new_removable();
    scsi_register_host(&k, host.clone());
    scan_scsis(&k);
    let dev = k.scsi.device(0).unwrap();

    host.push(ScriptedOutcome::status(scsi::CHECK_CONDITION));
    host.push(
        ScriptedOutcome::good().with_data(valid_sense(scsi::UNIT_ATTENTION, 0x28).to_vec()),
    );

    let cmd = allocate_device(&k, 0, true).unwrap();
    let cdb = [scsi::READ_6, 0, 0, 0, 1, 0];
    let data = ScsiData::Single(DataSeg::new(0, vec![0u8; 512]));
    let result = scsi_cmd_wait(&k, &cmd, &cdb, data, scsi::SCSI_TIMEOUT, 5);
    release_cmd(&k, &cmd);

    assert_eq!(scsi::host_byte(result), scsi::DID_OK);
    assert_eq!(scsi::status_byte(result), scsi::GOOD);
    assert!(dev.changed.load(Ordering::Acquire));
    // The next open revalidates.
    charon_kernel::drivers::scsi::disk::sd_open(&k, 0).unwrap();
    assert!(!dev.changed.load(Ordering::Acquire));
}

/// Console switching when the controlling process has died: the
/// console reverts to automatic mode and the switch goes through.
#[test]
fn console_switch_to_dead_process() {
    let (k, _p, sched) = mock_kernel();
    let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
    {
        let mut st = k.console.state.lock();
        st.vcs[0].vt_mode = VtMode {
            mode: VtSwitchMode::Process,
            waitv: false,
            relsig: Signal::SigUsr1.to_u32() as u8,
            acqsig: Signal::SigUsr2.to_u32() as u8,
            frsig: 0,
        };
        st.vcs[0].vt_pid = 4242;
    }
    sched.mark_dead(4242);

    let mut cmd = TtyIoctl::Vt(VtIoctl::Activate(2));
    tty_ioctl(&k, &file, &mut cmd).unwrap();

    assert_eq!(k.console.fg_console(), 1);
    {
        let st = k.console.state.lock();
        assert_eq!(st.vcs[0].vt_mode.mode, VtSwitchMode::Auto);
        assert_eq!(st.vcs[0].vt_pid, -1);
    }
    let mut stat = VtStat::default();
    let mut cmd = TtyIoctl::Vt(VtIoctl::GetState(&mut stat));
    tty_ioctl(&k, &file, &mut cmd).unwrap();
    assert_eq!(stat.v_active, 2);
}

/// termios round trip: set(get()) leaves behavior unchanged.
#[test]
fn termios_roundtrip_law() {
    let (k, _p, _s) = mock_kernel();
    let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
    let mut t = Termios::console_default();
    tty_ioctl(&k, &file, &mut TtyIoctl::Tcgets(&mut t)).unwrap();
    tty_ioctl(&k, &file, &mut TtyIoctl::Tcsets(&t)).unwrap();
    let mut back = t;
    tty_ioctl(&k, &file, &mut TtyIoctl::Tcgets(&mut back)).unwrap();
    assert_eq!(back, t);
}
