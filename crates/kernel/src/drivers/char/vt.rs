// Console (vt and kd) ioctls and the VT switching handshake.
//
// Any console may be modified, not just the foreground one. A console
// in VT_PROCESS mode negotiates switches with its controlling process
// through relsig/acqsig and VT_RELDISP; if the process has died the
// console silently reverts to automatic switching.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::drivers::char::console::{ConState, KdMode, VtMode, VtSwitchMode};
use crate::drivers::char::keyboard::{self, KbDiacr};
use crate::drivers::char::selection;
use crate::drivers::char::tty::{self, Tty, TtyFile, TtyIoctl, NR_CONSOLES};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::Signal;

// The valid I/O ports user space may be delegated: the VGA register
// range.
pub const GPFIRST: u16 = 0x3b4;
pub const GPLAST: u16 = 0x3df;
pub const GPNUM: usize = (GPLAST - GPFIRST + 1) as usize;

// KDSETMODE arguments.
pub const KD_TEXT: u32 = 0;
pub const KD_GRAPHICS: u32 = 1;
pub const KD_TEXT0: u32 = 2;
pub const KD_TEXT1: u32 = 3;

// KDSKBMODE arguments.
pub const K_RAW: u32 = 0;
pub const K_XLATE: u32 = 1;
pub const K_MEDIUMRAW: u32 = 2;

// KDSKBMETA arguments.
pub const K_METABIT: u32 = 3;
pub const K_ESCPREFIX: u32 = 4;

/// Keyboard type reported by KDGKBTYPE.
pub const KB_101: u8 = 2;

/// VT_RELDISP acknowledge-acquire argument.
pub const VT_ACKACQ: u32 = 2;

/// Speaker divisor clock.
pub const PIT_TICK_RATE: u32 = 1_193_180;

#[derive(Debug, Clone, Copy)]
pub struct KbEntry {
    pub table: u8,
    pub index: u8,
    pub value: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VtStat {
    pub v_active: u16,
    pub v_state: u16,
}

/// KD ioctl family.
pub enum KdIoctl<'a> {
    GetLed(&'a mut u8),
    SetLed(u8),
    GetKbType(&'a mut u8),
    AddIo(u16),
    DelIo(u16),
    EnabIo,
    DisabIo,
    SetMode(u32),
    GetMode(&'a mut u32),
    SetKbMode(u32),
    GetKbMode(&'a mut u32),
    SetKbMeta(u32),
    GetKbMeta(&'a mut u32),
    GetKbEnt(&'a mut KbEntry),
    SetKbEnt(KbEntry),
    GetKbSent(u8, &'a mut Vec<u8>),
    SetKbSent(u8, &'a [u8]),
    GetKbDiacr(&'a mut Vec<KbDiacr>),
    SetKbDiacr(&'a [KbDiacr]),
    SetSound(u32),
    MkTone(u32),
    PioFont(&'a [u8]),
    GioFont(&'a mut [u8]),
    PioScrnMap(&'a [u8; 256]),
    GioScrnMap(&'a mut [u8; 256]),
}

/// VT ioctl family.
pub enum VtIoctl<'a> {
    OpenQry(&'a mut i32),
    GetMode(&'a mut VtMode),
    SetMode(VtMode),
    GetState(&'a mut VtStat),
    Activate(usize),
    WaitActive(usize),
    RelDisp(u32),
    SetSelection(selection::SelArg),
    PasteSelection,
}

/// Drive the PC speaker. `count` is the PIT divisor; 0 turns the tone
/// off. A nonzero tick count schedules the automatic shutoff.
pub fn kd_mksound(k: &Kernel, st: &mut ConState, count: u32, ticks: u64) {
    if count != 0 {
        let cur = k.platform.port_in8(0x61);
        k.platform.port_out8(0x61, cur | 3);
        k.platform.port_out8(0x43, 0xB6);
        k.platform.port_out8(0x42, (count & 0xff) as u8);
        k.platform.port_out8(0x42, ((count >> 8) & 0xff) as u8);
        st.sound_off_deadline = if ticks > 0 {
            Some(k.platform.ticks() + ticks)
        } else {
            None
        };
    } else {
        kd_nosound(k);
        st.sound_off_deadline = None;
    }
}

pub fn kd_nosound(k: &Kernel) {
    let cur = k.platform.port_in8(0x61);
    k.platform.port_out8(0x61, cur & 0xFC);
}

fn revert_to_auto(k: &Kernel, st: &mut ConState, cons: usize) {
    // The controlling process is gone: back to text, translated
    // keyboard, automatic switching.
    st.vcs[cons].vc_mode = KdMode::Text;
    k.kbd.set_mode(cons, keyboard::VC_RAW, false);
    k.kbd.set_mode(cons, keyboard::VC_MEDIUMRAW, false);
    st.vcs[cons].vt_mode = VtMode::default();
    st.vcs[cons].vt_pid = -1;
    st.vcs[cons].vt_newvt = -1;
}

/// Back end of a console switch.
pub fn complete_change_console(k: &Kernel, st: &mut ConState, new_console: usize) {
    if new_console == st.fg_console || new_console >= NR_CONSOLES {
        return;
    }
    let old_vc_mode = st.vcs[st.fg_console].vc_mode;
    st.update_screen(k, new_console);
    k.console.sync_fg(new_console);

    // Tell a process-managed incoming console it has acquired the
    // display; a dead controller reverts the console to auto mode.
    if st.vcs[new_console].vt_mode.mode == VtSwitchMode::Process {
        let pid = st.vcs[new_console].vt_pid;
        let delivered = Signal::from_u32(u32::from(st.vcs[new_console].vt_mode.acqsig))
            .ok_or(Errno::EINVAL)
            .and_then(|sig| k.sched.send_signal(pid, sig));
        if delivered.is_err() {
            revert_to_auto(k, st, new_console);
        }
    }

    if old_vc_mode != st.vcs[new_console].vc_mode {
        if st.vcs[new_console].vc_mode == KdMode::Text {
            st.unblank_screen(k);
        } else {
            st.blank_deadline = None;
            st.blank_screen(k);
        }
    }

    k.sched.wake_up(&k.console.vt_activate_wait);
}

/// Front end of a console switch: handshake with a process-managed
/// foreground console, or switch directly.
pub fn change_console(k: &Kernel, new_console: usize) {
    let mut st = k.console.state.lock();
    if new_console == st.fg_console || new_console >= NR_CONSOLES {
        return;
    }
    let fg = st.fg_console;
    if st.vcs[fg].vt_mode.mode == VtSwitchMode::Process {
        let pid = st.vcs[fg].vt_pid;
        let delivered = Signal::from_u32(u32::from(st.vcs[fg].vt_mode.relsig))
            .ok_or(Errno::EINVAL)
            .and_then(|sig| k.sched.send_signal(pid, sig));
        match delivered {
            Ok(()) => {
                // The process acknowledges with VT_RELDISP.
                st.vcs[fg].vt_newvt = new_console as i32;
                return;
            }
            Err(_) => revert_to_auto(k, &mut st, fg),
        }
    }

    // Ignore switches in graphics mode under automatic switching.
    if st.vcs[fg].vc_mode == KdMode::Graphics {
        return;
    }

    complete_change_console(k, &mut st, new_console);
}

/// Sleep until any console switch completes.
pub fn vt_waitactive(k: &Kernel) -> Result<()> {
    k.sched
        .interruptible_sleep_on(&k.console.vt_activate_wait)
        .map_err(|_| Errno::EINTR)
}

fn kd_ioctl(k: &Kernel, tty: &Arc<Tty>, cons: usize, cmd: &mut KdIoctl<'_>) -> Result<isize> {
    match cmd {
        KdIoctl::SetSound(count) => {
            let mut st = k.console.state.lock();
            kd_mksound(k, &mut st, *count, 0);
            Ok(0)
        }
        KdIoctl::MkTone(arg) => {
            let ticks =
                crate::drivers::char::ldisc::HZ * u64::from((*arg >> 16) & 0xffff) / 1000;
            let count = *arg & 0xffff;
            let mut st = k.console.state.lock();
            kd_mksound(k, &mut st, count, ticks);
            if ticks == 0 {
                kd_nosound(k);
            }
            Ok(0)
        }
        KdIoctl::GetKbType(out) => {
            **out = KB_101;
            Ok(0)
        }
        KdIoctl::AddIo(port) => set_ioport(k, *port, true),
        KdIoctl::DelIo(port) => set_ioport(k, *port, false),
        KdIoctl::EnabIo | KdIoctl::DisabIo => {
            let on = matches!(cmd, KdIoctl::EnabIo);
            let mut st = k.console.state.lock();
            st.ioports_enabled = [on; GPNUM];
            Ok(0)
        }
        KdIoctl::SetMode(arg) => {
            let mode = match *arg {
                KD_GRAPHICS => KdMode::Graphics,
                KD_TEXT | KD_TEXT0 | KD_TEXT1 => KdMode::Text,
                _ => return Err(Errno::EINVAL),
            };
            let mut st = k.console.state.lock();
            if st.vcs[cons].vc_mode == mode {
                return Ok(0);
            }
            st.vcs[cons].vc_mode = mode;
            if cons != st.fg_console {
                return Ok(0);
            }
            // Explicitly blank/unblank when the mode changes under us.
            if mode == KdMode::Text {
                st.unblank_screen(k);
            } else {
                st.blank_deadline = None;
                st.blank_screen(k);
            }
            Ok(0)
        }
        KdIoctl::GetMode(out) => {
            let st = k.console.state.lock();
            **out = match st.vcs[cons].vc_mode {
                KdMode::Text => KD_TEXT,
                KdMode::Graphics => KD_GRAPHICS,
            };
            Ok(0)
        }
        KdIoctl::SetKbMode(arg) => {
            match *arg {
                K_RAW => {
                    k.kbd.set_mode(cons, keyboard::VC_RAW, true);
                    k.kbd.set_mode(cons, keyboard::VC_MEDIUMRAW, false);
                }
                K_MEDIUMRAW => {
                    k.kbd.set_mode(cons, keyboard::VC_RAW, false);
                    k.kbd.set_mode(cons, keyboard::VC_MEDIUMRAW, true);
                }
                K_XLATE => {
                    k.kbd.set_mode(cons, keyboard::VC_RAW, false);
                    k.kbd.set_mode(cons, keyboard::VC_MEDIUMRAW, false);
                    k.kbd.compute_shiftstate(cons);
                }
                _ => return Err(Errno::EINVAL),
            }
            tty::flush_input(k, tty);
            Ok(0)
        }
        KdIoctl::GetKbMode(out) => {
            **out = if k.kbd.get_mode(cons, keyboard::VC_RAW) {
                K_RAW
            } else if k.kbd.get_mode(cons, keyboard::VC_MEDIUMRAW) {
                K_MEDIUMRAW
            } else {
                K_XLATE
            };
            Ok(0)
        }
        KdIoctl::SetKbMeta(arg) => {
            match *arg {
                K_METABIT => k.kbd.set_mode(cons, keyboard::VC_META, false),
                K_ESCPREFIX => k.kbd.set_mode(cons, keyboard::VC_META, true),
                _ => return Err(Errno::EINVAL),
            }
            Ok(0)
        }
        KdIoctl::GetKbMeta(out) => {
            **out = if k.kbd.get_mode(cons, keyboard::VC_META) {
                K_ESCPREFIX
            } else {
                K_METABIT
            };
            Ok(0)
        }
        KdIoctl::GetKbEnt(entry) => {
            let v = k.kbd.keymap_entry(entry.table as usize, entry.index as usize)?;
            entry.value = v;
            Ok(0)
        }
        KdIoctl::SetKbEnt(entry) => {
            k.kbd
                .set_keymap_entry(entry.table as usize, entry.index as usize, entry.value)?;
            Ok(0)
        }
        KdIoctl::GetKbSent(func, out) => {
            **out = k.kbd.func_string(*func as usize)?;
            Ok(0)
        }
        KdIoctl::SetKbSent(func, s) => {
            k.kbd.set_func_string(*func as usize, s)?;
            Ok(0)
        }
        KdIoctl::GetKbDiacr(out) => {
            **out = k.kbd.accent_entries();
            Ok(0)
        }
        KdIoctl::SetKbDiacr(entries) => {
            k.kbd.set_accent_entries(entries)?;
            Ok(0)
        }
        KdIoctl::GetLed(out) => {
            **out = k.kbd.ledstate(cons);
            Ok(0)
        }
        KdIoctl::SetLed(leds) => {
            if *leds & !7 != 0 {
                return Err(Errno::EINVAL);
            }
            k.kbd.set_ledstate(k, cons, *leds);
            Ok(0)
        }
        KdIoctl::PioFont(map) => {
            if map.len() != 8192 {
                return Err(Errno::EINVAL);
            }
            if !k.sched.current().suser {
                return Err(Errno::EPERM);
            }
            let mut st = k.console.state.lock();
            st.font.copy_from_slice(map);
            Ok(0)
        }
        KdIoctl::GioFont(out) => {
            if out.len() != 8192 {
                return Err(Errno::EINVAL);
            }
            let st = k.console.state.lock();
            out.copy_from_slice(&st.font);
            Ok(0)
        }
        KdIoctl::PioScrnMap(map) => {
            let mut st = k.console.state.lock();
            st.user_trans.copy_from_slice(&map[..]);
            // Loading a table must not mask the controls the parser
            // depends on.
            st.user_trans[0o12] = 0;
            st.user_trans[0o14] = 0;
            st.user_trans[0o15] = 0;
            st.user_trans[0o33] = 0;
            Ok(0)
        }
        KdIoctl::GioScrnMap(out) => {
            let st = k.console.state.lock();
            out.copy_from_slice(&st.user_trans);
            Ok(0)
        }
    }
}

/// Delegate (or revoke) one port in the VGA register range.
fn set_ioport(k: &Kernel, port: u16, on: bool) -> Result<isize> {
    if !(GPFIRST..=GPLAST).contains(&port) {
        return Err(Errno::EINVAL);
    }
    let mut st = k.console.state.lock();
    st.ioports_enabled[(port - GPFIRST) as usize] = on;
    Ok(0)
}

fn vt_mode_valid(mode: &VtMode) -> bool {
    if mode.mode == VtSwitchMode::Process {
        Signal::from_u32(u32::from(mode.relsig)).is_some()
            && Signal::from_u32(u32::from(mode.acqsig)).is_some()
    } else {
        true
    }
}

fn vt_family_ioctl(k: &Kernel, cons: usize, cmd: &mut VtIoctl<'_>) -> Result<isize> {
    match cmd {
        VtIoctl::OpenQry(out) => {
            let mut found = -1;
            for line in 1..=NR_CONSOLES {
                let free = match k.ttys.get(line) {
                    None => true,
                    Some(t) => t.count.load(Ordering::Acquire) == 0,
                };
                if free {
                    found = line as i32;
                    break;
                }
            }
            **out = found;
            Ok(0)
        }
        VtIoctl::GetState(out) => {
            // /dev/tty0 is always open.
            let mut state: u16 = 1;
            for line in 1..=NR_CONSOLES {
                if let Some(t) = k.ttys.get(line) {
                    if t.count.load(Ordering::Acquire) > 0 {
                        state |= 1 << line;
                    }
                }
            }
            out.v_active = (k.console.fg_console() + 1) as u16;
            out.v_state = state;
            Ok(0)
        }
        VtIoctl::GetMode(out) => {
            let st = k.console.state.lock();
            **out = st.vcs[cons].vt_mode;
            Ok(0)
        }
        VtIoctl::SetMode(mode) => {
            if !vt_mode_valid(mode) {
                return Err(Errno::EINVAL);
            }
            let mut st = k.console.state.lock();
            st.vcs[cons].vt_mode = *mode;
            // frsig is accepted but unused.
            st.vcs[cons].vt_mode.frsig = 0;
            st.vcs[cons].vt_pid = k.sched.current().pid;
            st.vcs[cons].vt_newvt = -1;
            Ok(0)
        }
        VtIoctl::Activate(n) => {
            if *n == 0 || *n > NR_CONSOLES {
                return Err(Errno::ENXIO);
            }
            change_console(k, *n - 1);
            Ok(0)
        }
        VtIoctl::WaitActive(n) => {
            if *n == 0 || *n > NR_CONSOLES {
                return Err(Errno::ENXIO);
            }
            while k.console.fg_console() != *n - 1 {
                vt_waitactive(k)?;
            }
            Ok(0)
        }
        VtIoctl::RelDisp(arg) => {
            let mut st = k.console.state.lock();
            if st.vcs[cons].vt_mode.mode != VtSwitchMode::Process {
                return Err(Errno::EINVAL);
            }
            if st.vcs[cons].vt_newvt >= 0 {
                if *arg == 0 {
                    // Switch disallowed; forget it was requested.
                    st.vcs[cons].vt_newvt = -1;
                } else {
                    let newvt = st.vcs[cons].vt_newvt as usize;
                    st.vcs[cons].vt_newvt = -1;
                    complete_change_console(k, &mut st, newvt);
                }
            } else if *arg != VT_ACKACQ {
                return Err(Errno::EINVAL);
            }
            Ok(0)
        }
        VtIoctl::SetSelection(arg) => selection::set_selection(k, *arg),
        VtIoctl::PasteSelection => {
            let line = k.console.fg_line();
            let tty = k.ttys.get(line).ok_or(Errno::ENXIO)?;
            selection::paste_selection(k, &tty)
        }
    }
}

/// Console-specific part of the tty ioctl surface.
pub fn vt_ioctl(k: &Kernel, tty: &Arc<Tty>, _file: &TtyFile, cmd: &mut TtyIoctl<'_>)
    -> Result<isize> {
    if tty.line == 0 || tty.line > NR_CONSOLES {
        return Err(Errno::EINVAL);
    }
    let cons = tty.line - 1;
    match cmd {
        TtyIoctl::Kd(kd) => kd_ioctl(k, tty, cons, kd),
        TtyIoctl::Vt(vtc) => vt_family_ioctl(k, cons, vtc),
        _ => Err(Errno::ENOTTY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::tty::{tty_ioctl, tty_open, OpenFlags};
    use crate::drivers::mock::mock_kernel;

    #[test]
    fn test_switch_to_dead_process_reverts_to_auto() {
        let (k, _p, sched) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        // The foreground console is process-managed by a pid that has
        // exited.
        {
            let mut st = k.console.state.lock();
            st.vcs[0].vt_mode = VtMode {
                mode: VtSwitchMode::Process,
                waitv: false,
                relsig: Signal::SigUsr1.to_u32() as u8,
                acqsig: Signal::SigUsr2.to_u32() as u8,
                frsig: 0,
            };
            st.vcs[0].vt_pid = 777;
        }
        sched.mark_dead(777);
        let mut cmd = TtyIoctl::Vt(VtIoctl::Activate(2));
        tty_ioctl(&k, &file, &mut cmd).unwrap();
        assert_eq!(k.console.fg_console(), 1);
        let st = k.console.state.lock();
        assert_eq!(st.vcs[0].vt_mode.mode, VtSwitchMode::Auto);
        assert_eq!(st.vcs[0].vt_pid, -1);
        assert_eq!(st.vcs[0].vc_mode, KdMode::Text);
    }

    #[test]
    fn test_process_managed_switch_handshake() {
        let (k, _p, sched) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let mut cmd = TtyIoctl::Vt(VtIoctl::SetMode(VtMode {
            mode: VtSwitchMode::Process,
            waitv: false,
            relsig: Signal::SigUsr1.to_u32() as u8,
            acqsig: Signal::SigUsr2.to_u32() as u8,
            frsig: 0,
        }));
        tty_ioctl(&k, &file, &mut cmd).unwrap();

        // The switch is deferred pending VT_RELDISP.
        change_console(&k, 2);
        assert_eq!(k.console.fg_console(), 0);
        assert_eq!(k.console.state.lock().vcs[0].vt_newvt, 2);
        assert!(sched
            .signal_log
            .lock()
            .iter()
            .any(|&(pid, sig)| pid == 100 && sig == Signal::SigUsr1));

        // Release with argument 0: the switch is forgotten.
        let mut rel = TtyIoctl::Vt(VtIoctl::RelDisp(0));
        tty_ioctl(&k, &file, &mut rel).unwrap();
        assert_eq!(k.console.state.lock().vcs[0].vt_newvt, -1);
        assert_eq!(k.console.fg_console(), 0);

        // Ask again and complete it this time.
        change_console(&k, 2);
        let mut rel = TtyIoctl::Vt(VtIoctl::RelDisp(1));
        tty_ioctl(&k, &file, &mut rel).unwrap();
        assert_eq!(k.console.fg_console(), 2);
    }

    #[test]
    fn test_getstate_and_openqry() {
        let (k, _p, _s) = mock_kernel();
        let _f1 = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let f = tty_open(&k, 3, OpenFlags::default()).unwrap();
        let mut stat = VtStat::default();
        let mut cmd = TtyIoctl::Vt(VtIoctl::GetState(&mut stat));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        assert_eq!(stat.v_active, 1);
        // Bit 0 always, plus lines 1 and 3.
        assert_eq!(stat.v_state, 1 | (1 << 1) | (1 << 3));

        let mut free = 0i32;
        let mut cmd = TtyIoctl::Vt(VtIoctl::OpenQry(&mut free));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        assert_eq!(free, 2);
    }

    #[test]
    fn test_kb_mode_roundtrip() {
        let (k, _p, _s) = mock_kernel();
        let f = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let mut cmd = TtyIoctl::Kd(KdIoctl::SetKbMode(K_MEDIUMRAW));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        let mut mode = 0u32;
        let mut cmd = TtyIoctl::Kd(KdIoctl::GetKbMode(&mut mode));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        assert_eq!(mode, K_MEDIUMRAW);
        let mut cmd = TtyIoctl::Kd(KdIoctl::SetKbMode(K_XLATE));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
    }

    #[test]
    fn test_kdsetmode_graphics_blanks() {
        let (k, p, _s) = mock_kernel();
        let f = tty_open(&k, 1, OpenFlags::default()).unwrap();
        crate::drivers::char::tty::tty_write(&k, &f, b"\x1b[2J\x1b[HM").unwrap();
        let mut cmd = TtyIoctl::Kd(KdIoctl::SetMode(KD_GRAPHICS));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        // Video memory was blanked; the glyph lives in the shadow.
        assert_eq!(p.cell(0), 0x0020);
        {
            let st = k.console.state.lock();
            assert_eq!(st.vcs[0].screen[0] & 0xff, u16::from(b'M'));
        }
        let mut cmd = TtyIoctl::Kd(KdIoctl::SetMode(KD_TEXT));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        assert_eq!(p.cell(0) & 0xff, u16::from(b'M'));
    }

    #[test]
    fn test_scrnmap_forces_control_holes() {
        let (k, _p, _s) = mock_kernel();
        let f = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let map = [0xffu8; 256];
        let mut cmd = TtyIoctl::Kd(KdIoctl::PioScrnMap(&map));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        let st = k.console.state.lock();
        assert_eq!(st.user_trans[10], 0);
        assert_eq!(st.user_trans[12], 0);
        assert_eq!(st.user_trans[13], 0);
        assert_eq!(st.user_trans[27], 0);
        assert_eq!(st.user_trans[65], 0xff);
    }

    #[test]
    fn test_ioport_delegation_bounds() {
        let (k, _p, _s) = mock_kernel();
        let f = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let mut cmd = TtyIoctl::Kd(KdIoctl::AddIo(0x3c0));
        tty_ioctl(&k, &f, &mut cmd).unwrap();
        let mut cmd = TtyIoctl::Kd(KdIoctl::AddIo(0x200));
        assert_eq!(tty_ioctl(&k, &f, &mut cmd), Err(crate::Errno::EINVAL));
    }
}
