// Terminal mode flags and special-character table

use bitflags::bitflags;

bitflags! {
    /// Input mode flags (c_iflag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iflag: u32 {
        const IGNBRK = 0o000001; // Ignore break condition
        const BRKINT = 0o000002; // Signal interrupt on break
        const IGNPAR = 0o000004; // Ignore parity errors
        const PARMRK = 0o000010; // Mark parity errors
        const INPCK  = 0o000020; // Enable input parity check
        const ISTRIP = 0o000040; // Strip to 7 bits
        const INLCR  = 0o000100; // Map NL to CR on input
        const IGNCR  = 0o000200; // Ignore CR
        const ICRNL  = 0o000400; // Map CR to NL on input
        const IUCLC  = 0o001000; // Map uppercase to lowercase
        const IXON   = 0o002000; // Enable start/stop output control
        const IXANY  = 0o004000; // Any character restarts output
        const IXOFF  = 0o010000; // Enable start/stop input control
    }
}

bitflags! {
    /// Output mode flags (c_oflag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Oflag: u32 {
        const OPOST  = 0o000001; // Post-process output
        const OLCUC  = 0o000002; // Map lowercase to uppercase
        const ONLCR  = 0o000004; // Map NL to CR-NL
        const OCRNL  = 0o000010; // Map CR to NL
        const ONOCR  = 0o000020; // No CR at column 0
        const ONLRET = 0o000040; // NL performs CR function
        const XTABS  = 0o014000; // Expand tabs to spaces
    }
}

bitflags! {
    /// Control mode flags (c_cflag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cflag: u32 {
        const CS8    = 0o000060; // 8 data bits
        const CSTOPB = 0o000100; // Two stop bits
        const CREAD  = 0o000200; // Enable receiver
        const PARENB = 0o000400; // Parity enable
        const PARODD = 0o001000; // Odd parity
        const HUPCL  = 0o002000; // Hang up on last close
        const CLOCAL = 0o004000; // Ignore modem control lines
    }
}

bitflags! {
    /// Local mode flags (c_lflag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lflag: u32 {
        const ISIG    = 0o000001; // Enable signal characters
        const ICANON  = 0o000002; // Canonical input processing
        const ECHO    = 0o000010; // Echo input
        const ECHOE   = 0o000020; // Visual erase
        const ECHOK   = 0o000040; // Echo NL after kill
        const ECHONL  = 0o000100; // Echo NL even without ECHO
        const NOFLSH  = 0o000200; // No flush on signal
        const TOSTOP  = 0o000400; // SIGTTOU on background writes
        const ECHOCTL = 0o001000; // Echo control chars as ^X
        const ECHOPRT = 0o002000; // Print-style erase
        const ECHOKE  = 0o004000; // Visual line kill
        const IEXTEN  = 0o100000; // Extended input processing
    }
}

// Control character indices.
pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VTIME: usize = 5;
pub const VMIN: usize = 6;
pub const VSWTC: usize = 7;
pub const VSTART: usize = 8;
pub const VSTOP: usize = 9;
pub const VSUSP: usize = 10;
pub const VEOL: usize = 11;
pub const VREPRINT: usize = 12;
pub const VDISCARD: usize = 13;
pub const VWERASE: usize = 14;
pub const VLNEXT: usize = 15;
pub const VEOL2: usize = 16;
pub const NCCS: usize = 19;

/// A c_cc entry equal to this value never matches an input byte; an
/// input byte equal to it is treated as literal-next so it cannot be
/// mistaken for a disabled control character. It also doubles as the
/// end-of-file sentinel stored in the cooked queue.
pub const DISABLED_CHAR: u8 = 0xff;

/// Baud rate field values (c_cflag low bits).
pub const B9600: u32 = 0o000015;
pub const B38400: u32 = 0o000017;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
    pub c_iflag: Iflag,
    pub c_oflag: Oflag,
    pub c_cflag: Cflag,
    pub c_lflag: Lflag,
    /// Line discipline number.
    pub c_line: u8,
    pub c_cc: [u8; NCCS],
    /// Baud bits kept separate from the Cflag flag word.
    pub c_baud: u32,
}

/// Default control characters: ^C ^\ DEL ^U ^D, VTIME=0 VMIN=1, ^Q ^S
/// ^Z, EOL disabled, ^R ^O ^W ^V, EOL2 disabled.
pub const INIT_C_CC: [u8; NCCS] = [
    0o003,         // VINTR    ^C
    0o034,         // VQUIT    ^backslash
    0o177,         // VERASE   DEL
    0o025,         // VKILL    ^U
    0o004,         // VEOF     ^D
    0,             // VTIME
    1,             // VMIN
    0,             // VSWTC
    0o021,         // VSTART   ^Q
    0o023,         // VSTOP    ^S
    0o032,         // VSUSP    ^Z
    DISABLED_CHAR, // VEOL
    0o022,         // VREPRINT ^R
    0o017,         // VDISCARD ^O
    0o027,         // VWERASE  ^W
    0o026,         // VLNEXT   ^V
    DISABLED_CHAR, // VEOL2
    0,
    0,
];

impl Termios {
    /// Cooked defaults used by consoles and pty slaves.
    pub fn console_default() -> Self {
        Self {
            c_iflag: Iflag::ICRNL | Iflag::IXON,
            c_oflag: Oflag::OPOST | Oflag::ONLCR,
            c_cflag: Cflag::CS8 | Cflag::CREAD,
            c_lflag: Lflag::ISIG
                | Lflag::ICANON
                | Lflag::ECHO
                | Lflag::ECHOE
                | Lflag::ECHOK
                | Lflag::ECHOCTL
                | Lflag::ECHOKE
                | Lflag::IEXTEN,
            c_line: 0,
            c_cc: INIT_C_CC,
            c_baud: B38400,
        }
    }

    /// A pty master carries raw settings; the slave side cooks.
    pub fn pty_master_default() -> Self {
        Self {
            c_iflag: Iflag::empty(),
            c_oflag: Oflag::empty(),
            c_cflag: Cflag::CS8 | Cflag::CREAD,
            c_lflag: Lflag::empty(),
            c_line: 0,
            c_cc: INIT_C_CC,
            c_baud: B9600,
        }
    }

    pub fn intr_char(&self) -> u8 {
        self.c_cc[VINTR]
    }
    pub fn quit_char(&self) -> u8 {
        self.c_cc[VQUIT]
    }
    pub fn erase_char(&self) -> u8 {
        self.c_cc[VERASE]
    }
    pub fn kill_char(&self) -> u8 {
        self.c_cc[VKILL]
    }
    pub fn eof_char(&self) -> u8 {
        self.c_cc[VEOF]
    }
    pub fn start_char(&self) -> u8 {
        self.c_cc[VSTART]
    }
    pub fn stop_char(&self) -> u8 {
        self.c_cc[VSTOP]
    }
    pub fn susp_char(&self) -> u8 {
        self.c_cc[VSUSP]
    }
    pub fn eol_char(&self) -> u8 {
        self.c_cc[VEOL]
    }
    pub fn eol2_char(&self) -> u8 {
        self.c_cc[VEOL2]
    }
    pub fn reprint_char(&self) -> u8 {
        self.c_cc[VREPRINT]
    }
    pub fn werase_char(&self) -> u8 {
        self.c_cc[VWERASE]
    }
    pub fn lnext_char(&self) -> u8 {
        self.c_cc[VLNEXT]
    }
    pub fn time_char(&self) -> u8 {
        self.c_cc[VTIME]
    }
    pub fn min_char(&self) -> u8 {
        self.c_cc[VMIN]
    }
}

/// Legacy sgtty record translated onto termios by the compatibility
/// ioctls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sgttyb {
    pub sg_ispeed: u8,
    pub sg_ospeed: u8,
    pub sg_erase: u8,
    pub sg_kill: u8,
    pub sg_flags: u16,
}

// sgtty flag bits.
pub const SG_RAW: u16 = 0x20;
pub const SG_ECHO: u16 = 0x08;
pub const SG_CRMOD: u16 = 0x10;

impl Sgttyb {
    pub fn from_termios(t: &Termios) -> Self {
        let mut flags = 0u16;
        if !t.c_lflag.contains(Lflag::ICANON) {
            flags |= SG_RAW;
        }
        if t.c_lflag.contains(Lflag::ECHO) {
            flags |= SG_ECHO;
        }
        if t.c_oflag.contains(Oflag::ONLCR) {
            flags |= SG_CRMOD;
        }
        Self {
            sg_ispeed: 0,
            sg_ospeed: 0,
            sg_erase: t.erase_char(),
            sg_kill: t.kill_char(),
            sg_flags: flags,
        }
    }

    pub fn apply_to(&self, t: &mut Termios) {
        t.c_cc[VERASE] = self.sg_erase;
        t.c_cc[VKILL] = self.sg_kill;
        t.c_lflag.set(Lflag::ICANON, self.sg_flags & SG_RAW == 0);
        t.c_lflag.set(Lflag::ECHO, self.sg_flags & SG_ECHO != 0);
        t.c_oflag.set(Oflag::ONLCR, self.sg_flags & SG_CRMOD != 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_defaults() {
        let t = Termios::console_default();
        assert!(t.c_lflag.contains(Lflag::ICANON | Lflag::ECHO));
        assert_eq!(t.intr_char(), 3);
        assert_eq!(t.eof_char(), 4);
        assert_eq!(t.eol_char(), DISABLED_CHAR);
    }

    #[test]
    fn test_sgtty_roundtrip() {
        let mut t = Termios::console_default();
        let sg = Sgttyb::from_termios(&t);
        assert_eq!(sg.sg_flags & SG_RAW, 0);
        let mut raw = sg;
        raw.sg_flags |= SG_RAW;
        raw.apply_to(&mut t);
        assert!(!t.c_lflag.contains(Lflag::ICANON));
    }
}
