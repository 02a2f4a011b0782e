// PC keyboard driver: scancode decoding, shift-state tracking, keysym
// dispatch through the loadable key map, dead keys, and the keyboard
// bottom half (LED sync, console switching, break handling).
//
// The interrupt path only touches keyboard state and the raw queue;
// anything that needs the console or tty locks (switches, scroll-lock
// hold, scrollback) is recorded and replayed from the bottom half.

use core::sync::atomic::Ordering;
use spin::Mutex;

use alloc::vec::Vec;

use crate::drivers::char::termios::{Iflag, Lflag};
use crate::drivers::char::tty::{self, NR_CONSOLES, TTY_BREAK};
use crate::kernel::Kernel;
use crate::klib::error::{Errno, Result};
use crate::sched::Signal;
use crate::kwarn;

// Keyboard controller ports.
pub const KBD_DATA_PORT: u16 = 0x60;
pub const KBD_STATUS_PORT: u16 = 0x64;

/// Output-buffer-full bits the decoder accepts as keyboard data.
pub const KBD_READ_MASK: u8 = 0x01;

pub const KBD_CMD_DISABLE: u8 = 0xAD;
pub const KBD_CMD_ENABLE: u8 = 0xAE;
pub const KBD_SET_LEDS: u8 = 0xED;

// Per-console LED bits (externally visible order).
pub const VC_SCROLLOCK: u8 = 0;
pub const VC_NUMLOCK: u8 = 1;
pub const VC_CAPSLOCK: u8 = 2;

// Per-console mode flag bits.
pub const VC_APPLIC: u8 = 0;
pub const VC_CKMODE: u8 = 1;
pub const VC_REPEAT: u8 = 2;
pub const VC_CRLF: u8 = 3;
pub const VC_META: u8 = 4;
pub const VC_RAW: u8 = 6;
pub const VC_MEDIUMRAW: u8 = 7;

// Modifier numbers (also lock-state bits and keymap index bits).
pub const KG_SHIFT: u8 = 0;
pub const KG_ALTGR: u8 = 1;
pub const KG_CTRL: u8 = 2;
pub const KG_ALT: u8 = 3;
pub const KG_SHIFTL: u8 = 4;
pub const KG_SHIFTR: u8 = 5;
pub const KG_CTRLL: u8 = 6;
pub const KG_CTRLR: u8 = 7;
pub const KG_CAPSSHIFT: u8 = 8;

pub const NR_SHIFT: usize = 9;
pub const NR_KEYS: usize = 128;
pub const NR_KEYMAPS: usize = 16;

// Keysym types.
pub const KT_LATIN: u8 = 0;
pub const KT_FN: u8 = 1;
pub const KT_SPEC: u8 = 2;
pub const KT_PAD: u8 = 3;
pub const KT_DEAD: u8 = 4;
pub const KT_CONS: u8 = 5;
pub const KT_CUR: u8 = 6;
pub const KT_SHIFT: u8 = 7;
pub const KT_META: u8 = 8;
pub const KT_ASCII: u8 = 9;
pub const KT_LOCK: u8 = 10;
pub const KT_LETTER: u8 = 11;
pub const NR_TYPES: usize = 12;

/// Largest value each key type accepts (KDSKBENT validation).
pub const MAX_VALS: [u8; NR_TYPES] = [
    255,
    NR_FUNC as u8 - 1,
    14,
    17,
    4,
    255,
    3,
    NR_SHIFT as u8,
    255,
    9,
    3,
    255,
];

#[inline]
pub const fn k(typ: u8, val: u8) -> u16 {
    ((typ as u16) << 8) | val as u16
}

#[inline]
pub const fn ktyp(sym: u16) -> u8 {
    (sym >> 8) as u8
}

#[inline]
pub const fn kval(sym: u16) -> u8 {
    (sym & 0xff) as u8
}

// Special-function values (KT_SPEC).
pub const SPEC_ENTER: u8 = 1;
pub const SPEC_SHOW_PTREGS: u8 = 2;
pub const SPEC_SHOW_MEM: u8 = 3;
pub const SPEC_SHOW_STATE: u8 = 4;
pub const SPEC_SEND_INTR: u8 = 5;
pub const SPEC_LASTCONS: u8 = 6;
pub const SPEC_CAPS_TOGGLE: u8 = 7;
pub const SPEC_NUM: u8 = 8;
pub const SPEC_HOLD: u8 = 9;
pub const SPEC_SCROLL_FORW: u8 = 10;
pub const SPEC_SCROLL_BACK: u8 = 11;
pub const SPEC_BOOT: u8 = 12;
pub const SPEC_CAPS_ON: u8 = 13;
pub const SPEC_COMPOSE: u8 = 14;

// Pad values (KT_PAD), indexing "0123456789+-*/\r,.?".
pub const PAD_P0: u8 = 0;
pub const PAD_PLUS: u8 = 10;
pub const PAD_MINUS: u8 = 11;
pub const PAD_STAR: u8 = 12;
pub const PAD_SLASH: u8 = 13;
pub const PAD_ENTER: u8 = 14;
pub const PAD_COMMA: u8 = 15;
pub const PAD_DOT: u8 = 16;

// Function-key values (KT_FN).
pub const FN_F1: u8 = 0;
pub const FN_FIND: u8 = 20; // Home
pub const FN_INSERT: u8 = 21;
pub const FN_REMOVE: u8 = 22; // Delete
pub const FN_SELECT: u8 = 23; // End
pub const FN_PGUP: u8 = 24;
pub const FN_PGDN: u8 = 25;

// Cursor values (KT_CUR), indexing "BDCA".
pub const CUR_DOWN: u8 = 0;
pub const CUR_LEFT: u8 = 1;
pub const CUR_RIGHT: u8 = 2;
pub const CUR_UP: u8 = 3;

// Dead-key values (KT_DEAD) index this table.
static RET_DIACR: [u8; 5] = [b'`', b'\'', b'^', b'~', b'"'];

pub const NR_FUNC: usize = 36;
pub const FUNC_BUFSIZE: usize = 2048;
pub const MAX_DIACR: usize = 256;

/// Keysyms produced by `E0`-escaped scancodes start here.
pub const E0_BASE: u8 = 96;

const E0_KPENTER: u8 = E0_BASE;
const E0_RCTRL: u8 = E0_BASE + 1;
const E0_KPSLASH: u8 = E0_BASE + 2;
const E0_PRSCR: u8 = E0_BASE + 3;
const E0_RALT: u8 = E0_BASE + 4;
const E0_BREAK: u8 = E0_BASE + 5;
const E0_HOME: u8 = E0_BASE + 6;
const E0_UP: u8 = E0_BASE + 7;
const E0_PGUP: u8 = E0_BASE + 8;
const E0_LEFT: u8 = E0_BASE + 9;
const E0_RIGHT: u8 = E0_BASE + 10;
const E0_END: u8 = E0_BASE + 11;
const E0_DOWN: u8 = E0_BASE + 12;
const E0_PGDN: u8 = E0_BASE + 13;
const E0_INS: u8 = E0_BASE + 14;
const E0_DEL: u8 = E0_BASE + 15;
const E1_PAUSE: u8 = E0_BASE + 23;

/// Translation of `E0 xx` scancodes to keysyms.
static E0_KEYS: [u8; 128] = {
    let mut t = [0u8; 128];
    t[0x1c] = E0_KPENTER;
    t[0x1d] = E0_RCTRL;
    t[0x35] = E0_KPSLASH;
    t[0x37] = E0_PRSCR;
    t[0x38] = E0_RALT;
    t[0x46] = E0_BREAK;
    t[0x47] = E0_HOME;
    t[0x48] = E0_UP;
    t[0x49] = E0_PGUP;
    t[0x4b] = E0_LEFT;
    t[0x4d] = E0_RIGHT;
    t[0x4f] = E0_END;
    t[0x50] = E0_DOWN;
    t[0x51] = E0_PGDN;
    t[0x52] = E0_INS;
    t[0x53] = E0_DEL;
    t
};

/// Accent composition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KbDiacr {
    pub diacr: u8,
    pub base: u8,
    pub result: u8,
}

fn default_accent_table() -> Vec<KbDiacr> {
    let entries: &[(u8, u8, u8)] = &[
        (b'`', b'A', 0xC0),
        (b'`', b'E', 0xC8),
        (b'`', b'I', 0xCC),
        (b'`', b'O', 0xD2),
        (b'`', b'U', 0xD9),
        (b'`', b'a', 0xE0),
        (b'`', b'e', 0xE8),
        (b'`', b'i', 0xEC),
        (b'`', b'o', 0xF2),
        (b'`', b'u', 0xF9),
        (b'\'', b'A', 0xC1),
        (b'\'', b'E', 0xC9),
        (b'\'', b'I', 0xCD),
        (b'\'', b'O', 0xD3),
        (b'\'', b'U', 0xDA),
        (b'\'', b'y', 0xFD),
        (b'\'', b'a', 0xE1),
        (b'\'', b'e', 0xE9),
        (b'\'', b'i', 0xED),
        (b'\'', b'o', 0xF3),
        (b'\'', b'u', 0xFA),
        (b'^', b'A', 0xC2),
        (b'^', b'E', 0xCA),
        (b'^', b'I', 0xCE),
        (b'^', b'O', 0xD4),
        (b'^', b'U', 0xDB),
        (b'^', b'a', 0xE2),
        (b'^', b'e', 0xEA),
        (b'^', b'i', 0xEE),
        (b'^', b'o', 0xF4),
        (b'^', b'u', 0xFB),
        (b'~', b'A', 0xC3),
        (b'~', b'N', 0xD1),
        (b'~', b'O', 0xD5),
        (b'~', b'a', 0xE3),
        (b'~', b'n', 0xF1),
        (b'~', b'o', 0xF5),
        (b'"', b'A', 0xC4),
        (b'"', b'E', 0xCB),
        (b'"', b'I', 0xCF),
        (b'"', b'O', 0xD6),
        (b'"', b'U', 0xDC),
        (b'"', b'a', 0xE4),
        (b'"', b'e', 0xEB),
        (b'"', b'i', 0xEF),
        (b'"', b'o', 0xF6),
        (b'"', b'u', 0xFC),
        (b'"', b'y', 0xFF),
    ];
    entries
        .iter()
        .map(|&(diacr, base, result)| KbDiacr { diacr, base, result })
        .collect()
}

/// Build the default US key map.
fn default_key_map() -> Vec<[u16; NR_KEYS]> {
    let mut maps = alloc::vec![[0u16; NR_KEYS]; NR_KEYMAPS];

    let plain_ascii: &[(usize, u8)] = &[
        (1, 0x1b),
        (2, b'1'),
        (3, b'2'),
        (4, b'3'),
        (5, b'4'),
        (6, b'5'),
        (7, b'6'),
        (8, b'7'),
        (9, b'8'),
        (10, b'9'),
        (11, b'0'),
        (12, b'-'),
        (13, b'='),
        (14, 0x7f),
        (15, b'\t'),
        (26, b'['),
        (27, b']'),
        (39, b';'),
        (40, b'\''),
        (41, b'`'),
        (43, b'\\'),
        (51, b','),
        (52, b'.'),
        (53, b'/'),
        (57, b' '),
        (86, b'<'),
    ];
    let shift_ascii: &[(usize, u8)] = &[
        (1, 0x1b),
        (2, b'!'),
        (3, b'@'),
        (4, b'#'),
        (5, b'$'),
        (6, b'%'),
        (7, b'^'),
        (8, b'&'),
        (9, b'*'),
        (10, b'('),
        (11, b')'),
        (12, b'_'),
        (13, b'+'),
        (14, 0x7f),
        (15, b'\t'),
        (26, b'{'),
        (27, b'}'),
        (39, b':'),
        (40, b'"'),
        (41, b'~'),
        (43, b'|'),
        (51, b'<'),
        (52, b'>'),
        (53, b'?'),
        (57, b' '),
        (86, b'>'),
    ];
    let letters: &[(usize, u8)] = &[
        (16, b'q'),
        (17, b'w'),
        (18, b'e'),
        (19, b'r'),
        (20, b't'),
        (21, b'y'),
        (22, b'u'),
        (23, b'i'),
        (24, b'o'),
        (25, b'p'),
        (30, b'a'),
        (31, b's'),
        (32, b'd'),
        (33, b'f'),
        (34, b'g'),
        (35, b'h'),
        (36, b'j'),
        (37, b'k'),
        (38, b'l'),
        (44, b'z'),
        (45, b'x'),
        (46, b'c'),
        (47, b'v'),
        (48, b'b'),
        (49, b'n'),
        (50, b'm'),
    ];

    for &(sc, ch) in plain_ascii {
        maps[0][sc] = k(KT_LATIN, ch);
    }
    for &(sc, ch) in shift_ascii {
        maps[1][sc] = k(KT_LATIN, ch);
    }
    for &(sc, ch) in letters {
        maps[0][sc] = k(KT_LETTER, ch);
        maps[1][sc] = k(KT_LETTER, ch.to_ascii_uppercase());
        // Control combinations strip to C0 codes.
        maps[4][sc] = k(KT_LATIN, ch & 0x1f);
        maps[8][sc] = k(KT_META, ch);
        maps[12][sc] = k(KT_META, ch & 0x1f);
    }

    // Modifier keys, identical in every map.
    let modifiers: &[(usize, u8)] = &[
        (29, KG_CTRL),
        (42, KG_SHIFT),
        (54, KG_SHIFTR),
        (56, KG_ALT),
        (E0_RCTRL as usize, KG_CTRL),
        (E0_RALT as usize, KG_ALTGR),
    ];
    // Keys that behave the same regardless of shift state.
    let fixed: &[(usize, u16)] = &[
        (28, k(KT_SPEC, SPEC_ENTER)),
        (58, k(KT_SPEC, SPEC_CAPS_TOGGLE)),
        (69, k(KT_SPEC, SPEC_NUM)),
        (70, k(KT_SPEC, SPEC_HOLD)),
        (55, k(KT_PAD, PAD_STAR)),
        (71, k(KT_PAD, 7)),
        (72, k(KT_PAD, 8)),
        (73, k(KT_PAD, 9)),
        (74, k(KT_PAD, PAD_MINUS)),
        (75, k(KT_PAD, 4)),
        (76, k(KT_PAD, 5)),
        (77, k(KT_PAD, 6)),
        (78, k(KT_PAD, PAD_PLUS)),
        (79, k(KT_PAD, 1)),
        (80, k(KT_PAD, 2)),
        (81, k(KT_PAD, 3)),
        (82, k(KT_PAD, PAD_P0)),
        (83, k(KT_PAD, PAD_DOT)),
        (E0_KPENTER as usize, k(KT_PAD, PAD_ENTER)),
        (E0_KPSLASH as usize, k(KT_PAD, PAD_SLASH)),
        (E0_HOME as usize, k(KT_FN, FN_FIND)),
        (E0_UP as usize, k(KT_CUR, CUR_UP)),
        (E0_PGUP as usize, k(KT_FN, FN_PGUP)),
        (E0_LEFT as usize, k(KT_CUR, CUR_LEFT)),
        (E0_RIGHT as usize, k(KT_CUR, CUR_RIGHT)),
        (E0_END as usize, k(KT_FN, FN_SELECT)),
        (E0_DOWN as usize, k(KT_CUR, CUR_DOWN)),
        (E0_PGDN as usize, k(KT_FN, FN_PGDN)),
        (E0_INS as usize, k(KT_FN, FN_INSERT)),
        (E0_DEL as usize, k(KT_FN, FN_REMOVE)),
        (E0_PRSCR as usize, k(KT_SPEC, SPEC_LASTCONS)),
        (E1_PAUSE as usize, k(KT_SPEC, SPEC_HOLD)),
    ];

    for map in maps.iter_mut() {
        for &(sc, m) in modifiers {
            map[sc] = k(KT_SHIFT, m);
        }
        for &(sc, sym) in fixed {
            map[sc] = sym;
        }
    }

    // Function keys: plain sends strings, alt switches consoles.
    for i in 0..12usize {
        let sc = if i < 10 { 59 + i } else { 87 + (i - 10) };
        maps[0][sc] = k(KT_FN, FN_F1 + i as u8);
        maps[1][sc] = k(KT_FN, FN_F1 + i as u8);
        if i < 8 {
            maps[8][sc] = k(KT_CONS, i as u8);
            maps[12][sc] = k(KT_CONS, i as u8);
        }
    }
    // Ctrl-Alt-Del reboots.
    maps[12][83] = k(KT_SPEC, SPEC_BOOT);
    maps[12][E0_DEL as usize] = k(KT_SPEC, SPEC_BOOT);

    maps
}

fn default_func_table() -> ([u8; FUNC_BUFSIZE], [usize; NR_FUNC]) {
    let strings: [&[u8]; NR_FUNC] = [
        b"\x1b[[A",
        b"\x1b[[B",
        b"\x1b[[C",
        b"\x1b[[D",
        b"\x1b[[E",
        b"\x1b[17~",
        b"\x1b[18~",
        b"\x1b[19~",
        b"\x1b[20~",
        b"\x1b[21~",
        b"\x1b[23~",
        b"\x1b[24~",
        b"\x1b[25~",
        b"\x1b[26~",
        b"\x1b[28~",
        b"\x1b[29~",
        b"\x1b[31~",
        b"\x1b[32~",
        b"\x1b[33~",
        b"\x1b[34~",
        b"\x1b[1~",  // Find / Home
        b"\x1b[2~",  // Insert
        b"\x1b[3~",  // Remove / Delete
        b"\x1b[4~",  // Select / End
        b"\x1b[5~",  // Prior / PgUp
        b"\x1b[6~",  // Next / PgDn
        b"",
        b"",
        b"",
        b"",
        b"",
        b"",
        b"",
        b"",
        b"",
        b"",
    ];
    let mut buf = [0u8; FUNC_BUFSIZE];
    let mut offsets = [0usize; NR_FUNC];
    let mut at = 0;
    for (i, s) in strings.iter().enumerate() {
        offsets[i] = at;
        buf[at..at + s.len()].copy_from_slice(s);
        at += s.len() + 1; // NUL terminated
    }
    (buf, offsets)
}

/// Per-console keyboard flags.
#[derive(Debug, Clone, Copy)]
pub struct KbdPerVc {
    pub ledstate: u8,
    pub default_ledstate: u8,
    pub lockstate: u8,
    pub modeflags: u8,
}

impl Default for KbdPerVc {
    fn default() -> Self {
        Self {
            ledstate: 0,
            default_ledstate: 0,
            lockstate: 0,
            modeflags: (1 << VC_REPEAT) | (1 << VC_META),
        }
    }
}

struct KbdState {
    per_vc: [KbdPerVc; NR_CONSOLES],
    /// Pending E0/E1 prefix (0x100 marks the E1 1D midpoint).
    prev_scancode: u16,
    /// Depressed-keysym bitmap.
    key_down: [u64; 2],
    /// Per-modifier depth counters.
    k_down: [u8; NR_SHIFT],
    shift_state: u8,
    /// Number assembled on the pad via Alt, or -1.
    npadch: i32,
    diacr: u8,
    dead_key_next: bool,
    /// Current key is a repeat (was already down).
    rep: bool,
    // Work deferred to the bottom half.
    want_console: i32,
    last_console: usize,
    got_break: bool,
    want_hold: bool,
    want_scroll: i32,
    want_boot: bool,
    old_leds: u8,
    key_map: Vec<[u16; NR_KEYS]>,
    func_buf: [u8; FUNC_BUFSIZE],
    func_offsets: [usize; NR_FUNC],
    accent_table: Vec<KbDiacr>,
}

pub struct Keyboard {
    st: Mutex<KbdState>,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboard {
    pub fn new() -> Self {
        let (func_buf, func_offsets) = default_func_table();
        Self {
            st: Mutex::new(KbdState {
                per_vc: [KbdPerVc::default(); NR_CONSOLES],
                prev_scancode: 0,
                key_down: [0; 2],
                k_down: [0; NR_SHIFT],
                shift_state: 0,
                npadch: -1,
                diacr: 0,
                dead_key_next: false,
                rep: false,
                want_console: -1,
                last_console: 0,
                got_break: false,
                want_hold: false,
                want_scroll: 0,
                want_boot: false,
                old_leds: 0xff,
                key_map: default_key_map(),
                func_buf,
                func_offsets,
                accent_table: default_accent_table(),
            }),
        }
    }

    pub fn get_mode(&self, cons: usize, bit: u8) -> bool {
        self.st.lock().per_vc[cons].modeflags & (1 << bit) != 0
    }

    pub fn set_mode(&self, cons: usize, bit: u8, on: bool) {
        let mut st = self.st.lock();
        if on {
            st.per_vc[cons].modeflags |= 1 << bit;
        } else {
            st.per_vc[cons].modeflags &= !(1 << bit);
        }
    }

    pub fn ledstate(&self, cons: usize) -> u8 {
        self.st.lock().per_vc[cons].ledstate
    }

    pub fn set_ledstate(&self, k: &Kernel, cons: usize, leds: u8) {
        self.st.lock().per_vc[cons].ledstate = leds;
        self.set_leds(k);
    }

    pub fn set_led(&self, k: &Kernel, cons: usize, bit: u8, on: bool) {
        {
            let mut st = self.st.lock();
            if on {
                st.per_vc[cons].ledstate |= 1 << bit;
            } else {
                st.per_vc[cons].ledstate &= !(1 << bit);
            }
        }
        self.set_leds(k);
    }

    pub fn led(&self, cons: usize, bit: u8) -> bool {
        self.st.lock().per_vc[cons].ledstate & (1 << bit) != 0
    }

    pub fn reset_locks_and_leds(&self, cons: usize) {
        let mut st = self.st.lock();
        st.per_vc[cons].lockstate = 0;
        st.per_vc[cons].ledstate = st.per_vc[cons].default_ledstate;
    }

    /// Schedule an LED refresh from the bottom half.
    pub fn set_leds(&self, k: &Kernel) {
        k.bh.mark(crate::sched::BH_KEYBOARD);
    }

    pub fn keymap_entry(&self, table: usize, index: usize) -> Result<u16> {
        if table >= NR_KEYMAPS || index >= NR_KEYS {
            return Err(Errno::EINVAL);
        }
        Ok(self.st.lock().key_map[table][index])
    }

    pub fn set_keymap_entry(&self, table: usize, index: usize, value: u16) -> Result<()> {
        if table >= NR_KEYMAPS || index >= NR_KEYS {
            return Err(Errno::EINVAL);
        }
        let typ = ktyp(value) as usize;
        if typ >= NR_TYPES || kval(value) > MAX_VALS[typ] {
            return Err(Errno::EINVAL);
        }
        self.st.lock().key_map[table][index] = value;
        Ok(())
    }

    /// Fetch a function-key string (KDGKBSENT).
    pub fn func_string(&self, func: usize) -> Result<Vec<u8>> {
        if func >= NR_FUNC {
            return Err(Errno::EINVAL);
        }
        let st = self.st.lock();
        let start = st.func_offsets[func];
        let end = st.func_buf[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(start);
        Ok(st.func_buf[start..end].to_vec())
    }

    /// Replace a function-key string (KDSKBSENT): later entries are
    /// moved and repointed inside the fixed pool.
    pub fn set_func_string(&self, func: usize, s: &[u8]) -> Result<()> {
        if func >= NR_FUNC || s.contains(&0) {
            return Err(Errno::EINVAL);
        }
        let mut st = self.st.lock();
        let start = st.func_offsets[func];
        let old_len = st.func_buf[start..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(0);
        let delta = s.len() as isize - old_len as isize;
        let last = st.func_offsets[NR_FUNC - 1];
        let last_len = st.func_buf[last..].iter().position(|&b| b == 0).unwrap_or(0);
        let first_free = last + last_len + 1;
        if delta > 0 && first_free as isize + delta > FUNC_BUFSIZE as isize {
            return Err(Errno::EINVAL);
        }
        if func < NR_FUNC - 1 {
            let next = st.func_offsets[func + 1];
            let tail = st.func_buf[next..first_free].to_vec();
            let new_next = (next as isize + delta) as usize;
            st.func_buf[new_next..new_next + tail.len()].copy_from_slice(&tail);
            for off in st.func_offsets[func + 1..].iter_mut() {
                *off = (*off as isize + delta) as usize;
            }
        }
        st.func_buf[start..start + s.len()].copy_from_slice(s);
        st.func_buf[start + s.len()] = 0;
        Ok(())
    }

    pub fn accent_entries(&self) -> Vec<KbDiacr> {
        self.st.lock().accent_table.clone()
    }

    pub fn set_accent_entries(&self, entries: &[KbDiacr]) -> Result<()> {
        if entries.len() >= MAX_DIACR {
            return Err(Errno::EINVAL);
        }
        self.st.lock().accent_table = entries.to_vec();
        Ok(())
    }

    /// Recompute modifier counters from the depressed bitmap, after
    /// leaving raw mode or switching consoles.
    pub fn compute_shiftstate(&self, _cons: usize) {
        let mut st = self.st.lock();
        st.shift_state = 0;
        st.k_down = [0; NR_SHIFT];
        for word in 0..st.key_down.len() {
            if st.key_down[word] == 0 {
                continue;
            }
            for bit in 0..64 {
                if st.key_down[word] & (1 << bit) == 0 {
                    continue;
                }
                let sym = st.key_map[0][word * 64 + bit];
                if ktyp(sym) == KT_SHIFT {
                    let val = kval(sym) as usize;
                    if val < NR_SHIFT {
                        st.k_down[val] += 1;
                        st.shift_state |= 1 << val;
                    }
                }
            }
        }
    }
}

/// Queue one byte toward the foreground console's reader.
fn put_queue(k: &Kernel, ch: u8) {
    k.sched.wake_up(&k.keypress_wait);
    let Some(tty) = k.ttys.get(k.console.fg_line()) else {
        return;
    };
    let mut q = tty.read_q.inner.lock();
    if !q.is_full() {
        q.put(ch);
    }
}

fn puts_queue(k: &Kernel, s: &[u8]) {
    for &c in s {
        put_queue(k, c);
    }
}

fn applkey(k: &Kernel, key: u8, mode: bool) {
    puts_queue(k, &[0x1b, if mode { b'O' } else { b'[' }, key]);
}

/// Combine a base character with the pending accent, or flush the
/// accent when no composition exists.
fn handle_diacr(k: &Kernel, st: &mut KbdState, ch: u8) -> Option<u8> {
    let d = st.diacr;
    st.diacr = 0;
    if ch == b' ' {
        return Some(d);
    }
    for e in st.accent_table.iter() {
        if e.diacr == d && e.base == ch {
            return Some(e.result);
        }
    }
    put_queue(k, d);
    Some(ch)
}

fn fn_string_bytes(st: &KbdState, func: usize) -> Vec<u8> {
    let start = st.func_offsets[func];
    let end = st.func_buf[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(start);
    st.func_buf[start..end].to_vec()
}

fn do_fn(k: &Kernel, st: &mut KbdState, value: u8, up: bool) {
    if up {
        return;
    }
    if (value as usize) < NR_FUNC {
        let s = fn_string_bytes(st, value as usize);
        puts_queue(k, &s);
    } else {
        kwarn!("keyboard: do_fn with value {}", value);
    }
}

fn do_cur(k: &Kernel, st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if up {
        return;
    }
    let chars = b"BDCA";
    let ck = st.per_vc[cons].modeflags & (1 << VC_CKMODE) != 0;
    applkey(k, chars[value as usize], ck);
}

fn do_pad(k: &Kernel, st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if up {
        return;
    }
    let pad_chars = b"0123456789+-*/\r,.?";
    let app_map = b"pqrstuvwxylSRQMnn?";
    let applic = st.per_vc[cons].modeflags & (1 << VC_APPLIC) != 0;
    // Shift forces numbers even in application mode.
    if applic && st.k_down[KG_SHIFT as usize] == 0 {
        applkey(k, app_map[value as usize], true);
        return;
    }
    if st.per_vc[cons].ledstate & (1 << VC_NUMLOCK) == 0 {
        match value {
            PAD_COMMA | PAD_DOT => return do_fn(k, st, FN_REMOVE, false),
            PAD_P0 => return do_fn(k, st, FN_INSERT, false),
            1 => return do_fn(k, st, FN_SELECT, false),
            2 => return do_cur(k, st, cons, CUR_DOWN, false),
            3 => return do_fn(k, st, FN_PGDN, false),
            4 => return do_cur(k, st, cons, CUR_LEFT, false),
            6 => return do_cur(k, st, cons, CUR_RIGHT, false),
            7 => return do_fn(k, st, FN_FIND, false),
            8 => return do_cur(k, st, cons, CUR_UP, false),
            9 => return do_fn(k, st, FN_PGUP, false),
            5 => {
                applkey(k, b'G', applic);
                return;
            }
            _ => {}
        }
    }
    put_queue(k, pad_chars[value as usize]);
    if value == PAD_ENTER && st.per_vc[cons].modeflags & (1 << VC_CRLF) != 0 {
        put_queue(k, 10);
    }
}

fn do_spec(k: &Kernel, st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if up {
        return;
    }
    match value {
        SPEC_ENTER => {
            put_queue(k, 13);
            if st.per_vc[cons].modeflags & (1 << VC_CRLF) != 0 {
                put_queue(k, 10);
            }
        }
        SPEC_SEND_INTR => st.got_break = true,
        SPEC_LASTCONS => st.want_console = st.last_console as i32,
        SPEC_CAPS_TOGGLE => {
            if !st.rep {
                st.per_vc[cons].ledstate ^= 1 << VC_CAPSLOCK;
            }
        }
        SPEC_CAPS_ON => {
            if !st.rep {
                st.per_vc[cons].ledstate |= 1 << VC_CAPSLOCK;
            }
        }
        SPEC_NUM => {
            if st.per_vc[cons].modeflags & (1 << VC_APPLIC) != 0 {
                applkey(k, b'P', true);
            } else if !st.rep {
                st.per_vc[cons].ledstate ^= 1 << VC_NUMLOCK;
            }
        }
        SPEC_HOLD => {
            if !st.rep {
                st.want_hold = true;
            }
        }
        SPEC_SCROLL_FORW => st.want_scroll = 1,
        SPEC_SCROLL_BACK => st.want_scroll = -1,
        SPEC_BOOT => st.want_boot = true,
        SPEC_COMPOSE => st.dead_key_next = true,
        _ => {}
    }
}

fn do_self(k: &Kernel, st: &mut KbdState, value: u8, up: bool) {
    if up {
        return;
    }
    let mut value = value;
    if st.diacr != 0 {
        match handle_diacr(k, st, value) {
            Some(v) => value = v,
            None => return,
        }
    }
    if st.dead_key_next {
        st.dead_key_next = false;
        st.diacr = value;
        return;
    }
    put_queue(k, value);
}

fn do_dead(k: &Kernel, st: &mut KbdState, value: u8, up: bool) {
    if up {
        return;
    }
    let value = RET_DIACR[value as usize];
    if st.diacr == value {
        // Pressed twice: the diacritic itself.
        st.diacr = 0;
        put_queue(k, value);
        return;
    }
    st.diacr = value;
}

fn do_shift(k: &Kernel, st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if st.rep {
        return;
    }
    let mut value = value;
    if value == KG_CAPSSHIFT {
        value = KG_SHIFT;
        st.per_vc[cons].ledstate &= !(1 << VC_CAPSLOCK);
    }
    let old_state = st.shift_state;
    let idx = value as usize;
    if up {
        if st.k_down[idx] > 0 {
            st.k_down[idx] -= 1;
        }
    } else {
        st.k_down[idx] += 1;
    }
    if st.k_down[idx] > 0 {
        st.shift_state |= 1 << value;
    } else {
        st.shift_state &= !(1 << value);
    }
    // Releasing the modifier delivers an Alt-numpad accumulation.
    if up && st.shift_state != old_state && st.npadch != -1 {
        put_queue(k, st.npadch as u8);
        st.npadch = -1;
    }
}

fn do_meta(k: &Kernel, st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if up {
        return;
    }
    if st.per_vc[cons].modeflags & (1 << VC_META) != 0 {
        put_queue(k, 0x1b);
        put_queue(k, value);
    } else {
        put_queue(k, value | 0x80);
    }
}

fn do_ascii(st: &mut KbdState, value: u8, up: bool) {
    if up {
        return;
    }
    if st.npadch == -1 {
        st.npadch = i32::from(value);
    } else {
        st.npadch = (st.npadch * 10 + i32::from(value)) % 1000;
    }
}

fn do_lock(st: &mut KbdState, cons: usize, value: u8, up: bool) {
    if up || st.rep {
        return;
    }
    st.per_vc[cons].lockstate ^= 1 << value;
}

fn do_cons(st: &mut KbdState, value: u8, up: bool) {
    if up {
        return;
    }
    st.want_console = i32::from(value);
}

/// Hardware interrupt: read a scancode from the controller and decode
/// it. Everything slow is deferred to `kbd_bh`.
pub fn keyboard_interrupt(k: &Kernel) {
    send_cmd(k, KBD_CMD_DISABLE);
    let status = k.platform.port_in8(KBD_STATUS_PORT);
    if status & KBD_READ_MASK != 0x01 {
        send_cmd(k, KBD_CMD_ENABLE);
        return;
    }
    let scancode = k.platform.port_in8(KBD_DATA_PORT);
    k.bh.mark(crate::sched::BH_KEYBOARD);
    handle_scancode(k, scancode);
    send_cmd(k, KBD_CMD_ENABLE);
}

fn send_cmd(k: &Kernel, c: u8) {
    k.platform.port_out8(KBD_STATUS_PORT, c);
}

/// Decode one scancode byte (also the entry point tests use).
pub fn handle_scancode(k: &Kernel, scancode: u8) {
    let cons = k.console.fg_console();
    let mut st = k.kbd.st.lock();

    match scancode {
        0xfa | 0xfe => return, // ack / resend, for send_data
        0 => {
            kwarn!("keyboard: buffer overflow");
            return;
        }
        0xff => {
            kwarn!("keyboard: error");
            st.prev_scancode = 0;
            return;
        }
        _ => {}
    }

    let raw_mode = st.per_vc[cons].modeflags & (1 << VC_RAW) != 0;
    if raw_mode {
        drop(st);
        put_queue(k, scancode);
        st = k.kbd.st.lock();
        // Fall through to keep the depressed bitmap accurate.
    }
    if scancode == 0xe0 || scancode == 0xe1 {
        st.prev_scancode = u16::from(scancode);
        return;
    }

    let up_flag = scancode & 0x80 != 0;
    let mut keysym = scancode & 0x7f;

    if st.prev_scancode != 0 {
        if st.prev_scancode != 0xe0 {
            // Pause: E1 1D 45 E1 9D C5, nothing on release.
            if st.prev_scancode == 0xe1 && keysym == 0x1d {
                st.prev_scancode = 0x100;
                return;
            } else if st.prev_scancode == 0x100 && keysym == 0x45 {
                keysym = E1_PAUSE;
                st.prev_scancode = 0;
            } else {
                kwarn!("keyboard: unknown e1 escape sequence");
                st.prev_scancode = 0;
                return;
            }
        } else {
            st.prev_scancode = 0;
            // Fake shifts around the navigation cluster.
            if keysym == 0x2a || keysym == 0x36 {
                return;
            }
            if E0_KEYS[keysym as usize] != 0 {
                keysym = E0_KEYS[keysym as usize];
            } else if !raw_mode {
                kwarn!("keyboard: unknown scancode e0 {:02x}", keysym);
                return;
            }
        }
    } else if keysym >= E0_BASE && !raw_mode {
        kwarn!("keyboard: scancode {:02x} out of range", keysym);
        return;
    }

    let idx = keysym as usize;
    if up_flag {
        st.key_down[idx / 64] &= !(1 << (idx % 64));
        st.rep = false;
    } else {
        let was = st.key_down[idx / 64] & (1 << (idx % 64)) != 0;
        st.key_down[idx / 64] |= 1 << (idx % 64);
        st.rep = was;
    }

    if raw_mode {
        return;
    }

    if st.per_vc[cons].modeflags & (1 << VC_MEDIUMRAW) != 0 {
        drop(st);
        put_queue(k, keysym | if up_flag { 0x80 } else { 0 });
        return;
    }

    // Deliver repeats only when echo is on or the reader has caught
    // up, so a slow consumer is not buried.
    let deliver = if st.rep {
        let repeat_on = st.per_vc[cons].modeflags & (1 << VC_REPEAT) != 0;
        if !repeat_on {
            false
        } else {
            match k.ttys.get(k.console.fg_line()) {
                None => false,
                Some(tty) => {
                    let echo = tty.termios.read().c_lflag.contains(Lflag::ECHO);
                    echo || (tty.secondary.is_empty() && tty.read_q.is_empty())
                }
            }
        }
    } else {
        true
    };
    if !deliver {
        return;
    }

    let shift_final = (st.shift_state ^ st.per_vc[cons].lockstate) as usize;
    let mut key_code = st.key_map[shift_final & (NR_KEYMAPS - 1)][idx];
    let mut typ = ktyp(key_code);

    if typ == KT_LETTER {
        typ = KT_LATIN;
        if st.per_vc[cons].ledstate & (1 << VC_CAPSLOCK) != 0 {
            key_code =
                st.key_map[(shift_final ^ (1 << KG_SHIFT)) & (NR_KEYMAPS - 1)][idx];
        }
    }

    let value = kval(key_code);
    match typ {
        KT_LATIN => do_self(k, &mut st, value, up_flag),
        KT_FN => do_fn(k, &mut st, value, up_flag),
        KT_SPEC => do_spec(k, &mut st, cons, value, up_flag),
        KT_PAD => do_pad(k, &mut st, cons, value, up_flag),
        KT_DEAD => do_dead(k, &mut st, value, up_flag),
        KT_CONS => do_cons(&mut st, value, up_flag),
        KT_CUR => do_cur(k, &mut st, cons, value, up_flag),
        KT_SHIFT => do_shift(k, &mut st, cons, value, up_flag),
        KT_META => do_meta(k, &mut st, cons, value, up_flag),
        KT_ASCII => do_ascii(&mut st, value, up_flag),
        KT_LOCK => do_lock(&mut st, cons, value, up_flag),
        _ => {}
    }
}

/// Mirror the flow-control state on the scroll-lock LED.
pub fn set_scroll_lock(k: &Kernel, on: bool) {
    let fg = k.console.fg_console();
    k.kbd.set_led(k, fg, VC_SCROLLOCK, on);
}

/// Keyboard bottom half: LED sync, console switching, break handling,
/// cooked-queue drain, blank-timer rearm.
pub fn kbd_bh(k: &Kernel) {
    let fg = k.console.fg_console();
    let (leds_to_send, want_console, got_break, want_hold, want_scroll, want_boot);
    {
        let mut st = k.kbd.st.lock();
        let leds = st.per_vc[fg].ledstate;
        leds_to_send = if leds != st.old_leds {
            st.old_leds = leds;
            Some(leds)
        } else {
            None
        };
        want_console = st.want_console;
        st.want_console = -1;
        got_break = st.got_break;
        st.got_break = false;
        want_hold = st.want_hold;
        st.want_hold = false;
        want_scroll = st.want_scroll;
        st.want_scroll = 0;
        want_boot = st.want_boot;
        st.want_boot = false;
        if want_console >= 0 && want_console as usize != fg {
            st.last_console = fg;
        }
    }

    if let Some(leds) = leds_to_send {
        k.platform.port_out8(KBD_DATA_PORT, KBD_SET_LEDS);
        k.platform.port_out8(KBD_DATA_PORT, leds & 0x07);
    }
    if want_console >= 0 && (want_console as usize) < NR_CONSOLES {
        if want_console as usize != fg {
            crate::drivers::char::vt::change_console(k, want_console as usize);
        }
    }
    if want_scroll != 0 {
        let mut cs = k.console.state.lock();
        let half = (cs.rows / 2) as isize;
        cs.scrolldelta(k, want_scroll as isize * half);
    }
    if want_boot {
        crate::kwarn!("keyboard: ctrl-alt-del");
    }

    let tty = k.ttys.get(k.console.fg_line());
    if want_hold {
        if let Some(ref tty) = tty {
            if tty.stopped.load(Ordering::Acquire) {
                tty::start_tty(k, tty);
            } else {
                tty::stop_tty(k, tty);
            }
        }
    }
    if got_break {
        if let Some(ref tty) = tty {
            let t = *tty.termios.read();
            if !t.c_iflag.contains(Iflag::IGNBRK) {
                if t.c_iflag.contains(Iflag::BRKINT) {
                    tty::flush_input(k, tty);
                    tty::flush_output(k, tty);
                    let pgrp = tty.pgrp.load(Ordering::Acquire);
                    if pgrp > 0 {
                        let _ = k.sched.kill_pg(pgrp, Signal::SigInt, true);
                    }
                } else {
                    let mut q = tty.read_q.inner.lock();
                    if q.left() >= 2 {
                        q.put_flagged(TTY_BREAK);
                        q.put(0);
                    }
                }
            }
        }
    }
    // Cooked-queue drain and blank-timer rearm.
    if let Some(ref tty) = tty {
        tty::tty_read_flush(k, tty);
    }
    {
        let mut cs = k.console.state.lock();
        cs.touch_blank_timer(k);
    }
    // A byte that arrived while the interrupt was masked is still
    // sitting in the controller; retrigger the interrupt path for it.
    if k.platform.port_in8(KBD_STATUS_PORT) & KBD_READ_MASK == 0x01 {
        keyboard_interrupt(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::tty::{tty_open, OpenFlags};
    use crate::drivers::mock::mock_kernel;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn setup() -> (Arc<crate::Kernel>, Arc<crate::drivers::char::tty::Tty>) {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let tty = k.ttys.get(file.line).unwrap();
        (k, tty)
    }

    fn raw_bytes(tty: &crate::drivers::char::tty::Tty) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((c, _)) = tty.read_q.get() {
            out.push(c);
        }
        out
    }

    #[test]
    fn test_plain_key() {
        let (k, tty) = setup();
        handle_scancode(&k, 0x1e); // a make
        handle_scancode(&k, 0x9e); // a break
        assert_eq!(raw_bytes(&tty), b"a");
    }

    #[test]
    fn test_shifted_key() {
        let (k, tty) = setup();
        handle_scancode(&k, 0x2a); // lshift down
        handle_scancode(&k, 0x1e);
        handle_scancode(&k, 0x9e);
        handle_scancode(&k, 0xaa); // lshift up
        assert_eq!(raw_bytes(&tty), b"A");
    }

    #[test]
    fn test_caps_lock_applies_to_letters_only() {
        let (k, tty) = setup();
        handle_scancode(&k, 0x3a); // caps make
        handle_scancode(&k, 0xba); // caps break
        handle_scancode(&k, 0x1e); // a
        handle_scancode(&k, 0x9e);
        handle_scancode(&k, 0x02); // 1
        handle_scancode(&k, 0x82);
        assert_eq!(raw_bytes(&tty), b"A1");
    }

    #[test]
    fn test_e0_cursor_key() {
        let (k, tty) = setup();
        handle_scancode(&k, 0xe0);
        handle_scancode(&k, 0x48); // Up
        handle_scancode(&k, 0xe0);
        handle_scancode(&k, 0xc8);
        assert_eq!(raw_bytes(&tty), b"\x1b[A");
    }

    #[test]
    fn test_fake_shifts_are_dropped() {
        let (k, tty) = setup();
        handle_scancode(&k, 0xe0);
        handle_scancode(&k, 0x2a);
        handle_scancode(&k, 0xe0);
        handle_scancode(&k, 0xaa);
        assert_eq!(raw_bytes(&tty), b"");
        // And the shift state is untouched.
        assert_eq!(k.kbd.st.lock().shift_state, 0);
    }

    #[test]
    fn test_e1_pause_sequence() {
        let (k, tty) = setup();
        for sc in [0xe1, 0x1d, 0x45, 0xe1, 0x9d, 0xc5] {
            handle_scancode(&k, sc);
        }
        // Pause maps to the hold function: nothing queued, work
        // deferred to the bottom half.
        assert_eq!(raw_bytes(&tty), b"");
        assert!(k.kbd.st.lock().want_hold);
    }

    #[test]
    fn test_ctrl_combination() {
        let (k, tty) = setup();
        handle_scancode(&k, 0x1d); // ctrl down
        handle_scancode(&k, 0x2e); // c
        handle_scancode(&k, 0xae);
        handle_scancode(&k, 0x9d);
        assert_eq!(raw_bytes(&tty), [3]);
    }

    #[test]
    fn test_meta_sets_high_bit_or_prefixes_escape() {
        let (k, tty) = setup();
        // Default is ESC-prefix mode.
        handle_scancode(&k, 0x38); // alt down
        handle_scancode(&k, 0x1e);
        handle_scancode(&k, 0x9e);
        handle_scancode(&k, 0xb8);
        assert_eq!(raw_bytes(&tty), [0x1b, b'a']);
        k.kbd.set_mode(0, VC_META, false);
        handle_scancode(&k, 0x38);
        handle_scancode(&k, 0x1e);
        handle_scancode(&k, 0x9e);
        handle_scancode(&k, 0xb8);
        assert_eq!(raw_bytes(&tty), [b'a' | 0x80]);
    }

    #[test]
    fn test_raw_mode_passes_scancodes() {
        let (k, tty) = setup();
        k.kbd.set_mode(0, VC_RAW, true);
        handle_scancode(&k, 0x1e);
        handle_scancode(&k, 0x9e);
        assert_eq!(raw_bytes(&tty), [0x1e, 0x9e]);
    }

    #[test]
    fn test_mediumraw_carries_up_flag() {
        let (k, tty) = setup();
        k.kbd.set_mode(0, VC_MEDIUMRAW, true);
        handle_scancode(&k, 0x1e);
        handle_scancode(&k, 0x9e);
        assert_eq!(raw_bytes(&tty), [0x1e, 0x1e | 0x80]);
    }

    #[test]
    fn test_repeat_gating_with_full_queue() {
        let (k, tty) = setup();
        // Turn echo off so repeats depend on empty queues.
        {
            let mut t = tty.termios.write();
            t.c_lflag.remove(crate::drivers::char::termios::Lflag::ECHO);
        }
        handle_scancode(&k, 0x1e); // make: queued
        handle_scancode(&k, 0x1e); // repeat with nonempty raw queue: dropped
        assert_eq!(raw_bytes(&tty), b"a");
        handle_scancode(&k, 0x1e); // repeat with drained queue: delivered
        assert_eq!(raw_bytes(&tty), b"a");
    }

    #[test]
    fn test_dead_key_composition() {
        let (kern, tty) = setup();
        // Map the backtick key to a dead grave accent.
        kern.kbd
            .set_keymap_entry(0, 41, k(KT_DEAD, 0))
            .unwrap();
        handle_scancode(&kern, 41); // dead grave
        handle_scancode(&kern, 41 | 0x80);
        handle_scancode(&kern, 0x1e); // a
        handle_scancode(&kern, 0x9e);
        assert_eq!(raw_bytes(&tty), [0xE0]); // a-grave
        // Dead key then space yields the accent itself.
        handle_scancode(&kern, 41);
        handle_scancode(&kern, 41 | 0x80);
        handle_scancode(&kern, 57); // space
        handle_scancode(&kern, 57 | 0x80);
        assert_eq!(raw_bytes(&tty), b"`");
    }

    #[test]
    fn test_console_switch_key_defers_to_bh() {
        let (k, tty) = setup();
        handle_scancode(&k, 0x38); // alt
        handle_scancode(&k, 0x3c); // F2
        handle_scancode(&k, 0xbc);
        handle_scancode(&k, 0xb8);
        assert_eq!(raw_bytes(&tty), b"");
        assert_eq!(k.kbd.st.lock().want_console, 1);
        kbd_bh(&k);
        assert_eq!(k.console.fg_console(), 1);
    }

    #[test]
    fn test_bh_retriggers_missed_interrupt() {
        let (k, p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags::default()).unwrap();
        let tty = k.ttys.get(file.line).unwrap();
        // A make/break pair arrived while the interrupt was masked:
        // the controller still has it, and only the bottom half's
        // retrigger can pick it up.
        p.push_port_input(KBD_DATA_PORT, &[0x1e, 0x9e]);
        k.bh.mark(crate::sched::BH_KEYBOARD);
        k.run_bottom_halves();
        // The retriggered bytes were decoded and cooked.
        assert!(tty.read_q.is_empty());
        let mut cooked = Vec::new();
        while let Some((c, _)) = tty.secondary.get() {
            cooked.push(c);
        }
        assert_eq!(cooked, b"a");
        // Nothing further is pending in the controller.
        assert_eq!(k.platform.port_in8(KBD_STATUS_PORT) & KBD_READ_MASK, 0);
    }

    #[test]
    fn test_function_key_string_pool_edit() {
        let (k, _tty) = setup();
        assert_eq!(k.kbd.func_string(0).unwrap(), b"\x1b[[A");
        // Grow F1; the following strings move inside the pool.
        k.kbd.set_func_string(0, b"hello-world").unwrap();
        assert_eq!(k.kbd.func_string(0).unwrap(), b"hello-world");
        assert_eq!(k.kbd.func_string(1).unwrap(), b"\x1b[[B");
        assert_eq!(k.kbd.func_string(25).unwrap(), b"\x1b[6~");
        // Shrink works too.
        k.kbd.set_func_string(0, b"x").unwrap();
        assert_eq!(k.kbd.func_string(0).unwrap(), b"x");
        assert_eq!(k.kbd.func_string(1).unwrap(), b"\x1b[[B");
    }

    #[test]
    fn test_keymap_entry_validation() {
        let (kern, _tty) = setup();
        assert!(kern.kbd.set_keymap_entry(0, 30, k(KT_LATIN, b'q')).is_ok());
        // Type out of range.
        assert!(kern.kbd.set_keymap_entry(0, 30, k(13, 0)).is_err());
        // Value beyond the type's maximum.
        assert!(kern.kbd.set_keymap_entry(0, 30, k(KT_CUR, 9)).is_err());
        assert!(kern.kbd.set_keymap_entry(99, 30, k(KT_LATIN, 0)).is_err());
    }
}
