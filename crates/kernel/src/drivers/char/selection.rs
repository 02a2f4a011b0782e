// Copy and paste: a character / word / line region of the visible
// screen is highlighted by swapping the attribute nibbles and captured
// into a bounded buffer; pasting pushes the text into the foreground
// tty's raw queue.

use alloc::sync::Arc;

use crate::drivers::char::console::ConState;
use crate::drivers::char::queue::TTY_BUF_SIZE;
use crate::drivers::char::tty::{self, Tty};
use crate::kernel::Kernel;
use crate::klib::error::Result;

pub const SEL_BUFFER_SIZE: usize = TTY_BUF_SIZE;

/// Selection request, 1-based screen coordinates.
#[derive(Debug, Clone, Copy)]
pub struct SelArg {
    pub xs: u16,
    pub ys: u16,
    pub xe: u16,
    pub ye: u16,
    /// 0 = character, 1 = word, 2 = line.
    pub mode: u16,
}

fn inword(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn isspace(c: u8) -> bool {
    c == b' '
}

/// Base cell of the visible screen of the selection console.
fn view_base(st: &ConState, cons: usize) -> usize {
    if st.vcs[cons].in_video {
        st.origin_reg
    } else {
        st.vcs[cons].origin
    }
}

fn char_at(k: &Kernel, st: &ConState, cons: usize, cell: usize) -> u8 {
    (st.rd(k, cons, view_base(st, cons) + cell) & 0xff) as u8
}

/// Toggle reverse video on cells s..=e (inclusive).
fn highlight(k: &Kernel, st: &mut ConState, cons: usize, s: usize, e: usize) {
    let base = view_base(st, cons);
    let (s, e) = if s <= e { (s, e) } else { (e, s) };
    for cell in s..=e {
        let v = st.rd(k, cons, base + cell);
        let a = (v >> 8) as u8;
        let na = (a & 0x88) | ((a << 4) & 0x70) | ((a >> 4) & 0x07);
        st.wr(k, cons, base + cell, ((na as u16) << 8) | (v & 0xff));
    }
}

/// Remove the current highlight, if any.
pub fn clear_selection(k: &Kernel, st: &mut ConState) {
    if let Some(start) = st.sel.sel_start.take() {
        let end = st.sel.sel_end;
        let cons = st.sel.sel_cons;
        highlight(k, st, cons, start, end);
    }
}

fn atedge(p: usize, cols: usize) -> bool {
    p % cols == 0 || (p + 1) % cols == 0
}

/// Set the current selection and extract its text.
pub fn set_selection(k: &Kernel, arg: SelArg) -> Result<isize> {
    let mut st = k.console.state.lock();
    st.unblank_screen(k);
    let cons = st.fg_console;
    let cols = st.cols;
    let rows = st.rows;

    let xs = usize::from(arg.xs.saturating_sub(1)).min(cols - 1);
    let ys = usize::from(arg.ys.saturating_sub(1)).min(rows - 1);
    let xe = usize::from(arg.xe.saturating_sub(1)).min(cols - 1);
    let ye = usize::from(arg.ye.saturating_sub(1)).min(rows - 1);
    let mut ps = ys * cols + xs;
    let mut pe = ye * cols + xe;
    if ps > pe {
        core::mem::swap(&mut ps, &mut pe);
    }

    let (mut new_start, mut new_end) = (ps, pe);
    match arg.mode {
        1 => {
            // Word selection: extend over the run the endpoints sit in.
            let spc = isspace(char_at(k, &st, cons, ps));
            loop {
                let c = char_at(k, &st, cons, ps);
                if (spc && !isspace(c)) || (!spc && !inword(c)) {
                    break;
                }
                new_start = ps;
                if ps % cols == 0 || ps == 0 {
                    break;
                }
                ps -= 1;
            }
            let spc = isspace(char_at(k, &st, cons, pe));
            loop {
                let c = char_at(k, &st, cons, pe);
                if (spc && !isspace(c)) || (!spc && !inword(c)) {
                    break;
                }
                new_end = pe;
                if (pe + 1) % cols == 0 || pe + 1 >= rows * cols {
                    break;
                }
                pe += 1;
            }
        }
        2 => {
            // Line selection.
            new_start = ps - ps % cols;
            new_end = pe + cols - pe % cols - 1;
        }
        _ => {}
    }

    // Select to end of line if ending on a trailing space.
    if new_end > new_start
        && !atedge(new_end, cols)
        && isspace(char_at(k, &st, cons, new_end))
    {
        let mut pe = new_end + 1;
        loop {
            if !isspace(char_at(k, &st, cons, pe)) || atedge(pe, cols) {
                break;
            }
            pe += 1;
        }
        if isspace(char_at(k, &st, cons, pe)) {
            new_end = pe;
        }
    }

    if st.sel.sel_cons != cons {
        clear_selection(k, &mut st);
        st.sel.sel_cons = cons;
    }
    match st.sel.sel_start {
        None => highlight(k, &mut st, cons, new_start, new_end),
        Some(old_start) => {
            let old_end = st.sel.sel_end;
            if new_start == old_start {
                if new_end == old_end {
                    return Ok(0);
                } else if new_end > old_end {
                    highlight(k, &mut st, cons, old_end + 1, new_end);
                } else {
                    highlight(k, &mut st, cons, new_end + 1, old_end);
                }
            } else if new_end == old_end {
                if new_start < old_start {
                    highlight(k, &mut st, cons, new_start, old_start - 1);
                } else {
                    highlight(k, &mut st, cons, old_start, new_start - 1);
                }
            } else {
                clear_selection(k, &mut st);
                st.sel.sel_cons = cons;
                highlight(k, &mut st, cons, new_start, new_end);
            }
        }
    }
    st.sel.sel_start = Some(new_start);
    st.sel.sel_end = new_end;

    // Extract, stripping trailing blanks and folding line boundaries
    // to \r (unless a line runs to the right edge).
    let mut buffer = alloc::vec::Vec::with_capacity(new_end - new_start + 1);
    let mut keep = 0;
    for cell in new_start..=new_end {
        let c = char_at(k, &st, cons, cell);
        buffer.push(c);
        if !isspace(c) {
            keep = buffer.len();
        }
        if (cell + 1) % cols == 0 {
            if keep != buffer.len() {
                buffer.truncate(keep);
                buffer.push(b'\r');
            }
            keep = buffer.len();
        }
        if buffer.len() > SEL_BUFFER_SIZE - 3 {
            break;
        }
    }
    st.sel.buffer = buffer;
    Ok(0)
}

/// Push the selection buffer into the tty attached to the foreground
/// console.
pub fn paste_selection(k: &Kernel, tty: &Arc<Tty>) -> Result<isize> {
    let bytes = {
        let mut st = k.console.state.lock();
        st.unblank_screen(k);
        st.sel.buffer.clone()
    };
    for c in bytes {
        tty.read_q.put(c);
        tty::tty_read_flush(k, tty);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::char::tty::{tty_open, tty_write, OpenFlags};
    use crate::drivers::mock::mock_kernel;

    #[test]
    fn test_select_word_and_paste() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags { nonblock: true, noctty: false }).unwrap();
        tty_write(&k, &file, b"\x1b[2J\x1b[Hhello world").unwrap();
        // Word-select over "hello" (1-based coordinates).
        set_selection(
            &k,
            SelArg {
                xs: 2,
                ys: 1,
                xe: 3,
                ye: 1,
                mode: 1,
            },
        )
        .unwrap();
        {
            let st = k.console.state.lock();
            assert_eq!(st.sel.buffer, b"hello");
            assert_eq!(st.sel.sel_start, Some(0));
            assert_eq!(st.sel.sel_end, 4);
        }
        // The highlighted span swapped its attribute nibbles.
        {
            let st = k.console.state.lock();
            assert_eq!(st.rd(&k, 0, 0) >> 8, 0x70);
            assert_eq!(st.rd(&k, 0, 5) >> 8, 0x07);
        }
        let tty = k.ttys.get(file.line).unwrap();
        paste_selection(&k, &tty).unwrap();
        // Pasted text has no terminator; read the cooked queue
        // directly.
        let mut collected = alloc::vec::Vec::new();
        while let Some((c, _)) = tty.secondary.get() {
            collected.push(c);
        }
        assert_eq!(collected, b"hello");
    }

    #[test]
    fn test_line_selection_strips_trailing_blanks() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags { nonblock: true, noctty: false }).unwrap();
        tty_write(&k, &file, b"\x1b[2J\x1b[Hab\r\ncd").unwrap();
        set_selection(
            &k,
            SelArg {
                xs: 1,
                ys: 1,
                xe: 1,
                ye: 2,
                mode: 2,
            },
        )
        .unwrap();
        let st = k.console.state.lock();
        assert_eq!(st.sel.buffer, b"ab\rcd");
    }

    #[test]
    fn test_writing_clears_selection() {
        let (k, _p, _s) = mock_kernel();
        let file = tty_open(&k, 1, OpenFlags { nonblock: true, noctty: false }).unwrap();
        tty_write(&k, &file, b"\x1b[2J\x1b[Hxyz").unwrap();
        set_selection(
            &k,
            SelArg {
                xs: 1,
                ys: 1,
                xe: 3,
                ye: 1,
                mode: 0,
            },
        )
        .unwrap();
        assert!(k.console.state.lock().sel.sel_start.is_some());
        tty_write(&k, &file, b"!").unwrap();
        let st = k.console.state.lock();
        assert!(st.sel.sel_start.is_none());
        // The highlight was undone.
        assert_eq!(st.rd(&k, 0, 0) >> 8, 0x07);
    }
}
