// Kernel logging (printk) with a bounded ring of formatted records

use alloc::collections::VecDeque;
use alloc::string::String;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

/// Capacity of the log ring; the oldest record is dropped on overflow.
const LOG_RING_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

static LOG_RING: Mutex<VecDeque<(LogLevel, String)>> = Mutex::new(VecDeque::new());

/// Set the runtime log level; records above this level are discarded.
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_enabled(level: LogLevel) -> bool {
    (level as u8) <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Append a formatted record to the ring.
pub fn log_record(level: LogLevel, args: core::fmt::Arguments) {
    if !log_enabled(level) {
        return;
    }
    let mut ring = LOG_RING.lock();
    if ring.len() == LOG_RING_CAP {
        ring.pop_front();
    }
    ring.push_back((level, alloc::format!("{}", args)));
}

/// Snapshot the current ring contents (tests and dmesg-style readers).
pub fn snapshot() -> alloc::vec::Vec<(LogLevel, String)> {
    LOG_RING.lock().iter().cloned().collect()
}

/// Drop all buffered records.
pub fn clear() {
    LOG_RING.lock().clear();
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::klib::klog::log_record($crate::klib::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klib::klog::log_record($crate::klib::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::klib::klog::log_record($crate::klib::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::klib::klog::log_record($crate::klib::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gate() {
        set_log_level(LogLevel::Warn);
        assert!(log_enabled(LogLevel::Error));
        assert!(!log_enabled(LogLevel::Info));
        set_log_level(LogLevel::Debug);
    }

    #[test]
    fn test_ring_records() {
        kerror!("device {} ready", 3);
        let snap = snapshot();
        assert!(snap.iter().any(|(_, s)| s.contains("device 3 ready")));
    }
}
