//! Zero OS Kernel Macros
//!
//! Debug output for the memory core. `debug_print!` takes a level keyword
//! followed by ordinary format arguments:
//!
//! ```text
//! debug_print!(INFO, "odp: {} ITCM pages", count);
//! ```
//!
//! `DEBUG` and `TRACE` lines compile away in release builds.

#![deny(missing_docs)]

/// Debug output levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DebugLevel {
    /// Error messages - always shown
    Error = 0,
    /// Warning messages
    Warning = 1,
    /// Information messages
    Info = 2,
    /// Debug messages
    Debug = 3,
    /// Trace messages - most verbose
    Trace = 4,
}

impl DebugLevel {
    /// Short tag printed in front of each line
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Whether lines of this level are emitted in the current build
    pub const fn enabled(self) -> bool {
        match self {
            Self::Debug | Self::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Emit one log line at `level`
pub fn emit(level: DebugLevel, target: &'static str, args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;

    if !level.enabled() {
        return;
    }
    let mut writer = crate::arch::DebugWriter::new();
    let _ = write!(writer, "[{} {}] ", level.tag(), target);
    let _ = writer.write_fmt(args);
    let _ = writer.write_str("\n");
}

#[macro_export]
#[doc(hidden)]
macro_rules! __debug_level {
    (ERROR) => {
        $crate::macros::DebugLevel::Error
    };
    (WARN) => {
        $crate::macros::DebugLevel::Warning
    };
    (INFO) => {
        $crate::macros::DebugLevel::Info
    };
    (DEBUG) => {
        $crate::macros::DebugLevel::Debug
    };
    (TRACE) => {
        $crate::macros::DebugLevel::Trace
    };
}

/// Print a debug line through the installed console
#[macro_export]
macro_rules! debug_print {
    ($level:ident, $($arg:tt)*) => {
        $crate::macros::emit(
            $crate::__debug_level!($level),
            module_path!(),
            format_args!($($arg)*),
        )
    };
}
