//! Kernel printk with buffering
//!
//! Messages always land in a ring buffer first; once a console is attached
//! and the buffer flushed, new messages also go directly to the registered
//! consoles. The buffer preserves early-boot output for later replay.
//!
//! Two locks keep output atomic without deadlocking:
//! - `PRINTK` protects the ring buffer (short hold time)
//! - `OUTPUT_LOCK` serializes console writes (held while formatting)
//!
//! During panic the normal path could deadlock on `OUTPUT_LOCK`; the
//! oops flag switches `PrintkWriter` to `try_lock`, falling back to
//! buffer-only output.
//!
//! Message levels follow the usual syslog numbering (0 = emergency,
//! 7 = debug). The `pr_*` macros drop messages above the current loglevel
//! before formatting; `printk!` itself is unconditional.

use ::core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::arch::IrqSpinlock;
use crate::console;

/// Messages with a level above this are suppressed by the `pr_*` macros.
pub const DEFAULT_LOGLEVEL: u8 = 6;

/// Error conditions
pub const KERN_ERR: u8 = 3;
/// Warnings
pub const KERN_WARNING: u8 = 4;
/// Informational
pub const KERN_INFO: u8 = 6;
/// Debug chatter
pub const KERN_DEBUG: u8 = 7;

/// Ring buffer size (must be a power of 2)
const PRINTK_BUFFER_SIZE: usize = 8192;

/// Byte ring buffer for kernel messages
struct RingBuffer {
    data: [u8; PRINTK_BUFFER_SIZE],
    head: usize,
    tail: usize,
    wrapped: bool,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            data: [0; PRINTK_BUFFER_SIZE],
            head: 0,
            tail: 0,
            wrapped: false,
        }
    }

    fn write_byte(&mut self, byte: u8) {
        self.data[self.head] = byte;
        self.head = (self.head + 1) & (PRINTK_BUFFER_SIZE - 1);
        if self.head == self.tail {
            // Caught up to the reader: oldest data lost.
            self.tail = (self.tail + 1) & (PRINTK_BUFFER_SIZE - 1);
            self.wrapped = true;
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /// Read and consume buffered bytes, oldest first.
    fn read_for_flush(&mut self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while self.tail != self.head && count < buf.len() {
            buf[count] = self.data[self.tail];
            self.tail = (self.tail + 1) & (PRINTK_BUFFER_SIZE - 1);
            count += 1;
        }
        count
    }

    fn available(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            PRINTK_BUFFER_SIZE - self.tail + self.head
        }
    }
}

struct PrintkState {
    buffer: RingBuffer,
    /// Set once the boot-time buffer replay has happened.
    flushed: bool,
}

static PRINTK: IrqSpinlock<PrintkState> = IrqSpinlock::new(PrintkState {
    buffer: RingBuffer::new(),
    flushed: false,
});

/// Serializes console writes so messages are not interleaved.
static OUTPUT_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

/// Panic in progress: printk switches to non-blocking locking.
static OOPS_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

static LOGLEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LOGLEVEL);

/// Enter panic mode. Never cleared; panic is a one-way trip.
pub fn set_oops_in_progress() {
    OOPS_IN_PROGRESS.store(true, Ordering::Release);
}

/// Current loglevel threshold for the `pr_*` macros.
pub fn loglevel() -> u8 {
    LOGLEVEL.load(Ordering::Relaxed)
}

/// Set the loglevel threshold (boot `loglevel=` option).
pub fn set_loglevel(level: u8) {
    LOGLEVEL.store(level, Ordering::Relaxed);
}

/// Replay buffered messages to the consoles.
///
/// Call after registering the first console. Must not allocate (runs
/// before the heap on bare metal), so it flushes through a stack chunk.
pub fn flush() {
    if !console::has_console() {
        return;
    }

    let _output = OUTPUT_LOCK.lock();
    let mut state = PRINTK.lock();

    if state.flushed {
        return;
    }

    let mut chunk = [0u8; 256];
    loop {
        let n = state.buffer.read_for_flush(&mut chunk);
        if n == 0 {
            break;
        }
        console::console_write(&chunk[..n]);
    }

    state.flushed = true;
}

/// Buffer bytes and, once flushed, mirror them to the consoles.
/// Caller holds `OUTPUT_LOCK`.
fn printk_write_locked(bytes: &[u8]) {
    let mirror = {
        let mut state = PRINTK.lock();
        state.buffer.write_bytes(bytes);
        state.flushed
    };

    if mirror && console::has_console() {
        console::console_write(bytes);
    }
}

/// `fmt::Write` sink holding the output lock for a whole message.
pub struct PrintkWriter {
    /// `None` when panic mode could not take the lock; output then goes
    /// to the ring buffer only.
    _guard: Option<crate::arch::IrqSpinlockGuard<'static, ()>>,
}

impl PrintkWriter {
    pub fn new() -> Self {
        if OOPS_IN_PROGRESS.load(Ordering::Acquire) {
            Self {
                _guard: OUTPUT_LOCK.try_lock(),
            }
        } else {
            Self {
                _guard: Some(OUTPUT_LOCK.lock()),
            }
        }
    }
}

impl Default for PrintkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for PrintkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self._guard.is_some() {
            printk_write_locked(s.as_bytes());
        } else {
            let mut state = PRINTK.lock();
            state.buffer.write_bytes(s.as_bytes());
        }
        Ok(())
    }
}

/// Bytes currently buffered and whether data has been lost to wrap.
pub fn stats() -> (usize, bool) {
    let state = PRINTK.lock();
    (state.buffer.available(), state.buffer.wrapped)
}

/// Drain up to `buf.len()` buffered bytes (dmesg-style access).
pub fn drain(buf: &mut [u8]) -> usize {
    PRINTK.lock().buffer.read_for_flush(buf)
}

/// Reset printk state (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    let mut state = PRINTK.lock();
    state.buffer = RingBuffer::new();
    state.flushed = false;
    LOGLEVEL.store(DEFAULT_LOGLEVEL, Ordering::Relaxed);
}

/// Print to the kernel log.
///
/// The output lock is held for the entire format operation, so messages
/// with multiple arguments come out atomically.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::printk::PrintkWriter::new();
        let _ = write!(writer, $($arg)*);
    }};
}

/// Print to the kernel log with a trailing newline.
#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk!("\n")
    };
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::printk::PrintkWriter::new();
        let _ = write!(writer, $($arg)*);
        let _ = writer.write_str("\n");
    }};
}

/// Log at [`KERN_ERR`], subject to the loglevel threshold.
#[macro_export]
macro_rules! pr_err {
    ($($arg:tt)*) => {
        if $crate::printk::KERN_ERR <= $crate::printk::loglevel() {
            $crate::printkln!($($arg)*);
        }
    };
}

/// Log at [`KERN_WARNING`], subject to the loglevel threshold.
#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)*) => {
        if $crate::printk::KERN_WARNING <= $crate::printk::loglevel() {
            $crate::printkln!($($arg)*);
        }
    };
}

/// Log at [`KERN_INFO`], subject to the loglevel threshold.
#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)*) => {
        if $crate::printk::KERN_INFO <= $crate::printk::loglevel() {
            $crate::printkln!($($arg)*);
        }
    };
}

/// Log at [`KERN_DEBUG`], subject to the loglevel threshold.
#[macro_export]
macro_rules! pr_debug {
    ($($arg:tt)*) => {
        if $crate::printk::KERN_DEBUG <= $crate::printk::loglevel() {
            $crate::printkln!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel_test;

    #[test]
    fn buffer_retains_messages_before_console() {
        kernel_test(|| {
            printkln!("hello {}", 42);
            let (avail, wrapped) = stats();
            assert!(avail >= "hello 42\n".len());
            assert!(!wrapped);

            let mut buf = [0u8; 64];
            let n = drain(&mut buf);
            let text = core::str::from_utf8(&buf[..n]).unwrap();
            assert!(text.contains("hello 42"));
        });
    }

    #[test]
    fn loglevel_gates_pr_macros() {
        kernel_test(|| {
            set_loglevel(KERN_WARNING);
            pr_debug!("quiet");
            pr_err!("loud");

            let mut buf = [0u8; 128];
            let n = drain(&mut buf);
            let text = core::str::from_utf8(&buf[..n]).unwrap();
            assert!(!text.contains("quiet"));
            assert!(text.contains("loud"));
        });
    }
}
