//! Console framework
//!
//! Consoles are "where kernel messages go" via printk:
//!
//! ```text
//! printk → console registry → one or more console drivers
//! ```
//!
//! Messages are always buffered in printk's ring buffer first; when a
//! console is registered with [`ConsoleFlags::PRINTBUFFER`], the buffer is
//! replayed to it. The registry uses a fixed-size array so it works before
//! the heap is up, and an `IrqSpinlock` so registration and writes are safe
//! from interrupt context.

use crate::arch::IrqSpinlock;

/// Maximum number of console drivers that can be registered
const MAX_CONSOLES: usize = 4;

/// A device that can display kernel output.
///
/// Writes must be simple and direct: no buffering, no blocking, safe to
/// call from panic context.
pub trait ConsoleDriver: Send + Sync {
    /// Console name for identification (e.g., "uart0")
    fn name(&self) -> &str;

    /// Write bytes to the console
    fn write(&self, data: &[u8]);
}

bitflags::bitflags! {
    /// Console registration flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConsoleFlags: u16 {
        /// Console is enabled and receives output
        const ENABLED = 1 << 0;
        /// Replay the printk buffer to this console on registration
        const PRINTBUFFER = 1 << 1;
    }
}

struct ConsoleRegistry {
    consoles: [Option<&'static dyn ConsoleDriver>; MAX_CONSOLES],
    count: usize,
}

static REGISTRY: IrqSpinlock<ConsoleRegistry> = IrqSpinlock::new(ConsoleRegistry {
    consoles: [None; MAX_CONSOLES],
    count: 0,
});

/// Register a console driver. Returns `false` if the registry is full.
pub fn register_console(console: &'static dyn ConsoleDriver, flags: ConsoleFlags) -> bool {
    {
        let mut registry = REGISTRY.lock();
        if registry.count == MAX_CONSOLES {
            return false;
        }
        let slot = registry.count;
        registry.consoles[slot] = Some(console);
        registry.count += 1;
    }

    if flags.contains(ConsoleFlags::PRINTBUFFER) {
        crate::printk::flush();
    }
    true
}

/// Unregister a console driver by name. Returns whether it was found.
pub fn unregister_console(name: &str) -> bool {
    let mut registry = REGISTRY.lock();
    for i in 0..registry.count {
        if let Some(console) = registry.consoles[i]
            && console.name() == name
        {
            // Compact the array over the removed slot.
            for j in i..registry.count - 1 {
                registry.consoles[j] = registry.consoles[j + 1];
            }
            let last = registry.count - 1;
            registry.consoles[last] = None;
            registry.count -= 1;
            return true;
        }
    }
    false
}

/// Whether at least one console is registered.
pub fn has_console() -> bool {
    REGISTRY.lock().count > 0
}

/// Write bytes to every registered console.
pub fn console_write(data: &[u8]) {
    let registry = REGISTRY.lock();
    for i in 0..registry.count {
        if let Some(console) = registry.consoles[i] {
            console.write(data);
        }
    }
}

/// Clear the registry (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    let mut registry = REGISTRY.lock();
    registry.consoles = [None; MAX_CONSOLES];
    registry.count = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel_test;
    use spin::Mutex;

    struct Captured {
        bytes: Mutex<Vec<u8>>,
    }

    impl ConsoleDriver for Captured {
        fn name(&self) -> &str {
            "capture0"
        }

        fn write(&self, data: &[u8]) {
            self.bytes.lock().extend_from_slice(data);
        }
    }

    static CAPTURE: Captured = Captured {
        bytes: Mutex::new(Vec::new()),
    };

    fn captured_text() -> String {
        String::from_utf8(CAPTURE.bytes.lock().clone()).unwrap()
    }

    #[test]
    fn printbuffer_replays_early_messages() {
        kernel_test(|| {
            CAPTURE.bytes.lock().clear();
            printkln!("early boot line");
            assert!(!has_console());

            assert!(register_console(
                &CAPTURE,
                ConsoleFlags::ENABLED | ConsoleFlags::PRINTBUFFER
            ));
            assert!(captured_text().contains("early boot line"));

            // Post-flush messages go straight through.
            printkln!("live line");
            assert!(captured_text().contains("live line"));

            assert!(unregister_console("capture0"));
            assert!(!has_console());
        });
    }
}
