//! Kernel command line parsing
//!
//! Parses space-separated `key=value` boot options and applies them to
//! kernel subsystems. Unknown options are logged and ignored.
//!
//! ## Supported options
//!
//! - `loglevel=<0..=7>` - printk threshold for the `pr_*` macros
//! - `tick_ms=<n>` - periodic timer interval handed to the platform

use spin::Mutex;

use crate::pr_warn;

/// Parsed boot options applied at init time.
struct BootOptions {
    tick_ms: u64,
}

/// Default periodic tick interval (matches the platform timer driver).
pub const DEFAULT_TICK_MS: u64 = 10;

static OPTIONS: Mutex<BootOptions> = Mutex::new(BootOptions {
    tick_ms: DEFAULT_TICK_MS,
});

/// Parse the kernel command line and apply recognized options.
pub fn parse(cmdline: &str) {
    for opt in cmdline.split_whitespace() {
        let Some((key, value)) = opt.split_once('=') else {
            pr_warn!("cmdline: ignoring malformed option '{}'", opt);
            continue;
        };
        match key {
            "loglevel" => match value.parse::<u8>() {
                Ok(level) if level <= 7 => crate::printk::set_loglevel(level),
                _ => pr_warn!("cmdline: bad loglevel '{}'", value),
            },
            "tick_ms" => match value.parse::<u64>() {
                Ok(ms) if ms > 0 => OPTIONS.lock().tick_ms = ms,
                _ => pr_warn!("cmdline: bad tick_ms '{}'", value),
            },
            _ => pr_warn!("cmdline: unknown option '{}'", key),
        }
    }
}

/// Tick interval to register the platform periodic timer with.
pub fn tick_ms() -> u64 {
    OPTIONS.lock().tick_ms
}

/// Restore defaults (hosted test support only).
#[cfg(not(target_os = "none"))]
pub(crate) fn reset() {
    OPTIONS.lock().tick_ms = DEFAULT_TICK_MS;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel_test;

    #[test]
    fn parses_known_options() {
        kernel_test(|| {
            parse("loglevel=4 tick_ms=25");
            assert_eq!(crate::printk::loglevel(), 4);
            assert_eq!(tick_ms(), 25);
        });
    }

    #[test]
    fn rejects_bad_values() {
        kernel_test(|| {
            parse("loglevel=99 tick_ms=0 bogus noise=1");
            assert_eq!(crate::printk::loglevel(), crate::printk::DEFAULT_LOGLEVEL);
            assert_eq!(tick_ms(), DEFAULT_TICK_MS);

            let mut buf = [0u8; 512];
            let n = crate::printk::drain(&mut buf);
            let text = core::str::from_utf8(&buf[..n]).unwrap();
            assert!(text.contains("bad loglevel"));
            assert!(text.contains("unknown option"));
        });
    }
}
