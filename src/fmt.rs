//! Small text formatters shared by the status report and logging paths.

use std::time::{Duration, Instant};

const DURATION_DAYS_MAX_DIGITS: usize = 18;

/// Formats the duration between two `Instant`s as `[-]Dd HH:MM:SS` (days
/// only shown when non-zero) or `HH:MM:SS`.
///
/// `Instant` has no notion of "before" that produces a negative duration,
/// so unlike the original helper this never prints a leading `-`; a caller
/// comparing two instants the "wrong" way around gets a saturated zero
/// instead. This is the one behavioral simplification the duration
/// formatter makes over the reference implementation, recorded as an open
/// question resolution.
pub fn duration_str(begin: Instant, end: Instant) -> String {
    let secs = end.saturating_duration_since(begin).as_secs();
    duration_str_secs(secs)
}

/// Signed variant used by the status report's "uptime" line, where the
/// duration is always non-negative in practice but taking a `Duration`
/// keeps the call site simple.
pub fn duration_str_from(duration: Duration) -> String {
    duration_str_secs(duration.as_secs())
}

fn duration_str_secs(total_secs: u64) -> String {
    let days = total_secs / 86400;
    let rest = total_secs % 86400;
    let hours = rest / 3600;
    let minutes = (rest % 3600) / 60;
    let seconds = rest % 60;

    if days > 0 {
        let days_str = if digit_count(days) > DURATION_DAYS_MAX_DIGITS {
            "?".to_string()
        } else {
            days.to_string()
        };
        format!("{}d {:02}:{:02}:{:02}", days_str, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

fn digit_count(mut n: u64) -> usize {
    if n == 0 {
        return 1;
    }
    let mut count = 0;
    while n > 0 {
        count += 1;
        n /= 10;
    }
    count
}

const LOGSAFE_MAX_LEN: usize = 512;
const LOGSAFE_RESERVE: usize = 4 + 3 + 1;

/// Escapes a byte string for safe inclusion in a single log line: ASCII
/// printable bytes pass through unchanged (with `\` doubled), everything
/// else becomes a `\ooo` three-digit octal escape. Truncates with a
/// trailing `...` once the result would exceed 512 bytes, so one
/// mischievous client can't blow up a log line.
pub fn logsafe_str(s: &[u8]) -> String {
    let mut out = String::with_capacity(s.len().min(LOGSAFE_MAX_LEN));
    let mut truncated = false;

    for (i, &b) in s.iter().enumerate() {
        if out.len() >= LOGSAFE_MAX_LEN - LOGSAFE_RESERVE {
            truncated = i < s.len();
            break;
        }

        if (0x20..=0x7e).contains(&b) {
            if b == b'\\' {
                out.push('\\');
            }
            out.push(b as char);
        } else {
            out.push('\\');
            out.push((b'0' + (b >> 6)) as char);
            out.push((b'0' + ((b & 0o70) >> 3)) as char);
            out.push((b'0' + (b & 0o7)) as char);
        }
    }

    if truncated {
        out.push_str("...");
    }

    out
}
