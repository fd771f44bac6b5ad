//! What's a project without a util module.

use once_cell::sync::Lazy;
use rand::Rng;
use std::hash::Hasher;
use std::{env, process, time::Duration};

/// Convert Duration to milliseconds with 3 decimal places precision.
pub fn millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

/// Get a human-readable duration for amounts that
/// a human would use.
pub fn human_duration(duration: Duration) -> String {
    let second = 1000;
    let minute = second * 60;
    let hour = minute * 60;
    let day = hour * 24;
    // Ok that's enough.

    let ms = duration.as_millis();
    let ms_fmt = |ms: u128, unit: u128, name: &str| -> String {
        if ms % unit != 0 {
            format!("{}ms", ms)
        } else {
            format!("{}{}", ms / unit, name)
        }
    };

    if ms < second {
        format!("{}ms", ms)
    } else if ms < minute {
        ms_fmt(ms, second, "s")
    } else if ms < hour {
        ms_fmt(ms, minute, "m")
    } else if ms < day {
        ms_fmt(ms, hour, "h")
    } else {
        ms_fmt(ms, day, "d")
    }
}

/// Format a number with commas for readability.
/// Example: 1234567 -> "1,234,567"
pub fn number_human(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Escape PostgreSQL identifiers by doubling any embedded quotes.
pub fn escape_identifier(s: &str) -> String {
    s.replace("\"", "\"\"")
}

// Region, host and PID folded into an 8-hex-char digest on first access.
static INSTANCE_ID: Lazy<String> = Lazy::new(|| {
    if let Ok(node_id) = env::var("PGSWITCH_NODE_ID") {
        return node_id;
    }

    let region = env::var("PGSWITCH_REGION_NAME").unwrap_or_else(|_| "default".into());
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
    let pid = process::id();

    let mut hasher = fnv::FnvHasher::default();
    hasher.write(region.as_bytes());
    hasher.write(host.as_bytes());
    hasher.write(&pid.to_be_bytes());
    // Salt with randomness so two processes forked at the same PID on
    // different boots don't collide.
    hasher.write(&rand::rng().random_range(0..u64::MAX).to_be_bytes());

    format!("{:08x}", hasher.finish() as u32)
});

/// Get the node ID for this pgswitch instance.
/// Generated once at startup and persists for the lifetime of the process.
pub fn instance_id() -> &'static str {
    &INSTANCE_ID
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(human_duration(Duration::from_millis(2000)), "2s");
        assert_eq!(human_duration(Duration::from_millis(1000 * 60 * 2)), "2m");
        assert_eq!(human_duration(Duration::from_millis(1000 * 3600)), "1h");
        assert_eq!(human_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_number_human() {
        assert_eq!(number_human(0), "0");
        assert_eq!(number_human(999), "999");
        assert_eq!(number_human(1000), "1,000");
        assert_eq!(number_human(1234567), "1,234,567");
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("simple"), "simple");
        assert_eq!(escape_identifier("has\"quote"), "has\"\"quote");
    }

    #[test]
    fn test_instance_id_consistency() {
        let id1 = instance_id();
        let id2 = instance_id();
        assert_eq!(id1, id2);
        assert!(id1.len() >= 8);
    }
}
