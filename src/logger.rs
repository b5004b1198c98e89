// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Forwarding of Wintun's internal diagnostics.
//!
//! Wintun reports through a single process-wide callback that carries no context pointer, so the
//! sink it forwards to is process-wide as well. It may be invoked from any thread, including
//! threads owned by the driver.

use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::dll::{WintunLoggerCallback, WintunLoggerLevel};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// A diagnostic message emitted by the Wintun driver.
#[derive(Clone, Debug)]
pub struct LogRecord<'a> {
    pub level: log::Level,
    pub timestamp: SystemTime,
    pub message: &'a str,
}

/// Receives every [`LogRecord`] emitted by Wintun.
pub type LogSink = Arc<dyn Fn(&LogRecord<'_>) + Send + Sync>;

static SINK: RwLock<Option<LogSink>> = RwLock::new(None);

/// Returns a sink that emits driver messages through the [`log`] crate with the target `wintun`.
pub fn forward_to_log() -> LogSink {
    Arc::new(|record: &LogRecord<'_>| {
        log::log!(target: "wintun", record.level, "{}", record.message);
    })
}

/// Stores `sink` as the process-wide sink, returning the callback to register with Wintun.
pub(crate) fn replace_sink(sink: Option<LogSink>) -> Option<WintunLoggerCallback> {
    let callback = sink.as_ref().map(|_| forward as WintunLoggerCallback);
    *SINK.write().unwrap_or_else(PoisonError::into_inner) = sink;
    callback
}

fn level_from_raw(level: WintunLoggerLevel) -> log::Level {
    match level {
        0 => log::Level::Info,
        1 => log::Level::Warn,
        2 => log::Level::Error,
        _ => log::Level::Debug,
    }
}

/// Converts a Windows `FILETIME` tick count into a [`SystemTime`].
pub fn filetime_to_system_time(timestamp: u64) -> SystemTime {
    let ticks_to_duration = |ticks: u64| {
        Duration::from_secs(ticks / FILETIME_TICKS_PER_SEC)
            + Duration::from_nanos((ticks % FILETIME_TICKS_PER_SEC) * 100)
    };

    if timestamp >= FILETIME_UNIX_EPOCH {
        UNIX_EPOCH + ticks_to_duration(timestamp - FILETIME_UNIX_EPOCH)
    } else {
        UNIX_EPOCH - ticks_to_duration(FILETIME_UNIX_EPOCH - timestamp)
    }
}

/// # Safety
///
/// `message` must be null or point to a null-terminated UTF-16 string.
unsafe fn decode_wide(message: *const u16) -> String {
    if message.is_null() {
        return String::new();
    }

    let mut len = 0;
    while *message.add(len) != 0 {
        len += 1;
    }

    String::from_utf16_lossy(slice::from_raw_parts(message, len))
}

/// The callback registered with `WintunSetLogger`.
pub(crate) unsafe extern "system" fn forward(
    level: WintunLoggerLevel,
    timestamp: u64,
    message: *const u16,
) {
    let sink = SINK.read().unwrap_or_else(PoisonError::into_inner).clone();
    let Some(sink) = sink else {
        return;
    };

    let message = decode_wide(message);
    let record = LogRecord {
        level: level_from_raw(level),
        timestamp: filetime_to_system_time(timestamp),
        message: &message,
    };

    // Unwinding into the driver is undefined behavior.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| sink(&record)));
}

/// Serializes tests that touch the process-wide sink.
#[cfg(test)]
pub(crate) static SINK_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    #[test]
    fn filetime_conversion() {
        assert_eq!(filetime_to_system_time(FILETIME_UNIX_EPOCH), UNIX_EPOCH);
        assert_eq!(
            filetime_to_system_time(FILETIME_UNIX_EPOCH + 15_000_000),
            UNIX_EPOCH + Duration::from_millis(1500)
        );
        assert_eq!(
            filetime_to_system_time(FILETIME_UNIX_EPOCH - FILETIME_TICKS_PER_SEC),
            UNIX_EPOCH - Duration::from_secs(1)
        );
    }

    #[test]
    fn levels() {
        assert_eq!(level_from_raw(0), log::Level::Info);
        assert_eq!(level_from_raw(1), log::Level::Warn);
        assert_eq!(level_from_raw(2), log::Level::Error);
        assert_eq!(level_from_raw(7), log::Level::Debug);
    }

    #[test]
    fn forwards_to_sink() {
        let _guard = SINK_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let callback = replace_sink(Some(Arc::new(move |record: &LogRecord<'_>| {
            sink_seen.lock().unwrap().push((
                record.level,
                record.timestamp,
                record.message.to_string(),
            ));
        })));
        assert!(callback.is_some());

        let msg = wide("Creating adapter");
        unsafe { forward(1, FILETIME_UNIX_EPOCH, msg.as_ptr()) };
        unsafe { forward(0, FILETIME_UNIX_EPOCH, std::ptr::null()) };

        assert!(replace_sink(None).is_none());
        unsafe { forward(2, FILETIME_UNIX_EPOCH, msg.as_ptr()) };

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            (log::Level::Warn, UNIX_EPOCH, String::from("Creating adapter"))
        );
        assert_eq!(seen[1].2, "");
    }

    #[test]
    fn sink_panic_is_contained() {
        let _guard = SINK_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        replace_sink(Some(Arc::new(|_: &LogRecord<'_>| panic!("sink failure"))));
        let msg = wide("boom");
        unsafe { forward(2, FILETIME_UNIX_EPOCH, msg.as_ptr()) };
        replace_sink(None);
    }
}
