//! Arbitrary text fed to the event-log reader must error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = covtrace_app::parse_event_log(s);
    }
});
