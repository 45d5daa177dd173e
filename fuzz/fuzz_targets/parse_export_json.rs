#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = covtrace_domain::parse_export_json(s);
        let _ = covtrace_domain::is_no_coverage_data(s);
    }
});
