#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(clause) = std::str::from_utf8(data) {
        let _ = sq_filter::CompiledFilter::parse(clause);
    }
});
