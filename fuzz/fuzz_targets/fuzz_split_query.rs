#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(query) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(split) = sq_lexer::split_query(query) {
        for segment in &split.segments {
            let _ = segment.keyword();
        }
    }
});
