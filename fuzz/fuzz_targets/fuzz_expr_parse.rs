#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(expr) = std::str::from_utf8(data) {
        let _ = sq_expr::parse_expr(expr);
        let _ = sq_expr::parse_assignments(expr);
    }
});
