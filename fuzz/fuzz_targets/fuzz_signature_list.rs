//! Fuzz target for EFI signature list decoding
//!
//! Signature lists are read back from the key directory and checked against
//! the certificates before enrollment. The decoder must reject malformed
//! input without panicking.
//!
//! Security concerns:
//! - Header sizes that make the list or entry size underflow
//! - Entry counts that do not divide the list body
//! - Allocation driven by untrusted length fields

#![no_main]

use libfuzzer_sys::fuzz_target;

use sbkit::esl;

fuzz_target!(|data: &[u8]| {
    let Ok(lists) = esl::parse(data) else {
        return;
    };

    // Lists without entries decode but cannot be encoded; the rest must
    // encode back to the same bytes
    let encoded: Result<Vec<Vec<u8>>, _> = lists.iter().map(|l| l.to_bytes()).collect();
    if let Ok(encoded) = encoded {
        assert_eq!(encoded.concat(), data);
    }
});
