#![no_main]

use libfuzzer_sys::fuzz_target;

use cacheproxy::proxy::http::fuzzing::ChunkedFrameTracker;

fuzz_target!(|data: &[u8]| {
    // First byte picks a split point so framing state crosses reads.
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(rest.len());
    let (head, tail) = rest.split_at(split);

    let mut tracker = ChunkedFrameTracker::new();
    let mut consumed = 0usize;
    for piece in [head, tail] {
        match tracker.advance(piece) {
            Ok(used) => {
                assert!(used <= piece.len());
                consumed += used;
                if tracker.is_done() {
                    break;
                }
            }
            Err(_) => return,
        }
    }
    assert!(consumed <= rest.len());
    if tracker.is_done() {
        assert!(tracker.payload_bytes() <= consumed as u64);
    }
});
