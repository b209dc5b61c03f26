#![no_main]

use backfill_core::progress::StabilityDetector;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&k, counts)) = data.split_first() else {
        return;
    };
    let k = usize::from(k % 8);
    let mut detector = StabilityDetector::new(k);
    let required = detector.required();
    let mut history: Vec<u64> = Vec::with_capacity(counts.len());

    for &byte in counts {
        let count = u64::from(byte % 4);
        history.push(count);
        let stable = detector.observe(count);

        let expected = history.len() >= required && {
            let tail = &history[history.len() - required..];
            tail[0] != 0 && tail.iter().all(|&c| c == tail[0])
        };
        assert_eq!(stable, expected, "history={history:?} k={required}");
    }
});
