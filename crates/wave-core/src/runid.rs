//! Run-id generation.
//!
//! A run id is `<pipeline_name>-<hex_suffix>` and shows up everywhere:
//! workspace paths, store row keys, the event stream, and logs.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a run id with `bytes` of entropy (default 4, eight hex chars).
///
/// Entropy comes from the OS RNG; if that fails, nanosecond-timestamp
/// derived bytes are used so id generation never blocks a run.
pub fn generate_run_id(pipeline_name: &str, bytes: usize) -> String {
    let bytes = bytes.max(1);
    let mut buf = vec![0u8; bytes];

    if OsRng.try_fill_bytes(&mut buf).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = ((nanos >> (8 * (i % 16))) & 0xff) as u8;
        }
    }

    let suffix: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    format!("{pipeline_name}-{suffix}")
}
