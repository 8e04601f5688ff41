// Monotonic timestamp helpers for end-to-end latency sampling.
//
// The benchmark payload convention is an 8-byte native-endian nanosecond
// stamp followed by arbitrary bytes. Publisher and subscriber must share a
// clock domain for the delta to mean anything; `Instant` is process-local,
// so the stamp is read straight from CLOCK_MONOTONIC.
use std::time::Duration;

/// Length of the embedded stamp in bytes.
pub const STAMP_LEN: usize = std::mem::size_of::<u64>();

/// Nanoseconds on the monotonic clock, comparable across processes on the
/// same host.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for clock_gettime.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Prefix `body` with the current monotonic stamp.
pub fn stamp_payload(body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(STAMP_LEN + body.len());
    payload.extend_from_slice(&now_ns().to_ne_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Read the leading stamp from a payload, if it is long enough to carry one.
pub fn read_stamp(payload: &[u8]) -> Option<u64> {
    let head = payload.get(..STAMP_LEN)?;
    Some(u64::from_ne_bytes(head.try_into().ok()?))
}

/// Time elapsed since `stamp_ns`, or `None` when the clock reads earlier
/// than the stamp (a foreign clock domain).
pub fn elapsed_since(stamp_ns: u64) -> Option<Duration> {
    now_ns().checked_sub(stamp_ns).map(Duration::from_nanos)
}
