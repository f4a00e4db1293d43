//! Fixed UDP payload shared read-only by every worker of a run.

use bytes::Bytes;

/// Ethernet (14) + IPv4 (20) + UDP (8) header bytes not carried in the payload.
pub const HEADER_OVERHEAD: usize = 42;

/// Smallest payload ever generated, regardless of the nominal packet size.
pub const MIN_PAYLOAD: usize = 64;

/// Generate the payload for a nominal on-wire `packet_size`.
pub fn generate(packet_size: u32) -> Bytes {
    generate_with_pattern(packet_size, &default_pattern())
}

/// Day-stamped marker so captures on the destination can be attributed.
pub fn default_pattern() -> String {
    format!("xdpbench-src-{}-", chrono::Utc::now().format("%Y%m%d"))
}

/// Fill a payload of `max(64, packet_size - 42)` bytes with `pattern`,
/// repeated and truncated.
pub fn generate_with_pattern(packet_size: u32, pattern: &str) -> Bytes {
    let len = (packet_size as usize)
        .saturating_sub(HEADER_OVERHEAD)
        .max(MIN_PAYLOAD);
    let pattern = if pattern.is_empty() { "x" } else { pattern };
    let payload: Vec<u8> = pattern.bytes().cycle().take(len).collect();
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_subtracts_header_overhead() {
        let payload = generate_with_pattern(1500, "abc");
        assert_eq!(payload.len(), 1458);
        assert_eq!(&payload[..6], b"abcabc");
    }

    #[test]
    fn test_small_packets_get_minimum_payload() {
        assert_eq!(generate_with_pattern(1, "abc").len(), MIN_PAYLOAD);
        assert_eq!(generate_with_pattern(64, "abc").len(), MIN_PAYLOAD);
        assert_eq!(generate_with_pattern(106, "abc").len(), MIN_PAYLOAD);
        assert_eq!(generate_with_pattern(107, "abc").len(), 65);
    }

    #[test]
    fn test_default_pattern_is_day_stamped() {
        let payload = generate(128);
        assert!(payload.starts_with(b"xdpbench-src-"));
    }
}
