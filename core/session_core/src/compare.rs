//! Host comparator
//!
//! Decides which of two peers should host. Rules in priority order:
//!
//! 1. Bandwidth override: an upload at least 10x the other side's wins
//!    outright (only when both sides measured something)
//! 2. Lower NAT tier
//! 3. Higher upload
//! 4. Lower RTT to the discovery service
//! 5. Full tie: the initiator hosts
//!
//! Both peers run this with the arguments swapped and must agree.

use std::cmp::Ordering;

use crate::nat::{compute_tier, NatQuality};

/// Upload ratio at which bandwidth overrides the NAT tier
pub const BANDWIDTH_OVERRIDE_RATIO: u64 = 10;

/// Rank two snapshots by rules 1-4; `Less` means `a` should host
///
/// Returns `Equal` on a full tie so callers can apply their own tiebreak.
pub fn compare_qualities(a: &NatQuality, b: &NatQuality) -> Ordering {
    let a_up = a.upload_kbps as u64;
    let b_up = b.upload_kbps as u64;

    if a_up > 0 && b_up > 0 {
        if a_up >= b_up * BANDWIDTH_OVERRIDE_RATIO {
            return Ordering::Less;
        }
        if b_up >= a_up * BANDWIDTH_OVERRIDE_RATIO {
            return Ordering::Greater;
        }
    }

    compute_tier(a)
        .cmp(&compute_tier(b))
        .then_with(|| b_up.cmp(&a_up))
        .then_with(|| a.rtt_to_discovery_ms.cmp(&b.rtt_to_discovery_ms))
}

/// Decide between us and the peer; `Less` means we host
pub fn compare(ours: &NatQuality, theirs: &NatQuality, we_are_initiator: bool) -> Ordering {
    match compare_qualities(ours, theirs) {
        Ordering::Equal if we_are_initiator => Ordering::Less,
        Ordering::Equal => Ordering::Greater,
        decided => decided,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::NatType;

    fn quality(tier: u8, upload: u32, rtt: u16) -> NatQuality {
        let mut q = NatQuality {
            upload_kbps: upload,
            rtt_to_discovery_ms: rtt,
            detection_complete: true,
            ..Default::default()
        };
        match tier {
            0 => q.lan_reachable = true,
            1 => q.has_public_ip = true,
            2 => q.upnp_available = true,
            3 => q.nat_type = NatType::Restricted,
            _ => q.nat_type = NatType::Symmetric,
        }
        q
    }

    #[test]
    fn test_lower_tier_wins() {
        let public = quality(1, 5_000, 50);
        let symmetric = quality(4, 5_000, 50);
        assert_eq!(compare(&public, &symmetric, false), Ordering::Less);
        assert_eq!(compare(&symmetric, &public, true), Ordering::Greater);
    }

    #[test]
    fn test_bandwidth_override_beats_tier() {
        let fat_pipe = quality(4, 100_000, 50);
        let public = quality(1, 10_000, 50);
        assert_eq!(compare(&fat_pipe, &public, false), Ordering::Less);
    }

    #[test]
    fn test_bandwidth_override_needs_both_measured() {
        let unmeasured = quality(1, 0, 50);
        let measured = quality(4, 50_000, 50);
        assert_eq!(compare(&unmeasured, &measured, false), Ordering::Less);
    }

    #[test]
    fn test_just_under_override_ratio_uses_tier() {
        let a = quality(4, 99_999, 50);
        let b = quality(1, 10_000, 50);
        assert_eq!(compare(&a, &b, true), Ordering::Greater);
    }

    #[test]
    fn test_upload_then_rtt_tiebreak() {
        let fast = quality(2, 20_000, 80);
        let slow = quality(2, 10_000, 10);
        assert_eq!(compare_qualities(&fast, &slow), Ordering::Less);

        let near = quality(2, 10_000, 10);
        let far = quality(2, 10_000, 90);
        assert_eq!(compare_qualities(&near, &far), Ordering::Less);
    }

    #[test]
    fn test_full_tie_initiator_hosts() {
        let a = quality(3, 10_000, 50);
        let b = a.clone();
        assert_eq!(compare_qualities(&a, &b), Ordering::Equal);
        assert_eq!(compare(&a, &b, true), Ordering::Less);
        assert_eq!(compare(&b, &a, false), Ordering::Greater);
    }

    #[test]
    fn test_symmetry_exhaustive_grid() {
        let uploads = [0u32, 1, 9, 10, 100, 10_000, 99_999, 100_000];
        let rtts = [0u16, 50, 51];
        let mut grid = Vec::new();
        for tier in 0..=4 {
            for &up in &uploads {
                for &rtt in &rtts {
                    grid.push(quality(tier, up, rtt));
                }
            }
        }

        for a in &grid {
            for b in &grid {
                for initiator in [true, false] {
                    let ours = compare(a, b, initiator);
                    let theirs = compare(b, a, !initiator);
                    assert_ne!(ours, Ordering::Equal);
                    // Exactly one side decides to host
                    assert_eq!(ours, theirs.reverse(), "a={:?} b={:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_tier_monotonicity() {
        // With equal bandwidth and latency, improving the tier never loses
        for better in 0..=4u8 {
            for worse in better..=4u8 {
                let a = quality(better, 10_000, 50);
                let b = quality(worse, 10_000, 50);
                assert_ne!(compare_qualities(&a, &b), Ordering::Greater);
            }
        }
    }
}
