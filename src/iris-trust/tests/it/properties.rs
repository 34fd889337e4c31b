//! Property-based tests for evidence parsing and hashing.
//!
//! Probe output is attacker-influenced text, so every parser must reject
//! garbage without panicking, and every digest must commit to its inputs.

use std::collections::BTreeMap;

use proptest::prelude::*;

use iris_trust::security::anti_tamper::find_suspicious;
use iris_trust::security::parsers::{
    parse_defender, parse_device_guard, parse_disk_encryption, parse_dma_policy, parse_flag, parse_secure_boot,
    parse_tpm, parse_tpm_wmi,
};
use iris_trust::security::posture::{raw_output_hash, verification_token};
use iris_trust::security::{attestation_hash, ParsedPosture, PostureSignal};

/// Strategy for a posture signal.
fn signal() -> impl Strategy<Value = PostureSignal> {
    prop::sample::select(PostureSignal::ALL.to_vec())
}

/// Strategy for a raw-output map.
fn raw_outputs() -> impl Strategy<Value = BTreeMap<PostureSignal, String>> {
    prop::collection::btree_map(signal(), ".{0,64}", 0..9)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    // ========================================================================
    // Parsers
    // ========================================================================

    /// No parser panics on arbitrary text.
    #[test]
    fn parsers_total(raw in ".{0,256}", s in signal()) {
        let _ = parse_tpm(&raw);
        let _ = parse_tpm_wmi(&raw);
        let _ = parse_secure_boot(&raw);
        let _ = parse_device_guard(&raw);
        let _ = parse_flag(s, &raw);
        let _ = parse_defender(&raw);
        let _ = parse_dma_policy(&raw);
        let _ = parse_disk_encryption(&raw);
        let _ = ParsedPosture::from_raw(&BTreeMap::from([(s, raw.clone())]));
    }

    /// Secure Boot is on only for a DWORD of exactly 1.
    #[test]
    fn secure_boot_only_for_one(value in any::<u32>()) {
        let raw = format!("    UEFISecureBootEnabled    REG_DWORD    0x{value:x}");
        prop_assert_eq!(parse_secure_boot(&raw).unwrap(), value == 1);
    }

    /// DMA remapping is enforced only for policies 1 and 2.
    #[test]
    fn dma_policy_values(value in any::<u32>()) {
        let raw = format!("    DmaRemappingPolicy    REG_DWORD    0x{value:x}");
        prop_assert_eq!(parse_dma_policy(&raw).unwrap(), value == 1 || value == 2);
    }

    /// Disk encryption follows ProtectionStatus, for scalars and arrays alike.
    #[test]
    fn disk_encryption_status(status in 0i64..4, as_array in any::<bool>()) {
        let volume = format!(r#"{{"DriveLetter":"C:","ProtectionStatus":{status}}}"#);
        let raw = if as_array { format!("[{volume}]") } else { volume };
        prop_assert_eq!(parse_disk_encryption(&raw).unwrap(), status == 1);
    }

    // ========================================================================
    // Digests
    // ========================================================================

    /// Raw-output digests are 16 lowercase hex characters.
    #[test]
    fn raw_hash_shape(raw in ".{0,512}") {
        let hash = raw_output_hash(&raw);
        prop_assert_eq!(hash.len(), 16);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// The verification token binds the timestamp.
    #[test]
    fn verification_token_binds_timestamp(outputs in raw_outputs(), a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        prop_assert_ne!(verification_token(&outputs, a), verification_token(&outputs, b));
    }

    /// The attestation hash commits to the integrity hash.
    #[test]
    fn attestation_hash_binds_integrity(a in "[0-9a-f]{64}", b in "[0-9a-f]{64}", ts in any::<i64>(), pid in any::<u32>()) {
        prop_assume!(a != b);
        let parsed = ParsedPosture::default();
        let hashes = BTreeMap::new();
        prop_assert_ne!(
            attestation_hash(ts, &parsed, &hashes, &a, pid),
            attestation_hash(ts, &parsed, &hashes, &b, pid)
        );
    }

    // ========================================================================
    // Process scan
    // ========================================================================

    /// Lowercase names without any tool as a prefix never match.
    #[test]
    fn unrelated_processes_not_flagged(names in prop::collection::vec("zz[a-z]{1,12}", 0..20)) {
        let listing = names.iter().map(|n| format!("\"{n}.exe\",\"1234\"")).collect::<Vec<_>>().join("\n");
        prop_assert!(find_suspicious(&listing).is_empty());
    }
}
