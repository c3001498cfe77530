//! Property-based tests for conversation ids and request decoding.
//!
//! Uses proptest to verify:
//! 1. `deterministic_id` is symmetric for any pair of identity ids.
//! 2. `parse_participants` inverts `deterministic_id` and returns the sorted pair.
//! 3. Membership holds for exactly the two participants.
//! 4. Arbitrary strings never make `parse_participants` or `decode_request` panic.

use chatline_proto::codec;
use chatline_relay::conversation::{deterministic_id, parse_participants, user_belongs};
use proptest::prelude::*;

/// Strategy for identity ids: hyphen-free, like generated `user_<hex>` ids.
fn arb_identity_id() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_]{1,24}"
}

proptest! {
    #[test]
    fn deterministic_id_is_symmetric(a in arb_identity_id(), b in arb_identity_id()) {
        prop_assert_eq!(deterministic_id(&a, &b), deterministic_id(&b, &a));
    }

    #[test]
    fn parse_inverts_deterministic_id(a in arb_identity_id(), b in arb_identity_id()) {
        let id = deterministic_id(&a, &b);
        let (lower, upper) = if a <= b {
            (a.as_str(), b.as_str())
        } else {
            (b.as_str(), a.as_str())
        };
        prop_assert_eq!(parse_participants(&id), Some((lower, upper)));
    }

    #[test]
    fn membership_is_exactly_the_pair(
        a in arb_identity_id(),
        b in arb_identity_id(),
        other in arb_identity_id(),
    ) {
        let id = deterministic_id(&a, &b);
        prop_assert!(user_belongs(&id, &a));
        prop_assert!(user_belongs(&id, &b));
        prop_assert_eq!(user_belongs(&id, &other), other == a || other == b);
    }

    #[test]
    fn parse_never_panics(s in ".*") {
        if let Some((lower, upper)) = parse_participants(&s) {
            prop_assert!(!lower.is_empty());
            prop_assert!(lower <= upper);
            prop_assert_eq!(deterministic_id(lower, upper), s);
        }
    }

    #[test]
    fn decode_request_never_panics(s in ".*") {
        let _ = codec::decode_request(&s);
    }
}
