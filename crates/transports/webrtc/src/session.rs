//! Session identifiers and offerer/answerer role decision
//!
//! Every process picks one [`SessionIdentifier`] at start-up. Two peers swap
//! identifiers over signaling and each compares them locally; the larger one
//! makes the offer. No coordinator is involved, so the comparison has to give
//! the same answer on both sides.

use peermux_core::PeerAddress;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Range of the random suffix appended to the launch timestamp
const SUFFIX_RANGE: u128 = 1_000_000;

/// Per-launch token used only to break offerer/answerer symmetry
///
/// Travels as a decimal string: launch time in milliseconds followed by a
/// six digit random suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionIdentifier(u128);

impl SessionIdentifier {
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    /// Generate the identifier for this launch
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let suffix = rand::thread_rng().gen_range(0..SUFFIX_RANGE);
        Self(millis * SUFFIX_RANGE + suffix)
    }

    pub fn value(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionIdentifier {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for SessionIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdentifierVisitor;

        impl Visitor<'_> for IdentifierVisitor {
            type Value = SessionIdentifier;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal session identifier")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(SessionIdentifier(u128::from(v)))
            }
        }

        deserializer.deserialize_any(IdentifierVisitor)
    }
}

/// Which side of the negotiation this node plays for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    pub fn is_offerer(self) -> bool {
        self == Role::Offerer
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Decide the local role towards `remote`
///
/// The larger identifier offers. Equal identifiers fall back to comparing
/// overlay addresses, which are distinct for distinct peers, so both sides
/// still agree.
pub fn decide_role(
    local_id: SessionIdentifier,
    remote_id: SessionIdentifier,
    local_address: &PeerAddress,
    remote_address: &PeerAddress,
) -> Role {
    let ordering = match local_id.cmp(&remote_id) {
        Ordering::Equal => local_address.as_str().cmp(remote_address.as_str()),
        other => other,
    };

    if ordering == Ordering::Greater {
        Role::Offerer
    } else {
        Role::Answerer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn test_larger_identifier_offers() {
        let a = SessionIdentifier::new(200);
        let b = SessionIdentifier::new(100);
        let (pa, pb) = (addr("100.64.0.1"), addr("100.64.0.2"));

        assert_eq!(decide_role(a, b, &pa, &pb), Role::Offerer);
        assert_eq!(decide_role(b, a, &pb, &pa), Role::Answerer);
    }

    #[test]
    fn test_roles_are_complementary() {
        let pa = addr("100.64.0.1");
        let pb = addr("100.64.0.2");
        for (x, y) in [(1u128, 2u128), (17_000_000, 16_999_999), (u128::MAX, 0), (5, 5)] {
            let a = SessionIdentifier::new(x);
            let b = SessionIdentifier::new(y);
            let role_a = decide_role(a, b, &pa, &pb);
            let role_b = decide_role(b, a, &pb, &pa);
            assert_ne!(role_a, role_b, "ids {} / {}", x, y);
        }
    }

    #[test]
    fn test_equal_identifiers_use_address() {
        let id = SessionIdentifier::new(42);
        let low = addr("100.64.0.1");
        let high = addr("100.64.0.9");

        assert_eq!(decide_role(id, id, &high, &low), Role::Offerer);
        assert_eq!(decide_role(id, id, &low, &high), Role::Answerer);
    }

    #[test]
    fn test_identifier_wire_form() {
        let id = SessionIdentifier::new(1_718_000_000_000_123_456);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1718000000000123456\"");
        assert_eq!(serde_json::from_str::<SessionIdentifier>(&json).unwrap(), id);
        assert_eq!(
            serde_json::from_str::<SessionIdentifier>("200").unwrap(),
            SessionIdentifier::new(200)
        );
        assert!(serde_json::from_str::<SessionIdentifier>("\"12ab\"").is_err());
    }

    #[test]
    fn test_generated_identifiers_are_recent() {
        let id = SessionIdentifier::generate();
        let millis = id.value() / SUFFIX_RANGE;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        assert!(now - millis < 60_000);
    }
}
