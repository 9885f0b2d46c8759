//! Identifier generation: agent ids and monotonic message ids.

use std::sync::Mutex;

use ulid::{Generator, Ulid};

/// Process-wide monotonic ULID source.
///
/// Ids sort lexicographically in generation order, so inbox filenames double
/// as a delivery timeline. Two processes generating in the same millisecond
/// still produce distinct ids (80 bits of randomness).
pub struct UlidGen {
    inner: Mutex<Generator>,
}

impl Default for UlidGen {
    fn default() -> Self {
        Self::new()
    }
}

impl UlidGen {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    pub fn next(&self) -> String {
        let mut generator = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match generator.generate() {
            Ok(ulid) => ulid.to_string(),
            // Random-component overflow within one millisecond; a fresh ulid
            // keeps ids unique at the cost of monotonicity for this one id.
            Err(_) => Ulid::new().to_string(),
        }
    }
}

/// Millisecond timestamp embedded in a ULID string, if it parses.
pub fn ulid_timestamp_ms(id: &str) -> Option<u64> {
    Ulid::from_string(id).ok().map(|u| u.timestamp_ms())
}

/// `aleph-<8-hex>` agent id, used when the operator does not pick one.
pub fn generate_agent_id() -> String {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_ok() {
        let mut out = String::with_capacity(14);
        out.push_str("aleph-");
        for b in buf {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{b:02x}");
        }
        return out;
    }
    // Entropy source unavailable; fall back to the ULID low bits.
    let ulid = Ulid::new().to_string().to_lowercase();
    format!("aleph-{}", &ulid[ulid.len() - 8..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulids_are_monotonic_and_unique() {
        let ids = UlidGen::new();
        let mut prev = ids.next();
        for _ in 0..1000 {
            let next = ids.next();
            assert!(next > prev, "{next} should sort after {prev}");
            prev = next;
        }
    }

    #[test]
    fn ulid_is_26_chars() {
        assert_eq!(UlidGen::new().next().len(), 26);
    }

    #[test]
    fn ulid_timestamp_round_trips() {
        let id = UlidGen::new().next();
        let ts = ulid_timestamp_ms(&id).unwrap();
        assert!(ts > 0);
        assert!(ulid_timestamp_ms("not-a-ulid").is_none());
    }

    #[test]
    fn agent_ids_have_expected_shape() {
        let id = generate_agent_id();
        assert!(id.starts_with("aleph-"));
        assert_eq!(id.len(), "aleph-".len() + 8);
        assert_ne!(generate_agent_id(), generate_agent_id());
    }
}
