use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};

/// Identifies a call by the function's identity and its arguments.
///
/// Arguments are fed to the hasher through their [`Hash`] implementation, so
/// values that compare equal produce equal fingerprints. Containers without a
/// deterministic order (`HashMap`, `HashSet`) do not implement `Hash` and are
/// rejected at compile time; use their `BTree` counterparts instead.
///
/// Fingerprints are stable across processes running the same build, so grid
/// jobs and cluster engines address the same cache entries as the environment
/// that recorded the calls.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Produce the fingerprint of a call to `function` with `args`.
    pub fn of<T: Hash + ?Sized>(function: &str, args: &T) -> Self {
        let mut state = SipHasher13::new();
        // Length-prefixed as a `u64`, independent of the platform's `usize`.
        state.write(&(function.len() as u64).to_le_bytes());
        state.write(function.as_bytes());
        args.hash(&mut state);
        Self(state.finish128().as_u128())
    }

    /// The raw 128-bit value.
    #[inline]
    pub fn as_u128(self) -> u128 {
        self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseFingerprintError(s.into()));
        }
        u128::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseFingerprintError(s.into()))
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ParseFingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A string that is not 32 hexadecimal digits.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid fingerprint: {0:?}")]
pub struct ParseFingerprintError(String);
