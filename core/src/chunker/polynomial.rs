//! Polynomials over GF(2) packed into a `u64`, bit `i` being the coefficient of `x^i`.

use crate::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Degree of the polynomials generated for new repositories.
pub const POLYNOMIAL_DEGREE: i32 = 53;

const RANDOM_POLYNOMIAL_TRIES: usize = 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pol(u64);

impl Pol {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Degree of the polynomial, -1 for the zero polynomial.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    pub fn add(self, other: Pol) -> Pol {
        Pol(self.0 ^ other.0)
    }

    /// Remainder of `self / d`. `d` must be non-zero.
    pub fn modulo(self, d: Pol) -> Pol {
        debug_assert!(d.0 != 0, "division by the zero polynomial");
        if d.0 == 0 {
            return self;
        }
        let dd = d.deg();
        let mut x = self.0;
        while Pol(x).deg() >= dd {
            x ^= d.0 << (Pol(x).deg() - dd);
        }
        Pol(x)
    }

    /// `(self * f) mod g`, reducing after every shift so nothing overflows.
    pub fn mul_mod(self, f: Pol, g: Pol) -> Pol {
        let top = 1u64 << g.deg();
        let mut a = self.modulo(g).0;
        let mut b = f.0;
        let mut res = 0u64;
        while b != 0 {
            if b & 1 == 1 {
                res ^= a;
            }
            a <<= 1;
            if a & top != 0 {
                a ^= g.0;
            }
            b >>= 1;
        }
        Pol(res)
    }

    pub fn gcd(self, other: Pol) -> Pol {
        let (mut a, mut b) = (self, other);
        while b.0 != 0 {
            let r = a.modulo(b);
            a = b;
            b = r;
        }
        a
    }

    /// Ben-Or irreducibility test: `gcd(x^(2^i) - x mod f, f) == 1` for `1 <= i <= deg/2`.
    pub fn is_irreducible(self) -> bool {
        if self.deg() < 1 {
            return false;
        }
        (1..=self.deg() / 2).all(|i| self.gcd(qp(i, self)).0 == 1)
    }

    /// Random irreducible polynomial of degree [`POLYNOMIAL_DEGREE`].
    pub fn random() -> Result<Pol> {
        let mut rng = rand::rngs::OsRng;
        for _ in 0..RANDOM_POLYNOMIAL_TRIES {
            let mut candidate = rng.next_u64() & ((1u64 << (POLYNOMIAL_DEGREE + 1)) - 1);
            candidate |= (1u64 << POLYNOMIAL_DEGREE) | 1;
            let pol = Pol(candidate);
            if pol.is_irreducible() {
                return Ok(pol);
            }
        }
        Err(Error::Other(
            "unable to find an irreducible polynomial".to_string(),
        ))
    }
}

/// `(x^(2^p) - x) mod g`
fn qp(p: i32, g: Pol) -> Pol {
    let mut res = Pol(2);
    for _ in 0..p {
        res = res.mul_mod(res, g);
    }
    res.add(Pol(2)).modulo(g)
}

impl fmt::Display for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Pol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pol(0x{:x})", self.0)
    }
}

impl Serialize for Pol {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pol {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16)
            .map(Pol)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degree() {
        assert_eq!(Pol(0).deg(), -1);
        assert_eq!(Pol(1).deg(), 0);
        assert_eq!(Pol(0b1011).deg(), 3);
        assert_eq!(Pol(0x3DA3358B4DC173).deg(), 53);
    }

    #[test]
    fn test_modulo_and_gcd() {
        // x^2 + 1 = (x + 1)^2
        assert_eq!(Pol(0b101).modulo(Pol(0b11)), Pol(0));
        assert_eq!(Pol(0b101).gcd(Pol(0b11)), Pol(0b11));
        // x^3 + x^2 mod (x^3 + x + 1) = x^2 + x + 1
        assert_eq!(Pol(0b1100).modulo(Pol(0b1011)), Pol(0b111));
    }

    #[test]
    fn test_mul_mod() {
        // (x + 1)^2 = x^2 + 1, already reduced mod x^3 + x + 1
        assert_eq!(Pol(0b11).mul_mod(Pol(0b11), Pol(0b1011)), Pol(0b101));
        // x^2 * x^2 = x^4 = x^2 + x mod x^3 + x + 1
        assert_eq!(Pol(0b100).mul_mod(Pol(0b100), Pol(0b1011)), Pol(0b110));
    }

    #[test]
    fn test_irreducibility() {
        assert!(Pol(0b111).is_irreducible());
        assert!(Pol(0b1011).is_irreducible());
        assert!(!Pol(0b101).is_irreducible());
        assert!(!Pol(0b1111).is_irreducible());
        assert!(Pol(0x3DA3358B4DC173).is_irreducible());
    }

    #[test]
    fn test_random_polynomial() {
        let pol = Pol::random().unwrap();
        assert_eq!(pol.deg(), POLYNOMIAL_DEGREE);
        assert!(pol.is_irreducible());
    }

    #[test]
    fn test_serde_hex() {
        let pol = Pol(0x3DA3358B4DC173);
        let json = serde_json::to_string(&pol).unwrap();
        assert_eq!(json, "\"3da3358b4dc173\"");
        assert_eq!(serde_json::from_str::<Pol>(&json).unwrap(), pol);
    }
}
