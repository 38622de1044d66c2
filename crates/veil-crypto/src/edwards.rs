//! Twisted Edwards curve arithmetic for the embedded (BabyJubjub) group.
//!
//! Curve equation: `a*x^2 + y^2 = 1 + d*x^2*y^2` over the BN254 scalar
//! field, parameters from gnark-crypto. Point compression follows the
//! gnark convention: Y little-endian with the X "lexicographically largest"
//! flag in the top bit of byte 31.

use ark_bn254::Fr;
use ark_ff::{BigInteger, BigInteger256, Field, PrimeField};
use veil_types::{Error, Result};

/// An affine point on the embedded curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: Fr,
    pub y: Fr,
}

/// Subgroup order.
/// l = 2736030358979909402780800718157159386076813972158567259200215660948447373041
pub fn subgroup_order() -> BigInteger256 {
    BigInteger256::new(u256_from_decimal(
        "2736030358979909402780800718157159386076813972158567259200215660948447373041",
    ))
}

/// Curve parameter a = -1.
fn curve_a() -> Fr {
    -Fr::from(1u64)
}

/// Curve parameter d.
fn curve_d() -> Fr {
    Fr::from_bigint(BigInteger256::new(u256_from_decimal(
        "12181644023421730124874158521699555681764249180949974110617291017600649128846",
    )))
    .unwrap()
}

/// Convert a decimal string to [u64; 4] limbs (little-endian).
fn u256_from_decimal(s: &str) -> [u64; 4] {
    let mut value = [0u8; 32];
    let mut digits: Vec<u8> = s.bytes().map(|b| b - b'0').collect();
    let mut byte_idx = 0;
    while !digits.is_empty() && byte_idx < 32 {
        let mut remainder = 0u32;
        let mut new_digits = Vec::new();
        for &d in &digits {
            remainder = remainder * 10 + d as u32;
            if !new_digits.is_empty() || remainder >= 256 {
                new_digits.push((remainder / 256) as u8);
                remainder %= 256;
            }
        }
        value[byte_idx] = remainder as u8;
        byte_idx += 1;
        digits = new_digits;
    }
    [
        u64::from_le_bytes(value[0..8].try_into().unwrap()),
        u64::from_le_bytes(value[8..16].try_into().unwrap()),
        u64::from_le_bytes(value[16..24].try_into().unwrap()),
        u64::from_le_bytes(value[24..32].try_into().unwrap()),
    ]
}

impl Point {
    /// Group identity (0, 1).
    pub fn identity() -> Self {
        Self {
            x: Fr::from(0u64),
            y: Fr::from(1u64),
        }
    }

    /// Fixed generator (from gnark-crypto).
    pub fn generator() -> Self {
        let x = Fr::from_bigint(BigInteger256::new(u256_from_decimal(
            "9671717474070082183213120605117400219616337014328744928644933853176787189663",
        )))
        .unwrap();
        let y = Fr::from_bigint(BigInteger256::new(u256_from_decimal(
            "16950150798460657717958625567821834550301663161624707787222815936182638968203",
        )))
        .unwrap();
        Self { x, y }
    }

    pub fn is_identity(&self) -> bool {
        self.x == Fr::from(0u64) && self.y == Fr::from(1u64)
    }

    /// Check `a*x^2 + y^2 = 1 + d*x^2*y^2`.
    pub fn is_on_curve(&self) -> bool {
        let a = curve_a();
        let d = curve_d();
        let x2 = self.x * self.x;
        let y2 = self.y * self.y;
        a * x2 + y2 == Fr::from(1u64) + d * x2 * y2
    }

    /// Edwards addition.
    pub fn add(&self, other: &Point) -> Point {
        if self.is_identity() {
            return *other;
        }
        if other.is_identity() {
            return *self;
        }

        let a = curve_a();
        let d = curve_d();
        let one = Fr::from(1u64);

        let beta = self.x * other.y;
        let gamma = self.y * other.x;
        let delta = (self.y - a * self.x) * (other.x + other.y);
        let tau = beta * gamma;
        let dtau = d * tau;

        let x3 = (beta + gamma) * (one + dtau).inverse().unwrap();
        let y3 = (delta + a * beta - gamma) * (one - dtau).inverse().unwrap();

        Point { x: x3, y: y3 }
    }

    /// Double-and-add scalar multiplication.
    pub fn mul(&self, scalar: &Fr) -> Point {
        if *scalar == Fr::from(0u64) {
            return Point::identity();
        }

        let bits = scalar.into_bigint();
        let mut result = Point::identity();
        let mut current = *self;

        for i in 0..256 {
            if bits.get_bit(i) {
                result = result.add(&current);
            }
            current = current.add(&current);
        }

        result
    }

    /// Compress to 32 bytes: Y little-endian, X sign in the MSB of byte 31.
    pub fn compress(&self) -> Result<[u8; 32]> {
        if !self.is_on_curve() {
            return Err(Error::crypto("point not on curve"));
        }

        let mut compressed = bigint_to_le_bytes(&self.y.into_bigint());

        if is_lexicographically_largest(&self.x) {
            compressed[31] |= 0x80;
        } else {
            compressed[31] &= 0x7F;
        }

        Ok(compressed)
    }

    /// Decompress a 32-byte encoding.
    pub fn decompress(compressed: &[u8; 32]) -> Result<Point> {
        let x_is_largest = (compressed[31] & 0x80) != 0;

        let mut y_bytes = *compressed;
        y_bytes[31] &= 0x7F;
        let y = Fr::from_le_bytes_mod_order(&y_bytes);

        let x = recover_x(&y, x_is_largest)?;
        let point = Point { x, y };

        if !point.is_on_curve() {
            return Err(Error::crypto("invalid compressed point"));
        }

        Ok(point)
    }
}

/// Generator multiplication.
pub fn mul_generator(scalar: &Fr) -> Point {
    Point::generator().mul(scalar)
}

/// Gnark-crypto sign convention: x is "lexicographically largest" when its
/// little-endian bytes compare above those of -x, from the high byte down.
fn is_lexicographically_largest(x: &Fr) -> bool {
    let neg_x = -*x;
    let x_bytes = bigint_to_le_bytes(&x.into_bigint());
    let neg_x_bytes = bigint_to_le_bytes(&neg_x.into_bigint());

    for i in (0..32).rev() {
        if x_bytes[i] > neg_x_bytes[i] {
            return true;
        }
        if x_bytes[i] < neg_x_bytes[i] {
            return false;
        }
    }
    false
}

/// From the curve equation: `x^2 = (1 - y^2) / (a - d*y^2)`.
fn recover_x(y: &Fr, x_is_largest: bool) -> Result<Fr> {
    let a = curve_a();
    let d = curve_d();
    let one = Fr::from(1u64);

    let y2 = *y * *y;
    let numerator = one - y2;
    let denominator = a - d * y2;

    let denom_inv = denominator
        .inverse()
        .ok_or_else(|| Error::crypto("no modular square root exists"))?;
    let x2 = numerator * denom_inv;

    let x = x2
        .sqrt()
        .ok_or_else(|| Error::crypto("no modular square root exists"))?;

    if is_lexicographically_largest(&x) == x_is_largest {
        Ok(x)
    } else {
        Ok(-x)
    }
}

fn bigint_to_le_bytes(bi: &BigInteger256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (i, limb) in bi.0.iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_on_curve() {
        assert!(Point::generator().is_on_curve());
        assert!(Point::identity().is_on_curve());
    }

    #[test]
    fn mul_zero_is_identity() {
        assert_eq!(mul_generator(&Fr::from(0u64)), Point::identity());
    }

    #[test]
    fn mul_one_is_generator() {
        assert_eq!(mul_generator(&Fr::from(1u64)), Point::generator());
    }

    #[test]
    fn add_identity_is_noop() {
        let g = Point::generator();
        assert_eq!(Point::identity().add(&g), g);
        assert_eq!(g.add(&Point::identity()), g);
    }

    #[test]
    fn scalar_arithmetic_is_consistent() {
        let p5 = mul_generator(&Fr::from(5u64));
        let p7 = mul_generator(&Fr::from(7u64));
        let p12 = mul_generator(&Fr::from(12u64));
        assert_eq!(p5.add(&p7), p12);
    }

    #[test]
    fn compress_decompress_roundtrip() {
        for s in [2u64, 42, 1000, 123456789] {
            let p = mul_generator(&Fr::from(s));
            let compressed = p.compress().unwrap();
            let back = Point::decompress(&compressed).unwrap();
            assert_eq!(p, back);
        }
    }

    #[test]
    fn ecdh_agreement() {
        let sk_a = Fr::from(1234567u64);
        let sk_b = Fr::from(7654321u64);
        let pk_a = mul_generator(&sk_a);
        let pk_b = mul_generator(&sk_b);
        assert_eq!(pk_b.mul(&sk_a), pk_a.mul(&sk_b));
    }
}
