use crate::{EdgesliceError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

const MILLI_PER_UNIT: i128 = 1000;
const MAX_EXPONENT: i32 = 30;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, i32); 7] = [
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// A resource quantity held as an exact count of thousandths
///
/// `"500m"` is 500, `"2"` is 2000 and `"1Ki"` is 1_024_000. Values that are
/// finer than a thousandth round up, the way the cluster does for CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParsedQuantity(i128);

impl ParsedQuantity {
    pub const ZERO: ParsedQuantity = ParsedQuantity(0);

    /// Build from a whole number of units
    pub fn from_units(units: i64) -> Self {
        Self(i128::from(units) * MILLI_PER_UNIT)
    }

    /// Build from thousandths of a unit
    pub fn from_milli(milli: i128) -> Self {
        Self(milli)
    }

    pub fn milli(&self) -> i128 {
        self.0
    }

    /// Parse a Kubernetes quantity string
    pub fn parse(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(EdgesliceError::invalid_quantity(s, "empty quantity"));
        }

        let (number, exp2, mut exp10) = split_suffix(raw)?;
        let (negative, digits) = match number.as_bytes().first() {
            Some(b'-') => (true, &number[1..]),
            Some(b'+') => (false, &number[1..]),
            _ => (false, number),
        };

        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(EdgesliceError::invalid_quantity(s, "missing number"));
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return Err(EdgesliceError::invalid_quantity(s, "not a decimal number"));
        }

        let mut mantissa: i128 = 0;
        for c in whole.chars().chain(fraction.chars()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(c as u8 - b'0')))
                .ok_or_else(|| EdgesliceError::invalid_quantity(s, "value too large"))?;
        }
        exp10 -= fraction.len() as i32;
        // Scale to thousandths
        exp10 += 3;

        let overflow = || EdgesliceError::invalid_quantity(s, "value too large");
        let mut value = mantissa
            .checked_mul(1i128 << exp2)
            .ok_or_else(overflow)?;

        if exp10 >= 0 {
            if exp10 > MAX_EXPONENT {
                return Err(overflow());
            }
            value = value.checked_mul(10i128.pow(exp10 as u32)).ok_or_else(overflow)?;
        } else {
            let shift = -exp10;
            if shift > MAX_EXPONENT + 8 {
                value = if value == 0 { 0 } else { 1 };
            } else {
                let divisor = 10i128.pow(shift as u32);
                let rounded_up = value % divisor != 0;
                value = value / divisor + i128::from(rounded_up);
            }
        }

        Ok(Self(if negative { -value } else { value }))
    }

    /// Parse a k8s-openapi quantity
    pub fn from_quantity(q: &Quantity) -> Result<Self> {
        Self::parse(&q.0)
    }

    /// Render back into a k8s-openapi quantity
    pub fn to_quantity(self) -> Quantity {
        Quantity(self.to_string())
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_mul(self, count: usize) -> Option<Self> {
        i128::try_from(count)
            .ok()
            .and_then(|c| self.0.checked_mul(c))
            .map(Self)
    }
}

/// Split a quantity into its number, binary exponent, and decimal exponent
fn split_suffix(raw: &str) -> Result<(&str, u32, i32)> {
    for (suffix, exp2) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return Ok((number, exp2, 0));
        }
    }

    // Scientific notation, e.g. "12e6" or "1E-3"
    if let Some(pos) = raw.rfind(['e', 'E']) {
        let (number, exponent) = (&raw[..pos], &raw[pos + 1..]);
        if !exponent.is_empty() && number.ends_with(|c: char| c.is_ascii_digit()) {
            let exp10 = exponent
                .parse::<i32>()
                .map_err(|_| EdgesliceError::invalid_quantity(raw, "invalid exponent"))?;
            if exp10.abs() > MAX_EXPONENT {
                return Err(EdgesliceError::invalid_quantity(raw, "exponent out of range"));
            }
            return Ok((number, 0, exp10));
        }
    }

    for (suffix, exp10) in DECIMAL_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return Ok((number, 0, exp10));
        }
    }

    if raw.ends_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(EdgesliceError::invalid_quantity(raw, "unknown suffix"));
    }
    Ok((raw, 0, 0))
}

impl FromStr for ParsedQuantity {
    type Err = EdgesliceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Add for ParsedQuantity {
    type Output = ParsedQuantity;

    fn add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl AddAssign for ParsedQuantity {
    fn add_assign(&mut self, other: Self) {
        self.0 = self.0.saturating_add(other.0);
    }
}

impl Mul<usize> for ParsedQuantity {
    type Output = ParsedQuantity;

    fn mul(self, count: usize) -> Self {
        self.checked_mul(count).unwrap_or(Self(i128::MAX))
    }
}

impl fmt::Display for ParsedQuantity {
    /// Canonical form: milli-units for fractions, the largest clean binary
    /// unit for whole values of at least 1Ki, plain integers otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MILLI_PER_UNIT != 0 {
            return write!(f, "{}m", self.0);
        }

        let units = self.0 / MILLI_PER_UNIT;
        if units != 0 {
            for (suffix, exp2) in BINARY_SUFFIXES.iter().rev() {
                let unit = 1i128 << exp2;
                if units % unit == 0 {
                    return write!(f, "{}{}", units / unit, suffix);
                }
            }
        }
        write!(f, "{}", units)
    }
}

/// Per-resource totals keyed by resource name (`cpu`, `memory`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTotals(BTreeMap<String, ParsedQuantity>);

impl ResourceTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every entry of a resource list
    pub fn from_resource_list(list: &BTreeMap<String, Quantity>) -> Result<Self> {
        let mut totals = Self::new();
        totals.add_resource_list(list)?;
        Ok(totals)
    }

    /// Add every entry of a resource list to the running totals
    pub fn add_resource_list(&mut self, list: &BTreeMap<String, Quantity>) -> Result<()> {
        for (key, quantity) in list {
            let parsed = ParsedQuantity::from_quantity(quantity)?;
            *self.0.entry(key.clone()).or_default() += parsed;
        }
        Ok(())
    }

    /// Amount recorded for `key`, zero when absent
    pub fn get(&self, key: &str) -> ParsedQuantity {
        self.0.get(key).copied().unwrap_or_default()
    }

    /// Every total multiplied by `count`
    pub fn scaled(&self, count: usize) -> Self {
        Self(self.0.iter().map(|(k, v)| (k.clone(), *v * count)).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParsedQuantity)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a k8s-openapi resource list
    pub fn to_resource_list(&self) -> BTreeMap<String, Quantity> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_quantity()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> ParsedQuantity {
        ParsedQuantity::parse(s).unwrap()
    }

    #[test]
    fn test_parse_cpu_forms() {
        assert_eq!(q("1").milli(), 1000);
        assert_eq!(q("0.5").milli(), 500);
        assert_eq!(q("100m").milli(), 100);
        assert_eq!(q("2").milli(), 2000);
        assert_eq!(q(".25").milli(), 250);
    }

    #[test]
    fn test_parse_memory_forms() {
        assert_eq!(q("1024").milli(), 1024 * 1000);
        assert_eq!(q("1Ki").milli(), 1024 * 1000);
        assert_eq!(q("128Mi").milli(), 128 * 1024 * 1024 * 1000);
        assert_eq!(q("1Gi").milli(), 1024 * 1024 * 1024 * 1000);
        assert_eq!(q("1.5Gi").milli(), 1536 * 1024 * 1024 * 1000);
        assert_eq!(q("2k").milli(), 2_000_000);
        assert_eq!(q("1M"), q("1e6"));
        assert_eq!(q("1E"), q("1e18"));
    }

    #[test]
    fn test_sub_milli_rounds_up() {
        assert_eq!(q("1e-4").milli(), 1);
        assert_eq!(q("0.0001").milli(), 1);
        assert_eq!(q("0").milli(), 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedQuantity::parse("").is_err());
        assert!(ParsedQuantity::parse("12x").is_err());
        assert!(ParsedQuantity::parse("abc").is_err());
        assert!(ParsedQuantity::parse("1.2.3").is_err());
        assert!(ParsedQuantity::parse("Gi").is_err());
    }

    #[test]
    fn test_arithmetic_and_ordering() {
        assert_eq!(q("4") * 3, q("12"));
        assert!(q("12") > q("8"));
        assert_eq!(q("500m") + q("1500m"), q("2"));
        assert!(q("1Gi") > q("1G"));
    }

    #[test]
    fn test_canonical_format() {
        assert_eq!(q("500m").to_string(), "500m");
        assert_eq!(q("2").to_string(), "2");
        assert_eq!(q("2048Mi").to_string(), "2Gi");
        assert_eq!(q("1536Mi").to_string(), "1536Mi");
        assert_eq!(q("1000").to_string(), "1000");
        assert_eq!((q("1Gi") + q("1Gi")).to_string(), "2Gi");
    }

    #[test]
    fn test_resource_totals() {
        let mut list = BTreeMap::new();
        list.insert("cpu".to_string(), Quantity("2".to_string()));
        list.insert("memory".to_string(), Quantity("4Gi".to_string()));

        let mut totals = ResourceTotals::from_resource_list(&list).unwrap();
        totals.add_resource_list(&list).unwrap();
        assert_eq!(totals.get("cpu"), q("4"));
        assert_eq!(totals.get("gpu"), ParsedQuantity::ZERO);

        let rendered = totals.to_resource_list();
        assert_eq!(rendered["memory"].0, "8Gi");
        assert_eq!(totals.scaled(3).get("cpu"), q("12"));
    }
}
