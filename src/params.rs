//! Parameter blocks and per-type-pair tables.
//!
//! Force components are configured from string key/value blocks. Required
//! keys fail with a typed error; optional keys fall back to a default and log
//! a warning.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{MeshError, Result};

/// A block of string parameters, as read from a configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    values: BTreeMap<String, String>,
}

impl ParamMap {
    /// Create an empty parameter block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, returning the block for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Set `key` to `value`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Parse a required parameter.
    pub fn required<T: FromStr>(&self, key: &str, context: &'static str) -> Result<T> {
        let raw = self.get(key).ok_or_else(|| MeshError::MissingParameter {
            name: key.to_string(),
            context,
        })?;
        parse(key, raw)
    }

    /// Parse an optional parameter, falling back to `default` with a warning.
    pub fn optional<T: FromStr + Display>(&self, key: &str, default: T, context: &'static str) -> Result<T> {
        match self.get(key) {
            Some(raw) => parse(key, raw),
            None => {
                log::warn!("{}: parameter `{}` not set, using default {}", context, key, default);
                Ok(default)
            }
        }
    }

    /// Interpret a parameter as a boolean flag. Absent keys are `false`.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.get(key).map(|s| s.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(s) => match s.as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(MeshError::invalid_param(key, &s, "not a boolean")),
            },
        }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for ParamMap {
    fn from_iter<It: IntoIterator<Item = (K, V)>>(iter: It) -> Self {
        let mut map = ParamMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| MeshError::invalid_param(key, raw, "cannot be parsed"))
}

/// Dense symmetric table indexed by a pair of particle types.
///
/// Types are 1-based, as in simulation input files.
#[derive(Debug, Clone, PartialEq)]
pub struct PairTable<T> {
    ntypes: usize,
    values: Vec<T>,
}

impl<T: Clone> PairTable<T> {
    /// Create an `ntypes × ntypes` table filled with `value`.
    pub fn new(ntypes: usize, value: T) -> Self {
        Self {
            ntypes,
            values: vec![value; ntypes * ntypes],
        }
    }

    /// Number of particle types.
    #[inline]
    pub fn ntypes(&self) -> usize {
        self.ntypes
    }

    /// Value for the pair `(a, b)`.
    pub fn get(&self, a: u32, b: u32) -> Result<&T> {
        let k = self.slot(a, b)?;
        Ok(&self.values[k])
    }

    /// Set the value for both `(a, b)` and `(b, a)`.
    pub fn set(&mut self, a: u32, b: u32, value: T) -> Result<()> {
        let ab = self.slot(a, b)?;
        let ba = self.slot(b, a)?;
        self.values[ab] = value.clone();
        self.values[ba] = value;
        Ok(())
    }

    fn slot(&self, a: u32, b: u32) -> Result<usize> {
        Ok(self.zero_based(a)? * self.ntypes + self.zero_based(b)?)
    }

    fn zero_based(&self, kind: u32) -> Result<usize> {
        let k = kind as usize;
        if k == 0 || k > self.ntypes {
            return Err(MeshError::TypeOutOfRange {
                kind,
                ntypes: self.ntypes,
            });
        }
        Ok(k - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_and_optional() {
        let params = ParamMap::new().with("kappa", 2.5).with("gamma", "abc");

        assert_eq!(params.required::<f64>("kappa", "test").unwrap(), 2.5);
        assert_eq!(
            params.required::<f64>("lambda", "test"),
            Err(MeshError::MissingParameter {
                name: "lambda".to_string(),
                context: "test"
            })
        );
        assert!(matches!(
            params.required::<f64>("gamma", "test"),
            Err(MeshError::InvalidParameter { .. })
        ));
        assert_eq!(params.optional("lambda", 0.5, "test").unwrap(), 0.5);
        assert_eq!(params.optional("kappa", 0.5, "test").unwrap(), 2.5);
    }

    #[test]
    fn test_flags() {
        let params: ParamMap = [("a", "Yes"), ("b", "0"), ("c", "maybe")].into_iter().collect();
        assert!(params.flag("a").unwrap());
        assert!(!params.flag("b").unwrap());
        assert!(!params.flag("missing").unwrap());
        assert!(params.flag("c").is_err());
    }

    #[test]
    fn test_pair_table_is_symmetric() {
        let mut table = PairTable::new(3, 0.0);
        table.set(1, 3, 0.7).unwrap();
        assert_eq!(*table.get(3, 1).unwrap(), 0.7);
        assert_eq!(*table.get(1, 3).unwrap(), 0.7);
        assert_eq!(*table.get(2, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_pair_table_bounds() {
        let mut table = PairTable::new(2, 1u8);
        assert_eq!(
            table.get(0, 1),
            Err(MeshError::TypeOutOfRange { kind: 0, ntypes: 2 })
        );
        assert_eq!(
            table.set(1, 3, 5),
            Err(MeshError::TypeOutOfRange { kind: 3, ntypes: 2 })
        );
    }
}
