use std::collections::BTreeMap;

use crate::error::{check_finite, check_positive, BmfError, Result};

/// String-keyed hyperparameters supplied at construction.
///
/// Values that are absent fall back to the defaults of the model family.
/// Keys the family does not recognise are rejected unless the map was made
/// [`lenient`](Hyperparameters::lenient).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hyperparameters {
    values: BTreeMap<String, f64>,
    lenient: bool,
}

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) -> Option<f64> {
        self.values.insert(key.into(), value)
    }

    /// Ignore unrecognised keys instead of failing.
    pub fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub(crate) fn reader(&self) -> Reader<'_> {
        Reader {
            hyperparameters: self,
            known: Vec::new(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Hyperparameters {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            lenient: false,
        }
    }
}

/// Reads the keys of one model family and remembers which ones it knows.
pub struct Reader<'a> {
    hyperparameters: &'a Hyperparameters,
    known: Vec<&'static str>,
}

impl Reader<'_> {
    pub fn positive(&mut self, key: &'static str, default: f64) -> Result<f64> {
        self.known.push(key);
        check_positive(key, self.hyperparameters.get(key).unwrap_or(default))
    }

    pub fn real(&mut self, key: &'static str, default: f64) -> Result<f64> {
        self.known.push(key);
        check_finite(key, self.hyperparameters.get(key).unwrap_or(default))
    }

    /// `None` when `key` is unset, so the caller can derive the default.
    pub fn optional_positive(&mut self, key: &'static str) -> Result<Option<f64>> {
        self.known.push(key);
        self.hyperparameters
            .get(key)
            .map(|value| check_positive(key, value))
            .transpose()
    }

    /// Accept `key` without reading it.
    pub fn ignore(&mut self, key: &'static str) {
        self.known.push(key);
    }

    /// Fail on the first key nobody asked for.
    pub(crate) fn finish(self, expected: &'static [&'static str]) -> Result<()> {
        if self.hyperparameters.lenient {
            return Ok(());
        }
        match self
            .hyperparameters
            .values
            .keys()
            .find(|key| !self.known.contains(&key.as_str()))
        {
            Some(key) => Err(BmfError::UnknownOption {
                option: key.clone(),
                expected,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEYS: &[&str] = &["alpha", "beta"];

    #[test]
    fn defaults_and_overrides() {
        let hp = Hyperparameters::new().with("alpha", 2.);
        let mut reader = hp.reader();
        assert_eq!(reader.positive("alpha", 1.).unwrap(), 2.);
        assert_eq!(reader.positive("beta", 1.).unwrap(), 1.);
        reader.finish(KEYS).unwrap();
    }

    #[test]
    fn strict_rejects_unknown_keys() {
        let hp: Hyperparameters = [("alpha", 1.), ("gamma", 3.)].into_iter().collect();
        let mut reader = hp.reader();
        reader.positive("alpha", 1.).unwrap();
        let err = reader.finish(KEYS).unwrap_err();
        assert_eq!(
            err,
            BmfError::UnknownOption {
                option: "gamma".to_string(),
                expected: KEYS
            }
        );

        let hp = hp.lenient();
        let mut reader = hp.reader();
        reader.positive("alpha", 1.).unwrap();
        reader.finish(KEYS).unwrap();
    }

    #[test]
    fn rejects_out_of_domain_values() {
        let hp = Hyperparameters::new().with("beta", 0.).with("mu", f64::NAN);
        let mut reader = hp.reader();
        assert!(matches!(
            reader.positive("beta", 1.),
            Err(BmfError::InvalidParameter { name: "beta", .. })
        ));
        assert!(reader.real("mu", 0.).is_err());
    }

    #[test]
    fn optional_and_ignored_keys() {
        let hp = Hyperparameters::new().with("a", 2.).with("eta", 1.);
        let mut reader = hp.reader();
        assert_eq!(reader.optional_positive("a").unwrap(), Some(2.));
        assert_eq!(reader.optional_positive("b").unwrap(), None);
        reader.ignore("eta");
        reader.finish(&["a", "b", "eta"]).unwrap();

        let hp = Hyperparameters::new().with("a", -1.);
        assert!(hp.reader().optional_positive("a").is_err());
    }
}
