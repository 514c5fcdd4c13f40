use crate::ParamValue;

/// Ordered query parameters.
///
/// Entries set to `None` are kept for bookkeeping but never sent and never
/// take part in cache fingerprints.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Option<ParamValue>)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds parameters from name/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParamValue>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(name, value)| (name.into(), Some(value.into())))
                .collect(),
        }
    }

    /// Appends a parameter, replacing an earlier one with the same name.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name.into(), Some(value.into()));
        self
    }

    /// Like [`Params::set`], but `None` values are dropped on send.
    pub fn set_opt<V: Into<ParamValue>>(mut self, name: impl Into<String>, value: Option<V>) -> Self {
        self.insert(name.into(), value.map(Into::into));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        let index = self.entries.iter().position(|(key, _)| key == name)?;
        self.entries.remove(index).1
    }

    /// Number of parameters that will actually be sent.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, value)| value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parameters to put on the wire, in insertion order, `None` dropped.
    pub fn sanitized(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|value| (name.clone(), value.to_string())))
            .collect()
    }

    /// Sanitized parameters sorted by name, for fingerprinting.
    pub fn canonical(&self) -> Vec<(String, String)> {
        let mut pairs = self.sanitized();
        pairs.sort();
        pairs
    }

    /// Merges `other` on top of `self`; `other` wins on name clashes.
    pub fn merge(mut self, other: Params) -> Self {
        for (name, value) in other.entries {
            self.insert(name, value);
        }
        self
    }

    fn insert(&mut self, name: String, value: Option<ParamValue>) {
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl From<Vec<(String, ParamValue)>> for Params {
    fn from(values: Vec<(String, ParamValue)>) -> Self {
        Self::from_pairs(values)
    }
}

impl<const N: usize> From<[(&str, ParamValue); N]> for Params {
    fn from(values: [(&str, ParamValue); N]) -> Self {
        Self::from_pairs(values)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ParamValue, Params};

    #[test]
    fn none_values_are_dropped_on_send() {
        let params = Params::new()
            .set("q", "muse")
            .set_opt::<i64>("offset", None)
            .set("limit", 10);
        assert_eq!(
            params.sanitized(),
            vec![
                ("q".to_owned(), "muse".to_owned()),
                ("limit".to_owned(), "10".to_owned()),
            ]
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn canonical_ignores_insertion_order() {
        let a = Params::new().set("limit", 50).set("offset", 100).set("market", "US");
        let b = Params::new().set("market", "US").set("offset", 100).set("limit", 50);
        assert_ne!(a.sanitized(), b.sanitized());
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn set_replaces_existing_name() {
        let params = Params::from([("offset", ParamValue::integer(0))]).set("offset", 50);
        assert_eq!(params.get("offset"), Some(&ParamValue::Integer(50)));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn merge_prefers_right_hand_side() {
        let base = Params::new().set("market", "US").set("limit", 20);
        let merged = base.merge(Params::new().set("limit", 50));
        assert_eq!(merged.get("limit"), Some(&ParamValue::Integer(50)));
        assert_eq!(merged.get("market"), Some(&ParamValue::text("US")));
    }

    #[test]
    fn remove_returns_value() {
        let mut params = Params::new().set("limit", 20);
        assert_eq!(params.remove("limit"), Some(ParamValue::Integer(20)));
        assert!(params.is_empty());
        assert_eq!(params.remove("limit"), None);
    }
}
