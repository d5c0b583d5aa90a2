//! Case-insensitive, multi-valued, order-preserving header container.
//!
//! Keys compare case-insensitively but keep their original spelling and
//! multiplicity. `get` returns the most recently added value, matching the
//! lookup contract of the request/response handle.

/// Mutable header multimap backing a request or a parsed response.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value without touching existing values for the key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replaces every value for the key with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries
            .retain(|(name, _)| !name.eq_ignore_ascii_case(&key));
        self.entries.push((key, value.into()));
    }

    /// Most recently added value for the key, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove_all(&mut self, key: &str) {
        self.entries
            .retain(|(name, _)| !name.eq_ignore_ascii_case(key));
    }

    /// All values for the key in insertion order.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable grouped view. `status_line` becomes the synthetic entry with
    /// no key, mirroring how the platform exposed the raw status line.
    pub fn snapshot(&self, status_line: Option<String>) -> HeaderSnapshot {
        let mut fields: Vec<(Option<String>, Vec<String>)> = Vec::new();
        if let Some(line) = status_line {
            fields.push((None, vec![line]));
        }
        for (name, value) in &self.entries {
            let existing = fields.iter_mut().find(|(key, _)| {
                key.as_deref()
                    .is_some_and(|key| key.eq_ignore_ascii_case(name))
            });
            match existing {
                Some((_, values)) => values.push(value.clone()),
                None => fields.push((Some(name.clone()), vec![value.clone()])),
            }
        }
        HeaderSnapshot { fields }
    }
}

/// Immutable view of a header set, grouped by original-case key in order of
/// first appearance. Views never expose mutation.
#[derive(Clone, Debug)]
pub struct HeaderSnapshot {
    fields: Vec<(Option<String>, Vec<String>)>,
}

impl HeaderSnapshot {
    /// Last value for the key, compared case-insensitively. `None` as the
    /// key addresses the synthetic status-line entry.
    pub fn get(&self, key: Option<&str>) -> Option<&str> {
        let (_, values) = self.fields.iter().find(|(name, _)| match (name, key) {
            (None, None) => true,
            (Some(name), Some(key)) => name.eq_ignore_ascii_case(key),
            _ => false,
        })?;
        values.last().map(String::as_str)
    }

    /// Every value recorded for the key, in insertion order.
    pub fn get_all(&self, key: Option<&str>) -> &[String] {
        self.fields
            .iter()
            .find(|(name, _)| match (name, key) {
                (None, None) => true,
                (Some(name), Some(key)) => name.eq_ignore_ascii_case(key),
                _ => false,
            })
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn fields(&self) -> &[(Option<String>, Vec<String>)] {
        &self.fields
    }
}
