//! Directory entry representation.

use std::collections::HashMap;

/// Directory entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (values preserve the order returned by the server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    /// Creates an entry with no attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Adds values for an attribute.
    #[must_use]
    pub fn with_attribute<I, S>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(attribute.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns the first value of the attribute if present.
    ///
    /// Attribute names are compared ignoring ASCII case.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns all values for the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(attribute)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                    .map(|(_, values)| values)
            })
            .map(Vec::as_slice)
    }

    /// Returns true if `objectClass` contains `class`, ignoring ASCII case.
    #[must_use]
    pub fn has_object_class(&self, class: &str) -> bool {
        self.values("objectClass")
            .is_some_and(|classes| classes.iter().any(|c| c.eq_ignore_ascii_case(class)))
    }

    /// Finds a ranged form of `attribute` (`attribute;range=low-high`).
    ///
    /// Returns the upper bound as written by the server (a number or `*`) together with the
    /// values of that range.
    #[must_use]
    pub fn ranged_values(&self, attribute: &str) -> Option<(&str, &[String])> {
        self.attributes.iter().find_map(|(name, values)| {
            let (base, options) = name.split_once(';')?;
            if !base.eq_ignore_ascii_case(attribute) {
                return None;
            }
            let range = options
                .split(';')
                .find_map(|option| option.strip_prefix("range="))?;
            let (_, high) = range.split_once('-')?;
            Some((high, values.as_slice()))
        })
    }
}
