//! Distinguished name parsing for directory entries.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use nss_ldap_core::Error as CoreError;

/// Errors that can occur when parsing distinguished names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistinguishedNameError {
    /// The distinguished name was empty.
    #[error("distinguished name cannot be empty")]
    Empty,
    /// A component in the distinguished name was invalid.
    #[error("invalid distinguished name component: {0}")]
    InvalidComponent(String),
    /// A component was missing the attribute name to the left of the `=`.
    #[error("distinguished name component missing attribute: {0}")]
    MissingAttribute(String),
    /// The distinguished name ended with an escape character or a short hex pair.
    #[error("distinguished name contains an unterminated escape sequence")]
    UnterminatedEscape,
}

impl From<DistinguishedNameError> for CoreError {
    fn from(err: DistinguishedNameError) -> Self {
        CoreError::NotFound(err.to_string())
    }
}

/// One `attribute=value` assertion of an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValueAssertion {
    attribute: String,
    value: String,
}

impl AttributeValueAssertion {
    /// Attribute type (e.g. `uid`).
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Unescaped value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if the attribute type matches, ignoring ASCII case.
    #[must_use]
    pub fn matches_attribute(&self, attribute: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(attribute)
    }
}

/// Parsed distinguished name.
///
/// Each RDN may be multi-valued (`cn=svc+ipServiceProtocol=tcp`), so RDNs are kept as
/// groups of assertions in the order they appear, most specific first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    rdns: Vec<Vec<AttributeValueAssertion>>,
}

impl DistinguishedName {
    /// Parses a distinguished name.
    ///
    /// Both `\,` style and `\2c` style escapes are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DistinguishedNameError`] if the name is empty or malformed.
    pub fn parse(input: impl AsRef<str>) -> std::result::Result<Self, DistinguishedNameError> {
        let raw = input.as_ref().trim();
        if raw.is_empty() {
            return Err(DistinguishedNameError::Empty);
        }

        let mut rdns = Vec::new();
        for component in split_unescaped(raw, ',') {
            let mut assertions = Vec::new();
            for part in split_unescaped(component, '+') {
                assertions.push(parse_assertion(part)?);
            }
            rdns.push(assertions);
        }

        Ok(Self { rdns })
    }

    /// Returns the RDNs in order, most specific first.
    #[must_use]
    pub fn rdns(&self) -> &[Vec<AttributeValueAssertion>] {
        &self.rdns
    }

    /// Returns the assertions of the leading RDN.
    #[must_use]
    pub fn leading_rdn(&self) -> &[AttributeValueAssertion] {
        self.rdns.first().map_or(&[], Vec::as_slice)
    }

    /// Value of `attribute` within the leading RDN only.
    #[must_use]
    pub fn leading_value(&self, attribute: &str) -> Option<&str> {
        self.leading_rdn()
            .iter()
            .find(|ava| ava.matches_attribute(attribute))
            .map(AttributeValueAssertion::value)
    }

    /// Value of the first assertion anywhere in the name that matches `attribute`.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.rdns
            .iter()
            .flatten()
            .find(|ava| ava.matches_attribute(attribute))
            .map(AttributeValueAssertion::value)
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, rdn) in self.rdns.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            for (position, ava) in rdn.iter().enumerate() {
                if position > 0 {
                    f.write_str("+")?;
                }
                write!(f, "{}={}", ava.attribute, escape(&ava.value))?;
            }
        }
        Ok(())
    }
}

impl FromStr for DistinguishedName {
    type Err = DistinguishedNameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Strips an optional `#'...'B` unique identifier suffix from a member DN.
#[must_use]
pub fn strip_optional_uid(member: &str) -> &str {
    let bytes = member.as_bytes();
    let mut escaped = false;
    for (index, byte) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'#' if index > 0 && bytes[index - 1] != b'=' => return member[..index].trim_end(),
            _ => {}
        }
    }
    member
}

/// Splits on `delimiter` where it is not escaped, trimming each part.
fn split_unescaped(input: &str, delimiter: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;

    for (index, ch) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == delimiter {
            parts.push(input[start..index].trim());
            start = index + ch.len_utf8();
        }
    }
    parts.push(input[start..].trim());
    parts
}

fn parse_assertion(part: &str) -> std::result::Result<AttributeValueAssertion, DistinguishedNameError> {
    if part.is_empty() {
        return Err(DistinguishedNameError::InvalidComponent(part.to_string()));
    }

    let (attribute, value) = part
        .split_once('=')
        .ok_or_else(|| DistinguishedNameError::InvalidComponent(part.to_string()))?;
    let attribute = attribute.trim();
    if attribute.is_empty() {
        return Err(DistinguishedNameError::MissingAttribute(part.to_string()));
    }

    Ok(AttributeValueAssertion {
        attribute: attribute.to_string(),
        value: unescape(value.trim())?,
    })
}

fn unescape(value: &str) -> std::result::Result<String, DistinguishedNameError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] != b'\\' {
            out.push(bytes[index]);
            index += 1;
            continue;
        }

        let next = *bytes
            .get(index + 1)
            .ok_or(DistinguishedNameError::UnterminatedEscape)?;
        if next.is_ascii_hexdigit() {
            let pair = value
                .get(index + 1..index + 3)
                .ok_or(DistinguishedNameError::UnterminatedEscape)?;
            let decoded = u8::from_str_radix(pair, 16)
                .map_err(|_| DistinguishedNameError::UnterminatedEscape)?;
            out.push(decoded);
            index += 3;
        } else {
            out.push(next);
            index += 2;
        }
    }

    String::from_utf8(out).map_err(|err| DistinguishedNameError::InvalidComponent(err.to_string()))
}

fn escape(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut escaped = String::with_capacity(value.len());

    for (index, ch) in value.chars().enumerate() {
        let needs_escape = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (index == 0 && (ch == ' ' || ch == '#'))
            || (index == last && ch == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(ch);
    }

    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_dn() {
        let dn = DistinguishedName::parse("uid=jdoe,ou=People,dc=example,dc=com").unwrap();
        assert_eq!(dn.leading_value("uid"), Some("jdoe"));
        assert_eq!(dn.leading_value("ou"), None);
        assert_eq!(dn.get("ou"), Some("People"));
        assert_eq!(dn.rdns().len(), 4);
        assert_eq!(dn.to_string(), "uid=jdoe,ou=People,dc=example,dc=com");
    }

    #[test]
    fn parse_escapes() {
        let dn = DistinguishedName::parse("cn=Smith\\, John,dc=example").unwrap();
        assert_eq!(dn.leading_value("cn"), Some("Smith, John"));

        let dn = DistinguishedName::parse("cn=a\\2cb,dc=example").unwrap();
        assert_eq!(dn.leading_value("CN"), Some("a,b"));
        assert_eq!(dn.to_string(), "cn=a\\,b,dc=example");
    }

    #[test]
    fn parse_multi_valued_rdn() {
        let dn =
            DistinguishedName::parse("cn=ssh+ipServiceProtocol=tcp,ou=Services,dc=example")
                .unwrap();
        assert_eq!(dn.leading_rdn().len(), 2);
        assert_eq!(dn.leading_value("ipServiceProtocol"), Some("tcp"));
        assert_eq!(dn.leading_value("cn"), Some("ssh"));
    }

    #[test]
    fn invalid_names() {
        assert_eq!(
            DistinguishedName::parse("  ").unwrap_err(),
            DistinguishedNameError::Empty
        );
        assert!(matches!(
            DistinguishedName::parse("cn=John,").unwrap_err(),
            DistinguishedNameError::InvalidComponent(_)
        ));
        assert!(matches!(
            DistinguishedName::parse("=John").unwrap_err(),
            DistinguishedNameError::MissingAttribute(_)
        ));
        assert_eq!(
            DistinguishedName::parse("cn=John\\").unwrap_err(),
            DistinguishedNameError::UnterminatedEscape
        );
    }

    #[test]
    fn strip_uid_suffix() {
        assert_eq!(
            strip_optional_uid("uid=jdoe,dc=example#'0101'B"),
            "uid=jdoe,dc=example"
        );
        assert_eq!(strip_optional_uid("cn=\\#hash,dc=example"), "cn=\\#hash,dc=example");
        assert_eq!(strip_optional_uid("cn=#41,dc=example"), "cn=#41,dc=example");
        assert_eq!(strip_optional_uid("uid=plain,dc=example"), "uid=plain,dc=example");
    }
}
