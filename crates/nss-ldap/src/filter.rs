//! Search filter construction.
//!
//! Filters are built from `printf`-style templates: `%s` takes the next string argument
//! (escaped), `%d` the next number and `%%` a literal percent sign.

use crate::Result;
use nss_ldap_core::Error;

/// Arguments substituted into a filter template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueryArgs {
    /// No arguments; the template is used as is (enumeration)
    #[default]
    None,
    /// One string
    String(String),
    /// One number
    Number(i64),
    /// Two strings
    StringAndString(String, String),
    /// A number then a string
    NumberAndString(i64, String),
    /// A netgroup triple; absent fields match anything
    Triple {
        /// Host field
        host: Option<String>,
        /// User field
        user: Option<String>,
        /// Domain field
        domain: Option<String>,
    },
    /// Each value rendered through the template, ORed together
    StringListOr(Vec<String>),
    /// Each value rendered through the template, ANDed together
    StringListAnd(Vec<String>),
}

impl QueryArgs {
    /// Single string argument.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// First string argument, used as the lookup key of single-record lookups.
    #[must_use]
    pub fn first_string(&self) -> Option<&str> {
        match self {
            Self::String(value)
            | Self::StringAndString(value, _)
            | Self::NumberAndString(_, value) => Some(value),
            Self::StringListOr(values) | Self::StringListAnd(values) => {
                values.first().map(String::as_str)
            }
            Self::Triple { host, user, .. } => host.as_deref().or(user.as_deref()),
            Self::None | Self::Number(_) => None,
        }
    }
}

enum Arg<'a> {
    Escaped(String),
    Raw(&'a str),
    Number(i64),
}

/// Escapes the characters that change filter semantics.
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn substitute(template: &str, args: &[Arg<'_>]) -> Result<String> {
    let mut rendered = String::with_capacity(template.len() + 32);
    let mut args = args.iter();
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            rendered.push(ch);
            continue;
        }

        let conversion = chars.next();
        if conversion == Some('%') {
            rendered.push('%');
            continue;
        }

        match (conversion, args.next()) {
            (Some('s'), Some(Arg::Escaped(value))) => rendered.push_str(value),
            (Some('s'), Some(Arg::Raw(value))) => rendered.push_str(value),
            (Some('d'), Some(Arg::Number(value))) => rendered.push_str(&value.to_string()),
            (Some(spec), _) => {
                return Err(Error::InvalidRequest(format!(
                    "filter template `{template}` has unmatched conversion %{spec}"
                )))
            }
            (None, _) => {
                return Err(Error::InvalidRequest(format!(
                    "filter template `{template}` ends with %"
                )))
            }
        }
    }

    Ok(rendered)
}

/// Renders `template` with `args`.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the template's conversions do not match the arguments.
pub fn render_filter(template: &str, args: &QueryArgs) -> Result<String> {
    match args {
        QueryArgs::None => substitute(template, &[]),
        QueryArgs::String(value) => substitute(template, &[Arg::Escaped(escape_filter_value(value))]),
        QueryArgs::Number(number) => substitute(template, &[Arg::Number(*number)]),
        QueryArgs::StringAndString(first, second) => substitute(
            template,
            &[
                Arg::Escaped(escape_filter_value(first)),
                Arg::Escaped(escape_filter_value(second)),
            ],
        ),
        QueryArgs::NumberAndString(number, value) => substitute(
            template,
            &[Arg::Number(*number), Arg::Escaped(escape_filter_value(value))],
        ),
        QueryArgs::Triple { host, user, domain } => {
            let field = |value: &Option<String>| {
                value
                    .as_deref()
                    .map_or(Arg::Raw("*"), |value| Arg::Escaped(escape_filter_value(value)))
            };
            substitute(template, &[field(host), field(user), field(domain)])
        }
        QueryArgs::StringListOr(values) => aggregate('|', template, values),
        QueryArgs::StringListAnd(values) => aggregate('&', template, values),
    }
}

fn aggregate(operator: char, template: &str, values: &[String]) -> Result<String> {
    let mut rendered = String::from("(");
    rendered.push(operator);
    for value in values {
        rendered.push_str(&substitute(
            template,
            &[Arg::Escaped(escape_filter_value(value))],
        )?);
    }
    rendered.push(')');
    Ok(rendered)
}

/// Renders `template` and intersects it with a search descriptor's filter.
///
/// A rendered filter loses one trailing `)` and gains `(<descriptor>))`. Without arguments
/// the template is wrapped as `(&<template>(<descriptor>))`.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the template cannot be rendered.
pub fn build_filter(
    template: &str,
    args: &QueryArgs,
    descriptor_filter: Option<&str>,
) -> Result<String> {
    let rendered = render_filter(template, args)?;
    let Some(extra) = descriptor_filter.filter(|extra| !extra.is_empty()) else {
        return Ok(rendered);
    };
    let extra = extra
        .strip_prefix('(')
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(extra);

    if matches!(args, QueryArgs::None) {
        return Ok(format!("(&{rendered}({extra}))"));
    }

    let stem = rendered.strip_suffix(')').unwrap_or(&rendered);
    Ok(format!("{stem}({extra}))"))
}
