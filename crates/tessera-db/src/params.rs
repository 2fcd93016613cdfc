//! Named query parameters.
//!
//! SQL templates reference values as `@name`. Before a statement is sent the
//! template is rewritten to PostgreSQL's positional `$n` form and the bound
//! values are arranged in slot order. Templates without any `@name`
//! placeholder are treated as positional and receive the values in binding
//! order.

use std::borrow::Cow;

use postgres::types::ToSql;

use crate::error::DbError;

type BoxedValue = Box<dyn ToSql + Sync + Send>;

/// An ordered set of named parameter values.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<(String, BoxedValue)>,
}

impl Params {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` to `name`, replacing any earlier value for that name.
    pub fn bind<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: ToSql + Sync + Send + 'static,
    {
        let name = name.into();
        match self.values.iter_mut().find(|(bound, _)| *bound == name) {
            Some(slot) => slot.1 = Box::new(value),
            None => self.values.push((name, Box::new(value))),
        }
        self
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bound names in binding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    fn get(&self, name: &str) -> Option<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .find(|(bound, _)| bound == name)
            .map(|(_, value)| &**value as &(dyn ToSql + Sync))
    }

    fn positional(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|(_, value)| &**value as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Builds a [`Params`] set from `name = value` pairs.
///
/// ```rust,ignore
/// let params = tessera_db::params!(name = "migration_1_init", limit = 10_i64);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::new()
    };
    ($($name:ident = $value:expr),+ $(,)?) => {
        $crate::Params::new()$(.bind(stringify!($name), $value))+
    };
}

/// A template rewritten to positional form, with values in slot order.
pub(crate) struct BoundStatement<'a> {
    pub sql: Cow<'a, str>,
    pub values: Vec<&'a (dyn ToSql + Sync)>,
}

struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

/// Rewrites `@name` placeholders in `sql` and resolves them against `params`.
pub(crate) fn bind<'a>(sql: &'a str, params: &'a Params) -> Result<BoundStatement<'a>, DbError> {
    let placeholders = scan_placeholders(sql);
    if placeholders.is_empty() {
        return Ok(BoundStatement {
            sql: Cow::Borrowed(sql),
            values: params.positional(),
        });
    }

    let mut slots: Vec<&str> = Vec::new();
    let mut values = Vec::new();
    let mut rewritten = String::with_capacity(sql.len());
    let mut cursor = 0;

    for placeholder in &placeholders {
        let slot = match slots.iter().position(|name| *name == placeholder.name) {
            Some(index) => index + 1,
            None => {
                let value = params.get(placeholder.name).ok_or_else(|| {
                    DbError::Parameter(format!(
                        "no value bound for placeholder '@{}'",
                        placeholder.name
                    ))
                })?;
                slots.push(placeholder.name);
                values.push(value);
                slots.len()
            }
        };
        rewritten.push_str(&sql[cursor..placeholder.start]);
        rewritten.push('$');
        rewritten.push_str(&slot.to_string());
        cursor = placeholder.end;
    }
    rewritten.push_str(&sql[cursor..]);

    Ok(BoundStatement {
        sql: Cow::Owned(rewritten),
        values,
    })
}

fn scan_placeholders(sql: &str) -> Vec<Placeholder<'_>> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'E' | b'e'
                if bytes.get(i + 1) == Some(&b'\'')
                    && (i == 0 || !is_ident_char(bytes[i - 1])) =>
            {
                i = skip_escape_string(bytes, i + 1);
            }
            b'\'' | b'"' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |offset| i + offset + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find(bytes, i + 2, b"*/").map_or(bytes.len(), |at| at + 2);
            }
            b'$' => i = skip_dollar_quoted(bytes, i),
            b'@' if bytes.get(i + 1).is_some_and(|&b| is_ident_start(b))
                && (i == 0 || !is_ident_char(bytes[i - 1])) =>
            {
                let start = i;
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                found.push(Placeholder {
                    start,
                    end: i,
                    name: &sql[start + 1..i],
                });
            }
            _ => i += 1,
        }
    }

    found
}

/// Skips a `'...'` string or `"..."` identifier; a doubled quote is an escape.
fn skip_quoted(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Skips the body of an `E'...'` string, where a backslash escapes the next
/// byte in addition to the doubled quote.
fn skip_escape_string(bytes: &[u8], open: usize) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skips a `$tag$...$tag$` body. A `$` that does not open a tag (such as a
/// positional `$1`) is stepped over.
fn skip_dollar_quoted(bytes: &[u8], open: usize) -> usize {
    let mut j = open + 1;
    if j < bytes.len() && is_ident_start(bytes[j]) {
        j += 1;
        while j < bytes.len() && is_ident_char(bytes[j]) {
            j += 1;
        }
    }
    if bytes.get(j) != Some(&b'$') {
        return open + 1;
    }
    let tag = &bytes[open..=j];
    find(bytes, j + 1, tag).map_or(bytes.len(), |at| at + tag.len())
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
