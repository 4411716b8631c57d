//! probe assertions.
//!
//! [`assert_success`] applies the pass/fail rules of an API call: an exact
//! status code and, optionally, rules on fields of the JSON body. The
//! `check*` macros are borrowed from `pretty_assertions` with a small
//! modification: they return an [`Error`] instead of panicking, so the
//! failure travels through `?` into the test's `eyre::Report`.
use serde_json::Value;

use crate::{http::Response, masking};

/// Assertion failure. Every variant names the mismatch it found.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("AssertionFailure: expected status {expected}, got {actual}; body: {body}")]
    Status {
        expected: u16,
        actual: u16,
        body: String,
    },
    #[error("AssertionFailure: response not parseable as JSON ({reason}); body: {body}")]
    NotParseable { reason: String, body: String },
    #[error("AssertionFailure: field \"{field}\" is missing from the response")]
    MissingField { field: String },
    #[error("AssertionFailure: field \"{field}\" is not truthy: {value}")]
    FalsyField { field: String, value: Value },
    #[error("{0}")]
    Check(String),
    #[error("{0}")]
    StrEq(String),
    #[error("{0}")]
    Eq(String),
    #[error("{0}")]
    Ne(String),
}

/// Rule applied to a field of the response body. Nested fields are addressed with dots,
/// e.g. `data.organization.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// The field exists and is truthy: not `null`, `false`, `0`, `""`, `[]` or `{}`.
    Truthy(String),
    /// The field exists, whatever its value.
    Present(String),
}

/// What a successful response looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectations {
    pub status: u16,
    pub fields: Vec<FieldRule>,
}

impl Default for Expectations {
    fn default() -> Self {
        Expectations::status(200)
    }
}

impl Expectations {
    pub fn status(status: u16) -> Expectations {
        Expectations {
            status,
            fields: Vec::new(),
        }
    }

    pub fn truthy(mut self, field: impl Into<String>) -> Expectations {
        self.fields.push(FieldRule::Truthy(field.into()));
        self
    }

    pub fn present(mut self, field: impl Into<String>) -> Expectations {
        self.fields.push(FieldRule::Present(field.into()));
        self
    }
}

/// Checks `response` against `expectations`. The body is parsed only when a field rule is
/// given.
pub fn assert_success(response: &Response, expectations: &Expectations) -> Result<(), Error> {
    let actual = response.status().as_u16();
    if actual != expectations.status {
        return Err(Error::Status {
            expected: expectations.status,
            actual,
            body: masking::preview(response.text()),
        });
    }

    if expectations.fields.is_empty() {
        return Ok(());
    }

    let body: Value = serde_json::from_str(response.text()).map_err(|e| Error::NotParseable {
        reason: e.to_string(),
        body: masking::preview(response.text()),
    })?;

    for rule in &expectations.fields {
        match rule {
            FieldRule::Present(field) => {
                lookup(&body, field).ok_or_else(|| Error::MissingField {
                    field: field.clone(),
                })?;
            }
            FieldRule::Truthy(field) => {
                let value = lookup(&body, field).ok_or_else(|| Error::MissingField {
                    field: field.clone(),
                })?;
                if !is_truthy(value) {
                    return Err(Error::FalsyField {
                        field: field.clone(),
                        value: masking::mask_json(value),
                    });
                }
            }
        }
    }

    Ok(())
}

fn lookup<'a>(body: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(body, |value, key| match value {
            Value::Array(items) => items.get(key.parse::<usize>().ok()?),
            _ => value.get(key),
        })
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Asserts that a boolean expression is true.
///
/// ```rust,ignore
/// use probe::{check, http::Client};
///
/// #[probe::test]
/// async fn status_check() -> eyre::Result<()> {
///     let response = Client::new().get("https://api.example.com").send().await?;
///     check!(response.status().is_success(), "Expected 200 OK status");
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        $crate::check!(@ $cond, "", "");
    };
    ($cond:expr, $($arg:tt)+) => {
        $crate::check!(@ $cond, ": ", $($arg)+);
    };
    (@ $cond:expr, $maybe_colon:expr, $($arg:tt)*) => {
        if !$cond {
            let __message = format!("check failed: {}{}{}", stringify!($cond), $maybe_colon, format_args!($($arg)*));
            Err($crate::assertion::Error::Check(__message))?;
        }
    };
}

/// Asserts that two string expressions are equal, with a line and character diff on failure.
#[macro_export]
macro_rules! check_str_eq {
    ($left:expr, $right:expr$(,)?) => ({
        $crate::check_str_eq!(@ $left, $right, "", "");
    });
    ($left:expr, $right:expr, $($arg:tt)+) => ({
        $crate::check_str_eq!(@ $left, $right, ": ", $($arg)+);
    });
    (@ $left:expr, $right:expr, $maybe_colon:expr, $($arg:tt)*) => ({
        match (&($left), &($right)) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    let __message = format!("check failed: `(left == right)`{}{}\
                       \n\
                       \n{}\
                       \n",
                       $maybe_colon,
                       format_args!($($arg)*),
                       $crate::pretty_assertions::StrComparison::new(left_val, right_val)
                    );
                    Err($crate::assertion::Error::StrEq(__message))?;
                }
            }
        }
    });
}

/// Asserts that two expressions are equal using `==`, with a pretty diff on failure.
///
/// ```rust,ignore
/// check_eq!(200, response.status().as_u16(), "organization lookup");
/// ```
#[macro_export]
macro_rules! check_eq {
    ($left:expr, $right:expr$(,)?) => ({
        $crate::check_eq!(@ $left, $right, "", "");
    });
    ($left:expr, $right:expr, $($arg:tt)+) => ({
        $crate::check_eq!(@ $left, $right, ": ", $($arg)+);
    });
    (@ $left:expr, $right:expr, $maybe_colon:expr, $($arg:tt)*) => ({
        match (&($left), &($right)) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    let __message = format!("check failed: `(left == right)`{}{}\
                       \n\
                       \n{}\
                       \n",
                       $maybe_colon,
                       format_args!($($arg)*),
                       $crate::pretty_assertions::Comparison::new(left_val, right_val)
                    );
                    Err($crate::assertion::Error::Eq(__message))?;
                }
            }
        }
    });
}

/// Asserts that two expressions are not equal using `!=`.
#[macro_export]
macro_rules! check_ne {
    ($left:expr, $right:expr$(,)?) => ({
        $crate::check_ne!(@ $left, $right, "", "");
    });
    ($left:expr, $right:expr, $($arg:tt)+) => ({
        $crate::check_ne!(@ $left, $right, ": ", $($arg)+);
    });
    (@ $left:expr, $right:expr, $maybe_colon:expr, $($arg:tt)*) => ({
        match (&($left), &($right)) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    let __message = format!("check failed: `(left != right)`{}{}\
                        \n\
                        \nBoth sides:\
                        \n{:#?}\
                        \n\
                        \n",
                        $maybe_colon,
                        format_args!($($arg)*),
                        left_val
                    );
                    Err($crate::assertion::Error::Ne(__message))?;
                }
            }
        }
    });
}
