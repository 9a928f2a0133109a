//! Assertion DSL.
//!
//! Matchers are a closed set of variants evaluated by [`evaluate`], which
//! returns whether the value matched and a description of the mismatch.
//! Actual values are converted into a [`Value`] through [`ToValue`].
//!
//! ```rust,ignore
//! expect(&output.stdout_str()).to(equal("hello\n"))?;
//! eventually(|| rc.container_state(&id))
//!     .within(Poller::state_transition())
//!     .should(equal(ContainerState::ContainerRunning))
//!     .await?;
//! ```
//!
//! A failed expectation is an [`Error::AssertionFailed`]; the runner attaches
//! it to the current leaf.

use crate::cri::{ContainerState, Image, PodSandboxState};
use crate::error::{Error, Result};
use crate::poll::{PollFailure, Poller};
use regex::Regex;
use std::fmt;
use std::future::Future;

// =============================================================================
// Values
// =============================================================================

/// Dynamic view of an actual or expected value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i128),
    Str(String),
    List(Vec<Value>),
    /// Debug rendering of a value with no structural view.
    Opaque(String),
}

impl Value {
    fn is_zero(&self) -> bool {
        match self {
            Self::Nil => true,
            Self::Bool(b) => !b,
            Self::Int(i) => *i == 0,
            Self::Str(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Opaque(_) => false,
        }
    }

    fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.len()),
            Self::List(items) => Some(items.len()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "<nil>"),
            Self::Bool(b) => write!(f, "<bool>: {b}"),
            Self::Int(i) => write!(f, "<int>: {i}"),
            Self::Str(s) => write!(f, "<string>: {s:?}"),
            Self::List(items) => {
                write!(f, "<list>: [")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Opaque(s) => write!(f, "{s}"),
        }
    }
}

/// Conversion into a [`Value`] for matching.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

macro_rules! int_to_value {
    ($($t:ty),*) => {
        $(impl ToValue for $t {
            fn to_value(&self) -> Value {
                Value::Int(*self as i128)
            }
        })*
    };
}

int_to_value!(i32, i64, u32, u64, usize);

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Str(self.to_string())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(value) => value.to_value(),
            None => Value::Nil,
        }
    }
}

impl<T: ToValue> ToValue for [T] {
    fn to_value(&self) -> Value {
        Value::List(self.iter().map(ToValue::to_value).collect())
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        self.as_slice().to_value()
    }
}

impl ToValue for ContainerState {
    fn to_value(&self) -> Value {
        Value::Str(format!("{self:?}"))
    }
}

impl ToValue for PodSandboxState {
    fn to_value(&self) -> Value {
        Value::Str(format!("{self:?}"))
    }
}

impl ToValue for Image {
    fn to_value(&self) -> Value {
        Value::Opaque(format!("{self:?}"))
    }
}

// =============================================================================
// Matchers
// =============================================================================

/// Closed set of matchers.
#[derive(Debug, Clone)]
pub enum Matcher {
    Equal(Value),
    ContainSubstring(String),
    MatchRegexp(String),
    ContainElement(Value),
    HaveLen(usize),
    BeEmpty,
    BeNil,
    BeTrue,
    BeFalse,
    BeZero,
    Not(Box<Matcher>),
    AllOf(Vec<Matcher>),
    AnyOf(Vec<Matcher>),
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal(v) => write!(f, "to equal\n    {v}"),
            Self::ContainSubstring(s) => write!(f, "to contain substring\n    {s:?}"),
            Self::MatchRegexp(p) => write!(f, "to match regular expression\n    {p:?}"),
            Self::ContainElement(v) => write!(f, "to contain element\n    {v}"),
            Self::HaveLen(n) => write!(f, "to have length {n}"),
            Self::BeEmpty => write!(f, "to be empty"),
            Self::BeNil => write!(f, "to be nil"),
            Self::BeTrue => write!(f, "to be true"),
            Self::BeFalse => write!(f, "to be false"),
            Self::BeZero => write!(f, "to be zero-valued"),
            Self::Not(inner) => write!(f, "not {inner}"),
            Self::AllOf(all) => {
                write!(f, "to satisfy all of:")?;
                for m in all {
                    write!(f, "\n  {m}")?;
                }
                Ok(())
            }
            Self::AnyOf(any) => {
                write!(f, "to satisfy any of:")?;
                for m in any {
                    write!(f, "\n  {m}")?;
                }
                Ok(())
            }
        }
    }
}

pub fn equal(expected: impl ToValue) -> Matcher {
    Matcher::Equal(expected.to_value())
}

pub fn contain_substring(needle: impl Into<String>) -> Matcher {
    Matcher::ContainSubstring(needle.into())
}

pub fn match_regexp(pattern: impl Into<String>) -> Matcher {
    Matcher::MatchRegexp(pattern.into())
}

pub fn contain_element(element: impl ToValue) -> Matcher {
    Matcher::ContainElement(element.to_value())
}

pub fn have_len(len: usize) -> Matcher {
    Matcher::HaveLen(len)
}

pub fn be_empty() -> Matcher {
    Matcher::BeEmpty
}

pub fn be_nil() -> Matcher {
    Matcher::BeNil
}

pub fn not_nil() -> Matcher {
    not(Matcher::BeNil)
}

pub fn be_true() -> Matcher {
    Matcher::BeTrue
}

pub fn be_false() -> Matcher {
    Matcher::BeFalse
}

pub fn be_zero() -> Matcher {
    Matcher::BeZero
}

pub fn not_zero() -> Matcher {
    not(Matcher::BeZero)
}

pub fn not(matcher: Matcher) -> Matcher {
    Matcher::Not(Box::new(matcher))
}

pub fn all_of(matchers: Vec<Matcher>) -> Matcher {
    Matcher::AllOf(matchers)
}

pub fn any_of(matchers: Vec<Matcher>) -> Matcher {
    Matcher::AnyOf(matchers)
}

/// Evaluates `matcher` against `actual`.
///
/// Returns whether it matched and, on mismatch, a description of what was
/// expected. A matcher that does not apply to the value's kind never
/// matches.
pub fn evaluate(actual: &Value, matcher: &Matcher) -> (bool, String) {
    let matched = match (matcher, actual) {
        (Matcher::Equal(expected), _) => actual == expected,
        (Matcher::ContainSubstring(needle), Value::Str(s)) => s.contains(needle.as_str()),
        (Matcher::MatchRegexp(pattern), Value::Str(s)) => match Regex::new(pattern) {
            Ok(re) => re.is_match(s),
            Err(e) => {
                return (false, format!("invalid regular expression {pattern:?}: {e}"));
            }
        },
        (Matcher::ContainElement(element), Value::List(items)) => items.contains(element),
        (Matcher::HaveLen(n), _) => actual.len() == Some(*n),
        (Matcher::BeEmpty, _) => actual.len() == Some(0),
        (Matcher::BeNil, _) => *actual == Value::Nil,
        (Matcher::BeTrue, _) => *actual == Value::Bool(true),
        (Matcher::BeFalse, _) => *actual == Value::Bool(false),
        (Matcher::BeZero, _) => actual.is_zero(),
        (Matcher::Not(inner), _) => !evaluate(actual, inner).0,
        (Matcher::AllOf(all), _) => all.iter().all(|m| evaluate(actual, m).0),
        (Matcher::AnyOf(any), _) => any.iter().any(|m| evaluate(actual, m).0),
        _ => false,
    };

    if matched {
        (true, String::new())
    } else {
        (false, format!("Expected\n    {actual}\n{matcher}"))
    }
}

// =============================================================================
// Expectations
// =============================================================================

/// Immediate expectation on a value.
pub struct Expectation {
    actual: Value,
    description: Option<String>,
}

/// Starts an expectation on `actual`.
pub fn expect(actual: impl ToValue) -> Expectation {
    Expectation {
        actual: actual.to_value(),
        description: None,
    }
}

impl Expectation {
    /// Prefix shown before the mismatch description.
    pub fn described_as(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn to(self, matcher: Matcher) -> Result<()> {
        match evaluate(&self.actual, &matcher) {
            (true, _) => Ok(()),
            (false, message) => Err(Error::assertion(match self.description {
                Some(description) => format!("{description}\n{message}"),
                None => message,
            })),
        }
    }

    pub fn not_to(self, matcher: Matcher) -> Result<()> {
        self.to(not(matcher))
    }
}

/// Fails with an [`Error::AssertionFailed`] if `result` is an error.
pub fn expect_ok<T>(result: Result<T>, what: &str) -> Result<T> {
    result.map_err(|err| Error::assertion(format!("{what}: unexpected error: {err}")))
}

/// Fails unless `result` is an error.
pub fn expect_err<T: fmt::Debug>(result: Result<T>, what: &str) -> Result<Error> {
    match result {
        Err(err) => Ok(err),
        Ok(value) => Err(Error::assertion(format!(
            "{what}: expected an error, got {value:?}"
        ))),
    }
}

fn describe_failure<T: ToValue>(
    kind: &str,
    poller: &Poller,
    failure: &PollFailure<T>,
    matcher: &Matcher,
) -> String {
    let mut message = format!(
        "{kind} failed after {:.1}s ({} attempts, window {:?}, interval {:?})",
        failure.elapsed.as_secs_f64(),
        failure.attempts,
        poller.window,
        poller.interval
    );
    if let Some(last) = &failure.last {
        message.push('\n');
        message.push_str(&evaluate(&last.to_value(), matcher).1);
    }
    if let Some(err) = &failure.last_error {
        message.push_str(&format!("\nlast error: {err}"));
    }
    message
}

/// Polled expectation that must hold at some point within the window.
pub struct Eventually<F> {
    f: F,
    poller: Poller,
}

/// Polls `f` until a matcher accepts its value (default window 60 s / 4 s).
pub fn eventually<F>(f: F) -> Eventually<F> {
    Eventually {
        f,
        poller: Poller::state_transition(),
    }
}

impl<F, Fut, T> Eventually<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    T: ToValue,
{
    pub fn within(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    /// Returns the accepted value.
    pub async fn should(self, matcher: Matcher) -> Result<T> {
        let poller = self.poller;
        poller
            .eventually(self.f, |value| evaluate(&value.to_value(), &matcher).0)
            .await
            .map_err(|failure| {
                Error::assertion(describe_failure("Eventually", &poller, &failure, &matcher))
            })
    }
}

/// Polled expectation that must hold throughout the window.
pub struct Consistently<F> {
    f: F,
    poller: Poller,
}

/// Polls `f` for the window (default 5 s / 1 s), requiring every value to match.
pub fn consistently<F>(f: F) -> Consistently<F> {
    Consistently {
        f,
        poller: Poller::stability(),
    }
}

impl<F, Fut, T> Consistently<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    T: ToValue,
{
    pub fn for_window(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    /// Returns the last observed value.
    pub async fn should(self, matcher: Matcher) -> Result<T> {
        let poller = self.poller;
        poller
            .consistently(self.f, |value| evaluate(&value.to_value(), &matcher).0)
            .await
            .map_err(|failure| {
                Error::assertion(describe_failure("Consistently", &poller, &failure, &matcher))
            })
    }
}
