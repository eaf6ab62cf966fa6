//! Operator answers and how raw prompt input maps onto them.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What the decision source said about one pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Allow this call only (`Y`, `y` or an empty line).
    AllowOnce,
    /// Deny this call only (`n`).
    DenyOnce,
    /// Allow this call and matching calls for a while (`10s`, `5m`, `1h`).
    AllowForDuration(Duration),
    /// Allow this call and the next N matching calls (`1000`).
    AllowForCount(u32),
    /// Allow everything for the rest of the session (`a`).
    AllowSessionAll,
    /// Anything else. Treated as deny-once.
    Invalid(String),
}

/// Accepted answer forms, shown after an invalid answer.
pub const ANSWER_HELP: &str =
    "Enter Y, n, a (allow all), e.g. 10s for seconds, or 10 for count.";

impl Answer {
    /// Parse one line of operator input. Whitespace and case are ignored.
    pub fn parse(raw: &str) -> Self {
        let input = raw.trim();
        if input.is_empty() || input.eq_ignore_ascii_case("y") {
            return Answer::AllowOnce;
        }
        if input.eq_ignore_ascii_case("n") {
            return Answer::DenyOnce;
        }
        if input.eq_ignore_ascii_case("a") {
            return Answer::AllowSessionAll;
        }
        if let Some(duration) = parse_duration(input) {
            return Answer::AllowForDuration(duration);
        }
        if is_digits(input) {
            if let Ok(count) = input.parse::<u32>() {
                return Answer::AllowForCount(count);
            }
        }
        Answer::Invalid(input.to_string())
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::AllowOnce => write!(f, "allow-once"),
            Answer::DenyOnce => write!(f, "deny-once"),
            Answer::AllowForDuration(d) => write!(f, "allow-for-{}s", d.as_secs()),
            Answer::AllowForCount(n) => write!(f, "allow-next-{n}"),
            Answer::AllowSessionAll => write!(f, "allow-all"),
            Answer::Invalid(raw) => write!(f, "invalid({raw:?})"),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `<digits>s`, `<digits>m` or `<digits>h`.
fn parse_duration(input: &str) -> Option<Duration> {
    let unit = input.chars().last()?;
    let scale: u64 = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        _ => return None,
    };
    let digits = &input[..input.len() - unit.len_utf8()];
    if !is_digits(digits) {
        return None;
    }
    let secs = digits.parse::<u64>().ok()?.checked_mul(scale)?;
    Some(Duration::from_secs(secs))
}

/// Failure to obtain a usable answer. Always resolved as deny-once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    /// No answer arrived within the configured prompt timeout.
    #[error("no answer before the prompt timed out")]
    Timeout,

    /// The answer did not match any accepted form.
    #[error("unrecognized answer: {0:?}")]
    MalformedAnswer(String),

    /// The decision source could not be reached.
    #[error("decision source unavailable: {0}")]
    Unavailable(String),
}
