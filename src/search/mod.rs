//! Comparison operators for stored-information search.
//!
//! The operator vocabulary is fixed: `eq`, `neq`, `prefix`, `suffix`,
//! `contains`, their case-insensitive `i*` variants, and `regex`. Misuse is
//! an error, never a silent non-match.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchOperator {
    Eq,
    Neq,
    Prefix,
    Suffix,
    Contains,
    Ieq,
    Iprefix,
    Isuffix,
    Icontains,
    Regex,
}

impl SearchOperator {
    pub const ALL: [SearchOperator; 10] = [
        SearchOperator::Eq,
        SearchOperator::Neq,
        SearchOperator::Prefix,
        SearchOperator::Suffix,
        SearchOperator::Contains,
        SearchOperator::Ieq,
        SearchOperator::Iprefix,
        SearchOperator::Isuffix,
        SearchOperator::Icontains,
        SearchOperator::Regex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchOperator::Eq => "eq",
            SearchOperator::Neq => "neq",
            SearchOperator::Prefix => "prefix",
            SearchOperator::Suffix => "suffix",
            SearchOperator::Contains => "contains",
            SearchOperator::Ieq => "ieq",
            SearchOperator::Iprefix => "iprefix",
            SearchOperator::Isuffix => "isuffix",
            SearchOperator::Icontains => "icontains",
            SearchOperator::Regex => "regex",
        }
    }
}

impl fmt::Display for SearchOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchOperator {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(SearchOperator::Eq),
            "neq" => Ok(SearchOperator::Neq),
            "prefix" => Ok(SearchOperator::Prefix),
            "suffix" => Ok(SearchOperator::Suffix),
            "contains" => Ok(SearchOperator::Contains),
            "ieq" => Ok(SearchOperator::Ieq),
            "iprefix" => Ok(SearchOperator::Iprefix),
            "isuffix" => Ok(SearchOperator::Isuffix),
            "icontains" => Ok(SearchOperator::Icontains),
            "regex" => Ok(SearchOperator::Regex),
            other => Err(HubError::UnknownOperator(other.to_string())),
        }
    }
}

/// A needle compiled once for matching many haystacks.
///
/// Compilation is where operator misuse surfaces: an invalid regex fails here
/// with [`HubError::InvalidPattern`] instead of matching nothing during the
/// scan.
pub enum Pattern {
    Literal {
        op: SearchOperator,
        needle: String,
    },
    Folded {
        op: SearchOperator,
        needle: String,
    },
    Regex(Regex),
}

impl Pattern {
    pub fn compile(op: SearchOperator, needle: &str) -> Result<Self, HubError> {
        Ok(match op {
            SearchOperator::Regex => Pattern::Regex(Regex::new(needle)?),
            SearchOperator::Ieq
            | SearchOperator::Iprefix
            | SearchOperator::Isuffix
            | SearchOperator::Icontains => Pattern::Folded {
                op,
                needle: needle.to_lowercase(),
            },
            _ => Pattern::Literal {
                op,
                needle: needle.to_string(),
            },
        })
    }

    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            Pattern::Literal { op, needle } => match op {
                SearchOperator::Eq => haystack == needle,
                SearchOperator::Neq => haystack != needle,
                SearchOperator::Prefix => haystack.starts_with(needle),
                SearchOperator::Suffix => haystack.ends_with(needle),
                SearchOperator::Contains => haystack.contains(needle),
                _ => unreachable!("folded/regex operators are compiled separately"),
            },
            Pattern::Folded { op, needle } => {
                let folded = haystack.to_lowercase();
                match op {
                    SearchOperator::Ieq => folded == *needle,
                    SearchOperator::Iprefix => folded.starts_with(needle),
                    SearchOperator::Isuffix => folded.ends_with(needle),
                    SearchOperator::Icontains => folded.contains(needle),
                    _ => unreachable!("literal operators are compiled separately"),
                }
            }
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }
}

/// One-shot convenience for callers that match a single pair.
pub fn matches(op: SearchOperator, haystack: &str, needle: &str) -> Result<bool, HubError> {
    Ok(Pattern::compile(op, needle)?.matches(haystack))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_operators() {
        assert!(matches(SearchOperator::Eq, "hello", "hello").unwrap());
        assert!(!matches(SearchOperator::Eq, "Hello", "hello").unwrap());
        assert!(matches(SearchOperator::Neq, "Hello", "hello").unwrap());
        assert!(matches(SearchOperator::Prefix, "help", "hel").unwrap());
        assert!(!matches(SearchOperator::Prefix, "Hello", "hel").unwrap());
        assert!(matches(SearchOperator::Suffix, "warszawa", "awa").unwrap());
        assert!(matches(SearchOperator::Contains, "timeout", "meo").unwrap());
    }

    #[test]
    fn case_insensitive_operators() {
        assert!(matches(SearchOperator::Ieq, "Hello", "hELLo").unwrap());
        assert!(matches(SearchOperator::Iprefix, "Hello", "hel").unwrap());
        assert!(matches(SearchOperator::Isuffix, "HELLO", "llo").unwrap());
        assert!(matches(SearchOperator::Icontains, "Hello", "ell").unwrap());
        assert!(!matches(SearchOperator::Icontains, "help", "ell").unwrap());
    }

    #[test]
    fn regex_operator() {
        assert!(matches(SearchOperator::Regex, "user-42", r"^user-\d+$").unwrap());
        assert!(!matches(SearchOperator::Regex, "user-x", r"^user-\d+$").unwrap());
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let err = matches(SearchOperator::Regex, "anything", "(unclosed").unwrap_err();
        assert!(matches!(err, HubError::InvalidPattern(_)));
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let err = "like".parse::<SearchOperator>().unwrap_err();
        assert!(matches!(err, HubError::UnknownOperator(op) if op == "like"));
    }

    #[test]
    fn operator_round_trip() {
        for op in SearchOperator::ALL {
            assert_eq!(op.as_str().parse::<SearchOperator>().unwrap(), op);
        }
    }
}
