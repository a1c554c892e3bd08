//! Parser contract
//!
//! Parsing configuration documents is done elsewhere; the engine only
//! consumes the parsed units and the structured error a parser reports.

use crate::codes;
use crate::unit::{ConfigurationUnit, ValueSet};
use thiserror::Error;

/// Output of a successful parse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSet {
    pub schema_version: String,
    pub units: Vec<ConfigurationUnit>,
    pub parameters: ValueSet,
    pub variables: ValueSet,
    pub metadata: ValueSet,
}

/// A malformed document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} at {line}:{column}{}", describe_code(.code), describe_field(.field, .value))]
pub struct ParseError {
    pub code: i32,
    /// Offending field, if known
    pub field: String,
    /// Offending value, if known
    pub value: String,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            field: String::new(),
            value: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = field.into();
        self.value = value.into();
        self
    }
}

fn describe_code(code: &i32) -> String {
    codes::describe(*code)
}

fn describe_field(field: &str, value: &str) -> String {
    if field.is_empty() {
        String::new()
    } else {
        format!(" (field `{field}`, value `{value}`)")
    }
}

/// Turns a byte stream into a schema version and a list of units
pub trait SetParser {
    fn parse(&self, input: &[u8]) -> Result<ParsedSet, ParseError>;
}
