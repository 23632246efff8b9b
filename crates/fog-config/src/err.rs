//! Declare error types for configuration parsing.

use thiserror::Error;

/// An error found while parsing a fog configuration file.
///
/// All of these are fatal: a configuration that provokes one cannot
/// be used to build any chain.  Every variant carries the 1-based
/// line number of the offending directive.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A line could not be split into shell-style tokens.
    #[error("line {line}: bad quoting")]
    Quoting {
        /// Line number of the malformed directive.
        line: usize,
        /// The underlying tokenizer error.
        #[source]
        source: shell_words::ParseError,
    },

    /// A directive was missing required arguments.
    #[error("line {line}: {directive} needs {expected}")]
    Truncated {
        /// Line number of the malformed directive.
        line: usize,
        /// The directive that was malformed.
        directive: &'static str,
        /// What the directive would have needed.
        expected: &'static str,
    },

    /// The same transport name was declared twice.
    #[error("line {line}: transport {name:?} is already declared")]
    DuplicateTransport {
        /// Line number of the second declaration.
        line: usize,
        /// The transport name in question.
        name: String,
    },

    /// The same chain alias was declared twice.
    #[error("line {line}: chain {name:?} is already declared")]
    DuplicateAlias {
        /// Line number of the second declaration.
        line: usize,
        /// The chain alias in question.
        name: String,
    },

    /// A chain with fewer than two links.
    #[error("line {line}: chain {name:?} needs at least two transports")]
    ChainTooShort {
        /// Line number of the declaration.
        line: usize,
        /// The chain alias in question.
        name: String,
    },

    /// A chain referring to a transport nobody declared.
    #[error("line {line}: chain {chain:?} uses undeclared transport {name:?}")]
    UnknownTransport {
        /// Line number of the chain declaration.
        line: usize,
        /// The chain alias that made the reference.
        chain: String,
        /// The transport name that is not in the catalog.
        name: String,
    },
}
