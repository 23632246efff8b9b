//! Command-line entry point for `fog`, the pluggable transport
//! combiner.
//!
//! All of the logic lives in the library crate; this shim exists so
//! that errors get reported once, on stderr, with a nonzero exit.

#![allow(clippy::print_stderr)]

fn main() {
    if let Err(error) = fog::main_main() {
        // The alternate form prints the whole context chain.
        eprintln!("fog: {:#}", error);
        std::process::exit(1);
    }
}
