//! Command-line interface of the `snapprof` binary

mod args;

pub use args::Args;
