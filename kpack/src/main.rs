use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod artifact;
mod cmd;
mod collect;
mod combine;
mod config;
mod merge;
mod recognize;
mod scan;
/// Test code that should only be compiled when running tests.
#[cfg(test)]
mod test;
mod visitor;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can
/// return a result from the `main` function.
fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);
    cmd::run(args)
}
