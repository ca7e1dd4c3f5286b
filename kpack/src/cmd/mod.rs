mod pack;
mod recombine;

use self::pack::Pack;
use self::recombine::Recombine;
use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Repackage a GPU software distribution: split device code out of host
/// binaries into packed kernel archives, and recombine sharded build outputs
/// into architecture-group packages.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace]. You
    /// can also leave this unset and use the RUST_LOG env variable.
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Scan an install tree, extract device code into a .kpack archive and
    /// rewrite host binaries to reference it.
    Pack(Pack),

    /// Combine per-architecture artifacts from build shards into
    /// architecture-group packages.
    Recombine(Recombine),
}

/// Entrypoint for the `kpack` command line program.
pub(super) fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::Pack(pack_args) => pack_args.run(),
        Subcommand::Recombine(recombine_args) => recombine_args.run(),
    }
}

/// use `level` if present, or else use `RUST_LOG` if present, or else use a default.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // RUST_LOG exists and level does not; use the environment variable.
            Builder::from_default_env().init();
        }
        _ => {
            // use provided log level or default for this crate only.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}
