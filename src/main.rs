use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod create;
mod error;
mod extract;
mod header;
mod plan;
#[cfg(test)]
mod test_utils;
mod trailer;

use error::Error;

/// Archive and extract v7 tar files with many worker threads, each
/// operating on its own byte range of one shared archive file.
#[derive(Debug, Parser)]
#[command(name = "ptar", version, about = "Parallel tar archiver")]
struct Args {
    /// Create an archive.
    #[arg(short = 'c')]
    create: bool,

    /// Extract an archive.
    #[arg(short = 'x')]
    extract: bool,

    /// File mode; required alongside -c or -x.
    #[arg(short = 'f')]
    file: bool,

    /// Print each processed entry on stdout.
    #[arg(short = 'v')]
    verbose: bool,

    /// Number of worker threads.
    #[arg(long, value_name = "N", default_value_t = 24)]
    nthreads: usize,

    /// Read and write in chunks of this many 4096-byte blocks.
    #[arg(long, value_name = "B", default_value_t = 2000)]
    blocking_factor: usize,

    /// Archive file.
    #[arg(value_name = "ARCHIVE")]
    archive: Option<PathBuf>,

    /// Paths to archive (create mode).
    #[arg(value_name = "PATH")]
    inputs: Vec<PathBuf>,
}

/// Worker settings shared by the create and extract phases.
#[derive(Debug, Clone)]
pub struct Options {
    pub nthreads: usize,
    pub blocking_factor: usize,
    pub verbose: bool,
}

impl Options {
    pub fn chunk_size(&self) -> usize {
        self.blocking_factor.saturating_mul(4096)
    }
}

#[derive(Clone)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        // Inconsistent flag combinations exit without action.
        Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::InvalidArguments)) => {
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("ptar: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    if !args.file || (!args.create && !args.extract) {
        return Err(Error::InvalidArguments.into());
    }
    let Some(archive) = args.archive else {
        return Err(Error::InvalidArguments.into());
    };
    if args.blocking_factor == 0 {
        bail!("blocking factor must be greater than zero");
    }

    let opts = Options {
        nthreads: args.nthreads.max(1),
        blocking_factor: args.blocking_factor,
        verbose: args.verbose,
    };
    if args.create {
        create::create_archive(&archive, &args.inputs, &opts)
    } else {
        extract::extract_archive(&archive, &opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = parse(&["ptar", "-c", "-f", "out.ptar", "dir"]);
        assert_eq!(args.nthreads, 24);
        assert_eq!(args.blocking_factor, 2000);
        assert!(!args.verbose);
        assert_eq!(
            args.archive.as_deref(),
            Some(std::path::Path::new("out.ptar"))
        );
        assert_eq!(args.inputs, vec![PathBuf::from("dir")]);
    }

    #[test]
    fn missing_file_switch_is_a_silent_no_op() {
        let err = run(parse(&["ptar", "-c", "out.ptar", "dir"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidArguments)
        ));
        let err = run(parse(&["ptar", "-f", "out.ptar"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidArguments)
        ));
    }

    #[test]
    fn chunk_size_scales_with_blocking_factor() {
        let opts = Options {
            nthreads: 1,
            blocking_factor: 3,
            verbose: false,
        };
        assert_eq!(opts.chunk_size(), 12288);
    }
}
