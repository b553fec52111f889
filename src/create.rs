//! Create path: the planner feeds a bounded queue that a pool of
//! seek-and-write workers drains. The planner's disjoint offsets are
//! the only write coordination; the workers share nothing else.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use rayon::ThreadPoolBuilder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::header::{pad_len, Kind, ZERO_BLOCK};
use crate::plan::{self, WorkItem};
use crate::trailer;
use crate::{AbortSignal, Options};

pub fn create_archive(archive: &Path, roots: &[PathBuf], opts: &Options) -> anyhow::Result<()> {
    match fs::remove_file(archive) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(Error::OpenFailed {
                path: archive.to_path_buf(),
                source,
            }
            .into())
        }
    }
    File::create(archive).map_err(|source| Error::OpenFailed {
        path: archive.to_path_buf(),
        source,
    })?;

    let abort = AbortSignal::new();
    let (work_tx, work_rx) = crossbeam_channel::bounded::<WorkItem>(opts.nthreads * 4);
    let (err_tx, err_rx) = crossbeam_channel::bounded::<Error>(opts.nthreads);

    let pool = ThreadPoolBuilder::new()
        .num_threads(opts.nthreads)
        .thread_name(|index| format!("ptar-writer-{index}"))
        .build()
        .context("failed to create writer pool")?;

    for _ in 0..opts.nthreads {
        let worker_rx = work_rx.clone();
        let worker_err = err_tx.clone();
        let worker_abort = abort.clone();
        let path = archive.to_path_buf();
        let chunk_size = opts.chunk_size();
        let verbose = opts.verbose;
        pool.spawn(move || {
            writer_worker(path, worker_rx, worker_err, worker_abort, chunk_size, verbose)
        });
    }
    drop(work_rx);
    drop(err_tx);

    let plan_result = plan::plan_roots(roots, |item| {
        if abort.is_set() {
            return Err(pipeline_error(archive, ErrorKind::Interrupted, "archiving aborted"));
        }
        work_tx
            .send(item)
            .map_err(|_| pipeline_error(archive, ErrorKind::BrokenPipe, "writer pool shut down"))
    });

    drop(work_tx);
    // Joins the workers before the outcome is examined.
    drop(pool);

    // Prefer the first worker failure over the planner's.
    if let Ok(err) = err_rx.try_recv() {
        return Err(err.into());
    }
    let offsets = plan_result?;

    let mut out = OpenOptions::new()
        .append(true)
        .open(archive)
        .map_err(|source| Error::OpenFailed {
            path: archive.to_path_buf(),
            source,
        })?;
    let write_err = |source| Error::WriteFailed {
        path: archive.to_path_buf(),
        source,
    };
    out.write_all(&ZERO_BLOCK).map_err(write_err)?;
    out.write_all(&ZERO_BLOCK).map_err(write_err)?;
    out.write_all(&trailer::encode(&offsets)).map_err(write_err)?;

    debug!(entries = offsets.len(), "archive complete");
    Ok(())
}

fn pipeline_error(archive: &Path, kind: ErrorKind, message: &str) -> Error {
    Error::WriteFailed {
        path: archive.to_path_buf(),
        source: std::io::Error::new(kind, message.to_string()),
    }
}

fn writer_worker(
    archive: PathBuf,
    work_rx: Receiver<WorkItem>,
    err_tx: Sender<Error>,
    abort: AbortSignal,
    chunk_size: usize,
    verbose: bool,
) {
    let mut out: Option<File> = None;
    let mut buf = vec![0u8; chunk_size];
    for item in work_rx.iter() {
        if abort.is_set() {
            break;
        }
        let file = match &mut out {
            Some(file) => file,
            slot => {
                let opened = match OpenOptions::new().read(true).write(true).open(&archive) {
                    Ok(file) => file,
                    Err(source) => {
                        abort.request();
                        let _ = err_tx.send(Error::OpenFailed {
                            path: archive,
                            source,
                        });
                        return;
                    }
                };
                slot.insert(opened)
            }
        };
        if let Err(err) = write_entry(file, &archive, &item, &mut buf) {
            abort.request();
            let _ = err_tx.send(err);
            return;
        }
        if verbose {
            println!("{}", item.header.name);
        }
    }
}

fn write_entry(out: &mut File, archive: &Path, item: &WorkItem, buf: &mut [u8]) -> Result<()> {
    let block = item.header.encode()?;
    out.seek(SeekFrom::Start(item.offset))
        .map_err(|source| Error::SeekFailed {
            path: archive.to_path_buf(),
            offset: item.offset,
            source,
        })?;
    out.write_all(&block).map_err(|source| Error::WriteFailed {
        path: archive.to_path_buf(),
        source,
    })?;
    if item.header.kind != Kind::Regular {
        return Ok(());
    }

    let mut src = File::open(&item.src).map_err(|source| Error::OpenFailed {
        path: item.src.clone(),
        source,
    })?;
    let mut remaining = item.header.size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = src
            .read(&mut buf[..want])
            .map_err(|source| Error::ReadFailed {
                path: item.src.clone(),
                source,
            })?;
        if got == 0 {
            return Err(Error::ReadFailed {
                path: item.src.clone(),
                source: std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "source file shrank during archiving",
                ),
            });
        }
        out.write_all(&buf[..got])
            .map_err(|source| Error::WriteFailed {
                path: archive.to_path_buf(),
                source,
            })?;
        remaining -= got as u64;
    }
    let pad = pad_len(item.header.size) as usize;
    if pad > 0 {
        out.write_all(&ZERO_BLOCK[..pad])
            .map_err(|source| Error::WriteFailed {
                path: archive.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}
