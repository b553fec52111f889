//! Extract path: the trailer index fans tasks out by offset to a pool
//! of workers with independent read-only handles. Links are staged and
//! applied serially once every content worker has joined, so their
//! targets always exist. Archives without the trailer are handed to
//! the host tar.

use std::fs::{self, File, Permissions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use filetime::FileTime;
use rayon::ThreadPoolBuilder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::header::{Header, Kind, BLOCK_SIZE};
use crate::trailer;
use crate::{AbortSignal, Options};

/// Link staged during extraction, applied after all content workers join.
struct DeferredLink {
    symbolic: bool,
    target: String,
    link: String,
}

pub fn extract_archive(archive: &Path, opts: &Options) -> anyhow::Result<()> {
    let mut input = File::open(archive).map_err(|source| Error::OpenFailed {
        path: archive.to_path_buf(),
        source,
    })?;
    let offsets = match trailer::read_offsets(&mut input, archive) {
        Ok(offsets) => offsets,
        Err(Error::NotAPtarArchive) => return fallback_tar(archive, opts.verbose),
        Err(err) => return Err(err.into()),
    };
    drop(input);
    debug!(entries = offsets.len(), "trailer index loaded");

    let abort = AbortSignal::new();
    let (task_tx, task_rx) = crossbeam_channel::bounded::<u64>(opts.nthreads * 4);
    let (link_tx, link_rx) = crossbeam_channel::unbounded::<DeferredLink>();
    let (err_tx, err_rx) = crossbeam_channel::bounded::<Error>(opts.nthreads);

    let pool = ThreadPoolBuilder::new()
        .num_threads(opts.nthreads)
        .thread_name(|index| format!("ptar-extract-{index}"))
        .build()
        .context("failed to create extract pool")?;

    for _ in 0..opts.nthreads {
        let worker_rx = task_rx.clone();
        let worker_links = link_tx.clone();
        let worker_err = err_tx.clone();
        let worker_abort = abort.clone();
        let path = archive.to_path_buf();
        let chunk_size = opts.chunk_size();
        let verbose = opts.verbose;
        pool.spawn(move || {
            extract_worker(
                path,
                worker_rx,
                worker_links,
                worker_err,
                worker_abort,
                chunk_size,
                verbose,
            )
        });
    }
    drop(task_rx);
    drop(link_tx);
    drop(err_tx);

    for &offset in &offsets {
        if abort.is_set() || task_tx.send(offset).is_err() {
            break;
        }
    }
    drop(task_tx);
    // Joins the workers; every deferred link is in the channel afterwards.
    drop(pool);

    if let Ok(err) = err_rx.try_recv() {
        return Err(err.into());
    }

    let links: Vec<DeferredLink> = link_rx.into_iter().collect();
    debug!(links = links.len(), "content extracted, applying links");
    apply_deferred_links(&links)?;
    Ok(())
}

/// Replaces the process image with the host tar. Only returns on exec failure.
fn fallback_tar(archive: &Path, verbose: bool) -> anyhow::Result<()> {
    let flags = if verbose { "xfv" } else { "xf" };
    debug!(%flags, "no trailer magic, handing off to host tar");
    let err = Command::new("tar").arg(flags).arg(archive).exec();
    Err(anyhow::Error::new(err).context("failed to exec host tar"))
}

fn extract_worker(
    archive: PathBuf,
    task_rx: Receiver<u64>,
    link_tx: Sender<DeferredLink>,
    err_tx: Sender<Error>,
    abort: AbortSignal,
    chunk_size: usize,
    verbose: bool,
) {
    let mut input: Option<File> = None;
    let mut buf = vec![0u8; chunk_size];
    for offset in task_rx.iter() {
        if abort.is_set() {
            break;
        }
        let file = match &mut input {
            Some(file) => file,
            slot => {
                let opened = match File::open(&archive) {
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
        match extract_entry(file, &archive, offset, &mut buf) {
            Ok((header, deferred)) => {
                if let Some(record) = deferred {
                    if link_tx.send(record).is_err() {
                        break;
                    }
                }
                if verbose {
                    println!("{}", header.name);
                }
            }
            Err(err) => {
                abort.request();
                let _ = err_tx.send(err);
                return;
            }
        }
    }
}

fn extract_entry(
    input: &mut File,
    archive: &Path,
    offset: u64,
    buf: &mut [u8],
) -> Result<(Header, Option<DeferredLink>)> {
    input
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::SeekFailed {
            path: archive.to_path_buf(),
            offset,
            source,
        })?;
    let mut block = [0u8; BLOCK_SIZE];
    input
        .read_exact(&mut block)
        .map_err(|source| Error::ReadFailed {
            path: archive.to_path_buf(),
            source,
        })?;
    let header = Header::decode(&block, offset)?;

    let dest = Path::new(&header.name);
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            // Races with sibling workers are fine: pre-existence is not an error.
            fs::create_dir_all(parent).map_err(|source| Error::WriteFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    match header.kind {
        Kind::Directory => {
            fs::create_dir_all(dest).map_err(|source| Error::WriteFailed {
                path: dest.to_path_buf(),
                source,
            })?;
            restore_metadata(dest, &header)?;
            Ok((header, None))
        }
        Kind::HardLink | Kind::Symlink => {
            let record = DeferredLink {
                symbolic: header.kind == Kind::Symlink,
                target: header.link_target.clone(),
                link: header.name.clone(),
            };
            Ok((header, Some(record)))
        }
        Kind::Regular => {
            let mut out = File::create(dest).map_err(|source| Error::OpenFailed {
                path: dest.to_path_buf(),
                source,
            })?;
            let mut remaining = header.size;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let got = input
                    .read(&mut buf[..want])
                    .map_err(|source| Error::ReadFailed {
                        path: archive.to_path_buf(),
                        source,
                    })?;
                if got == 0 {
                    return Err(Error::ReadFailed {
                        path: archive.to_path_buf(),
                        source: std::io::Error::new(ErrorKind::UnexpectedEof, "archive truncated"),
                    });
                }
                out.write_all(&buf[..got])
                    .map_err(|source| Error::WriteFailed {
                        path: dest.to_path_buf(),
                        source,
                    })?;
                remaining -= got as u64;
            }
            drop(out);
            restore_metadata(dest, &header)?;
            Ok((header, None))
        }
    }
}

fn restore_metadata(path: &Path, header: &Header) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(header.mode)).map_err(|source| {
        Error::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })?;
    filetime::set_file_mtime(path, FileTime::from_unix_time(header.mtime as i64, 0)).map_err(
        |source| Error::WriteFailed {
            path: path.to_path_buf(),
            source,
        },
    )
}

fn apply_deferred_links(links: &[DeferredLink]) -> Result<()> {
    for record in links {
        let result = if record.symbolic {
            symlink(&record.target, &record.link)
        } else {
            fs::hard_link(&record.target, &record.link)
        };
        result.map_err(|source| Error::WriteFailed {
            path: PathBuf::from(&record.link),
            source,
        })?;
    }
    Ok(())
}
