//! Create-side planning. One serial walk stats every entry, detects
//! hard links, and assigns each entry its byte offset in the output, so
//! the writer workers never have to coordinate with each other.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::header::{pad_len, Header, Kind, BLOCK_SIZE, MAX_SIZE, NAME_LEN};

/// One entry's planning output, consumed by exactly one writer.
pub struct WorkItem {
    pub src: PathBuf,
    pub header: Header,
    pub offset: u64,
}

#[derive(Default)]
struct Planner {
    next_offset: u64,
    offsets: Vec<u64>,
    links: HashMap<(u64, u64), String>,
}

/// Walks the roots in order and hands each entry to `emit` as soon as
/// its offset is fixed. Returns the offsets in emission order.
pub fn plan_roots<F>(roots: &[PathBuf], mut emit: F) -> Result<Vec<u64>>
where
    F: FnMut(WorkItem) -> Result<()>,
{
    let mut planner = Planner::default();
    for root in roots {
        let meta = root.symlink_metadata().map_err(|source| Error::StatFailed {
            path: root.clone(),
            source,
        })?;
        if meta.file_type().is_dir() {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = entry.map_err(walk_error)?;
                let meta = entry
                    .path()
                    .symlink_metadata()
                    .map_err(|source| Error::StatFailed {
                        path: entry.path().to_path_buf(),
                        source,
                    })?;
                planner.visit(entry.path(), &meta, &mut emit)?;
            }
        } else {
            planner.visit(root, &meta, &mut emit)?;
        }
    }
    debug!(
        entries = planner.offsets.len(),
        bytes = planner.next_offset,
        "planning complete"
    );
    Ok(planner.offsets)
}

fn walk_error(err: walkdir::Error) -> Error {
    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
    Error::StatFailed {
        path,
        source: err.into(),
    }
}

impl Planner {
    fn visit<F>(&mut self, path: &Path, meta: &fs::Metadata, emit: &mut F) -> Result<()>
    where
        F: FnMut(WorkItem) -> Result<()>,
    {
        let file_type = meta.file_type();
        let name = stored_name(path, file_type.is_dir())?;

        let (kind, size, link_target) = if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|source| Error::StatFailed {
                path: path.to_path_buf(),
                source,
            })?;
            let target = match target.to_str() {
                Some(target) if target.is_ascii() => target.to_owned(),
                _ => return Err(Error::BadName(target)),
            };
            if target.len() > NAME_LEN {
                return Err(Error::LinkTooLong(target));
            }
            (Kind::Symlink, 0, target)
        } else if file_type.is_dir() {
            (Kind::Directory, 0, String::new())
        } else if file_type.is_file() {
            if meta.len() >= MAX_SIZE {
                return Err(Error::SizeOverflow {
                    path: path.to_path_buf(),
                    size: meta.len(),
                });
            }
            // First name seen for an inode is archived whole; later
            // names become hard links back to it.
            match self.links.entry((meta.dev(), meta.ino())) {
                MapEntry::Occupied(first) => (Kind::HardLink, 0, first.get().clone()),
                MapEntry::Vacant(slot) => {
                    slot.insert(name.clone());
                    (Kind::Regular, meta.len(), String::new())
                }
            }
        } else {
            return Err(Error::UnsupportedFileType(path.to_path_buf()));
        };

        let header = Header {
            name,
            mode: meta.mode() & 0o777,
            uid: meta.uid(),
            gid: meta.gid(),
            size,
            mtime: meta.mtime().max(0) as u64,
            kind,
            link_target,
        };

        let offset = self.next_offset;
        self.offsets.push(offset);
        self.next_offset += BLOCK_SIZE as u64;
        if kind == Kind::Regular {
            self.next_offset += size + pad_len(size);
        }

        emit(WorkItem {
            src: path.to_path_buf(),
            header,
            offset,
        })
    }
}

fn stored_name(path: &Path, is_dir: bool) -> Result<String> {
    let raw = match path.to_str() {
        Some(raw) if raw.is_ascii() => raw,
        _ => return Err(Error::BadName(path.to_path_buf())),
    };
    let name = if is_dir && !raw.ends_with('/') {
        format!("{raw}/")
    } else {
        raw.to_owned()
    };
    if name.len() > NAME_LEN {
        return Err(Error::NameTooLong(name));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn collect(roots: &[PathBuf]) -> Result<(Vec<WorkItem>, Vec<u64>)> {
        let mut items = Vec::new();
        let offsets = plan_roots(roots, |item| {
            items.push(item);
            Ok(())
        })?;
        Ok((items, offsets))
    }

    #[test]
    fn offsets_are_contiguous_spans() {
        let dir = tempfile::tempdir().unwrap();
        let mut roots = Vec::new();
        for (name, size) in [("f0", 0usize), ("f1", 1), ("f2", 512)] {
            let path = dir.path().join(name);
            File::create(&path)
                .unwrap()
                .write_all(&vec![b'x'; size])
                .unwrap();
            roots.push(path);
        }

        let (items, offsets) = collect(&roots).unwrap();
        // f0: header only. f1: header + one padded block. f2: header + block.
        assert_eq!(offsets, vec![0, 512, 1536]);
        assert_eq!(items.len(), 3);
        for (item, offset) in items.iter().zip(&offsets) {
            assert_eq!(item.offset, *offset);
            assert_eq!(item.header.kind, Kind::Regular);
        }
    }

    #[test]
    fn directory_walk_emits_root_first_with_slash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        File::create(root.join("inner"))
            .unwrap()
            .write_all(b"hi")
            .unwrap();

        let (items, offsets) = collect(&[root.clone()]).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(offsets.len(), 2);
        assert_eq!(items[0].header.kind, Kind::Directory);
        assert!(items[0].header.name.ends_with("tree/"));
        assert_eq!(items[0].header.size, 0);
        assert!(items[1].header.name.ends_with("tree/inner"));
        assert_eq!(items[1].offset, 512);
    }

    #[test]
    fn second_name_for_an_inode_becomes_a_hard_link() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a");
        let second = dir.path().join("b");
        File::create(&first).unwrap().write_all(b"hello").unwrap();
        fs::hard_link(&first, &second).unwrap();

        let (items, offsets) = collect(&[first.clone(), second]).unwrap();
        assert_eq!(items[0].header.kind, Kind::Regular);
        assert_eq!(items[1].header.kind, Kind::HardLink);
        assert_eq!(items[1].header.link_target, first.to_str().unwrap());
        assert_eq!(items[1].header.size, 0);
        // Link entries are header-only spans.
        assert_eq!(offsets, vec![0, 1024]);
    }

    #[test]
    fn symlink_is_planned_without_dereferencing() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("s");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();

        let (items, _) = collect(&[link]).unwrap();
        assert_eq!(items[0].header.kind, Kind::Symlink);
        assert_eq!(items[0].header.link_target, "target.txt");
        assert_eq!(items[0].header.size, 0);
    }

    #[test]
    fn oversized_name_aborts_planning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n".repeat(101));
        File::create(&path).unwrap();
        assert!(matches!(collect(&[path]), Err(Error::NameTooLong(_))));
    }

    #[test]
    fn missing_root_fails_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(matches!(collect(&[path]), Err(Error::StatFailed { .. })));
    }
}
