//! Shared scaffolding for tests that archive and extract relative
//! paths, which means they have to own the process working directory.

use std::env;
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;

static CWD_LOCK: Mutex<()> = Mutex::new(());

/// Serializes working-directory-dependent tests and parks the process
/// in a fresh scratch directory until the returned guard drops.
pub fn scratch() -> (MutexGuard<'static, ()>, TempDir) {
    let guard = CWD_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let dir = tempfile::tempdir().expect("create scratch dir");
    env::set_current_dir(dir.path()).expect("enter scratch dir");
    (guard, dir)
}
