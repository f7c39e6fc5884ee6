//! Process-wide working-directory coordination.
//!
//! The process has exactly one current directory, but pipeline
//! construction needs it pointed at the source file's parent so that
//! helper files resolve relatively. A [`CwdGuard`] nominates a directory:
//! acquisition blocks until either no guard is live or every live guard
//! nominated the same directory, and the last guard dropped restores the
//! directory that was current before the first one switched.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

struct CwdState {
    holders: u32,
    nominated: Option<PathBuf>,
    saved: Option<PathBuf>,
}

static STATE: Mutex<CwdState> = Mutex::new(CwdState {
    holders: 0,
    nominated: None,
    saved: None,
});
static CHANGED: Condvar = Condvar::new();

/// Scoped hold on the process working directory.
///
/// While any guard is live the process cwd equals the nominated directory;
/// dropping the last guard restores the previous cwd and wakes waiters
/// that nominated something else.
#[derive(Debug)]
pub struct CwdGuard(());

impl CwdGuard {
    /// Switch the process working directory to `path`, blocking while
    /// other guards hold a different directory.
    pub fn enter(path: &Path) -> io::Result<CwdGuard> {
        let mut state = STATE.lock().unwrap();
        while state.holders > 0 && state.nominated.as_deref() != Some(path) {
            state = CHANGED.wait(state).unwrap();
        }
        if state.holders == 0 {
            let saved = env::current_dir()?;
            env::set_current_dir(path)?;
            state.nominated = Some(path.to_path_buf());
            state.saved = Some(saved);
        }
        state.holders += 1;
        Ok(CwdGuard(()))
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let mut state = STATE.lock().unwrap();
        state.holders -= 1;
        if state.holders == 0 {
            if let Some(saved) = state.saved.take() {
                if let Err(error) = env::set_current_dir(&saved) {
                    tracing::warn!(?saved, %error, "failed to restore working directory");
                }
            }
            state.nominated = None;
            CHANGED.notify_all();
        }
    }
}
