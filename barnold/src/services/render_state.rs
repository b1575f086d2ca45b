use crate::models::error::IprError;
use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

const RUNNING: u32 = 0;
const ABORT: u32 = 1;

fn state_path(session: &Uuid) -> PathBuf {
    std::env::temp_dir().join(format!("barnold/ipr/{session}.state"))
}

/// Cross-process render state flag. `RUNNING` until `abort()` flips it to
/// `ABORT`, exactly once, never back: the transition is terminal for the
/// worker process's life. Lives in a 4-byte mapped file so both processes
/// observe it with real atomics, not plain memory.
pub struct RenderState {
    map: MmapMut,
}

impl RenderState {
    pub fn create(session: &Uuid) -> Result<Self, IprError> {
        let path = state_path(session);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| IprError::Resource(format!("state directory: {e}")))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| IprError::Resource(format!("state flag {session}: {e}")))?;
        // zero-filled, so the flag starts out RUNNING
        file.set_len(std::mem::size_of::<u32>() as u64)
            .map_err(|e| IprError::Resource(format!("state flag {session}: {e}")))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| IprError::Resource(format!("state flag {session}: {e}")))?;
        Ok(RenderState { map })
    }

    pub fn open(session: &Uuid) -> Result<Self, IprError> {
        let path = state_path(session);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| IprError::Resource(format!("state flag {session}: {e}")))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| IprError::Resource(format!("state flag {session}: {e}")))?;
        Ok(RenderState { map })
    }

    fn cell(&self) -> &AtomicU32 {
        // Sound: the mapping is page-aligned, at least 4 bytes long, and
        // both processes only ever touch it through AtomicU32.
        unsafe { &*self.map.as_ptr().cast::<AtomicU32>() }
    }

    pub fn abort(&self) {
        self.cell().store(ABORT, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.cell().load(Ordering::SeqCst) == ABORT
    }

    pub fn remove_backing(session: &Uuid) -> io::Result<()> {
        fs::remove_file(state_path(session))
    }
}
