use crate::repository::{RepositoryError, RepositoryState, StateStore};
use std::sync::Mutex;

/// An issue store that lives in the memory of one process.
///
/// Usable only when every job runs in the controller process.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RepositoryState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl StateStore for MemoryRepository {
    fn read<R>(&self, f: impl FnOnce(&RepositoryState) -> R) -> Result<R, RepositoryError> {
        Ok(f(&self.state.lock().unwrap_or_else(|p| p.into_inner())))
    }

    fn write<R>(&self, f: impl FnOnce(&mut RepositoryState) -> R) -> Result<R, RepositoryError> {
        Ok(f(&mut self.state.lock().unwrap_or_else(|p| p.into_inner())))
    }
}
