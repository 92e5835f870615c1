use crate::Store as St;
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store unavailable")]
    Unavailable,
}

/// In-memory store that survives the engine using it (so it can be handed to a restarted engine).
#[derive(Clone, Default)]
pub struct Store {
    data: Arc<Mutex<HashMap<Vec<u8>, Bytes>>>,
    unavailable: Arc<AtomicBool>,
}

impl Store {
    /// Make all reads and writes fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().unwrap().get(key).cloned()
    }
}

impl St for Store {
    type Error = Error;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Unavailable);
        }
        Ok(self.value(key))
    }

    async fn put(&mut self, key: &[u8], value: Bytes) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Unavailable);
        }
        self.data.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }
}
