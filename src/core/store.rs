//! Purpose: Persist the guest cart blob for one origin directory.
//! Exports: `LocalCartStore`, `ReadOutcome`, `GUEST_CART_KEY`.
//! Role: Leaf storage layer; reads are synchronous and infallible.
//! Invariants: Writes replace the whole blob via temp file + rename; readers never see torn blobs.
//! Invariants: Read-modify-write cycles hold an exclusive lock on a sidecar lock file.
//! Invariants: Missing or malformed blobs read as the empty cart; logging is the caller's job.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;

use crate::core::cart::LocalCart;
use crate::core::error::{Error, ErrorKind, map_io_error_kind};

pub const GUEST_CART_KEY: &str = "guest_cart";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    Missing,
    Loaded(LocalCart),
    Corrupt { reason: String },
}

impl ReadOutcome {
    /// The count the reconciler consumes: the stored total, or 0 when nothing usable exists.
    pub fn total_items(&self) -> u64 {
        match self {
            ReadOutcome::Loaded(cart) => cart.total_items,
            ReadOutcome::Missing | ReadOutcome::Corrupt { .. } => 0,
        }
    }

    pub fn into_cart(self) -> LocalCart {
        match self {
            ReadOutcome::Loaded(cart) => cart,
            ReadOutcome::Missing | ReadOutcome::Corrupt { .. } => LocalCart::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalCartStore {
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
}

impl LocalCartStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(format!("{GUEST_CART_KEY}.json"));
        let lock_path = dir.join(format!("{GUEST_CART_KEY}.lock"));
        Self {
            dir,
            path,
            lock_path,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> ReadOutcome {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return ReadOutcome::Missing,
            Err(err) => {
                return ReadOutcome::Corrupt {
                    reason: format!("read failed: {err}"),
                };
            }
        };
        match serde_json::from_slice::<LocalCart>(&bytes) {
            Ok(cart) => ReadOutcome::Loaded(cart),
            Err(err) => ReadOutcome::Corrupt {
                reason: format!("invalid guest cart json: {err}"),
            },
        }
    }

    /// Replaces the blob. The written total is always recomputed from the items.
    pub fn write(&self, cart: &LocalCart) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.write_unlocked(cart)
    }

    /// Read-modify-write under the store lock; returns the cart as written.
    pub fn update<F>(&self, mutate: F) -> Result<LocalCart, Error>
    where
        F: FnOnce(&mut LocalCart),
    {
        let _lock = self.lock()?;
        let mut cart = self.read().into_cart();
        mutate(&mut cart);
        cart.normalize();
        self.write_unlocked(&cart)?;
        Ok(cart)
    }

    /// Like `update`, but `mutate` reports whether it changed anything.
    /// Returns `None` and leaves the blob untouched when it did not.
    pub fn update_if<F>(&self, mutate: F) -> Result<Option<LocalCart>, Error>
    where
        F: FnOnce(&mut LocalCart) -> bool,
    {
        let _lock = self.lock()?;
        let mut cart = self.read().into_cart();
        if !mutate(&mut cart) {
            return Ok(None);
        }
        cart.normalize();
        self.write_unlocked(&cart)?;
        Ok(Some(cart))
    }

    /// Removes the blob; later reads report `Missing`.
    pub fn clear(&self) -> Result<(), Error> {
        let _lock = self.lock()?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(map_io_error_kind(&err))
                .with_message("failed to remove guest cart")
                .with_path(&self.path)
                .with_source(err)),
        }
    }

    fn write_unlocked(&self, cart: &LocalCart) -> Result<(), Error> {
        let mut cart = cart.clone();
        cart.normalize();
        let content = serde_json::to_vec(&cart).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode guest cart")
                .with_source(err)
        })?;

        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create temp guest cart")
                .with_path(&self.dir)
                .with_source(err)
        })?;
        let written = temp.write_all(&content).and_then(|()| temp.flush());
        if let Err(err) = written {
            return Err(Error::new(ErrorKind::Io)
                .with_message("failed to write temp guest cart")
                .with_path(temp.path())
                .with_source(err));
        }
        temp.persist(&self.path).map_err(|err| {
            Error::new(map_io_error_kind(&err.error))
                .with_message("failed to replace guest cart")
                .with_path(&self.path)
                .with_source(err.error)
        })?;
        Ok(())
    }

    fn lock(&self) -> Result<WriteLock, Error> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to create origin directory")
                .with_path(&self.dir)
                .with_source(err)
        })?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open guest cart lock")
                    .with_path(&self.lock_path)
                    .with_source(err)
            })?;
        file.lock_exclusive().map_err(|err| {
            Error::new(map_io_error_kind(&err))
                .with_message("failed to lock guest cart")
                .with_path(&self.lock_path)
                .with_source(err)
        })?;
        Ok(WriteLock { file })
    }
}

struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
