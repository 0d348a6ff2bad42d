//! Disk-backed id counters shared across translation units.
//!
//! One pass invocation owns the counter files exclusively; the build
//! system serializes invocations. Counters are never rolled back: a crash
//! mid-pass leaves them advanced, which keeps ids unique.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{FunctionId, Id, StmtId};

pub const ID_COUNT_FILE: &str = "idcount";
pub const STMT_COUNT_FILE: &str = "stmtcount";
pub const FUN_COUNT_FILE: &str = "funcount";

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot write counter file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct Counters {
    dir: PathBuf,
    id: Id,
    stmt: StmtId,
    fun: FunctionId,
}

fn read_counter<T: std::str::FromStr + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(text) => text.trim().parse().unwrap_or_else(|_| {
            log::warn!("malformed counter file {}, starting from zero", path.display());
            T::default()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            log::warn!(
                "cannot read counter file {}: {}, starting from zero",
                path.display(),
                e
            );
            T::default()
        }
    }
}

fn write_counter(path: &Path, value: impl std::fmt::Display) -> Result<(), Error> {
    fs::write(path, format!("{}\n", value)).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl Counters {
    /// Read all three counters; a missing or unreadable file counts from
    /// zero.
    pub fn load(dir: &Path) -> Counters {
        Counters {
            dir: dir.to_path_buf(),
            id: read_counter(&dir.join(ID_COUNT_FILE)),
            stmt: read_counter(&dir.join(STMT_COUNT_FILE)),
            fun: read_counter(&dir.join(FUN_COUNT_FILE)),
        }
    }

    /// Overwrite the counter files with the advanced values. Failure here
    /// is fatal: losing the counters would recycle ids in the next unit.
    pub fn save(&self) -> Result<(), Error> {
        write_counter(&self.dir.join(ID_COUNT_FILE), self.id)?;
        write_counter(&self.dir.join(STMT_COUNT_FILE), self.stmt)?;
        write_counter(&self.dir.join(FUN_COUNT_FILE), self.fun)?;
        Ok(())
    }

    pub fn next_id(&mut self) -> Id {
        self.id += 1;
        self.id
    }

    pub fn next_stmt(&mut self) -> StmtId {
        self.stmt += 1;
        self.stmt
    }

    pub fn next_fun(&mut self) -> FunctionId {
        self.fun += 1;
        self.fun
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn stmt(&self) -> StmtId {
        self.stmt
    }

    pub fn fun(&self) -> FunctionId {
        self.fun
    }
}
