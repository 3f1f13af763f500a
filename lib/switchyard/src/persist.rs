// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-datapath configuration storage.
//!
//! Managers store their configuration as JSON documents, one per
//! (datapath, model) pair, and replay them when the datapath connects.

use crate::sync::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use switchyard_api::Dpid;

/// Routes, as a [`switchyard_api::RoutingManagerContext`].
pub const MODEL_ROUTE: &str = "route";

/// Network addresses, as a [`switchyard_api::NetworkManagerContext`].
pub const MODEL_NETWORK: &str = "network";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed store {path}: top level is not an object")]
    Malformed { path: String },
}

pub trait Persister: Send + Sync {
    fn load(
        &self,
        dpid: Dpid,
        model: &str,
    ) -> Result<Option<Value>, PersistError>;

    fn store(
        &self,
        dpid: Dpid,
        model: &str,
        value: Value,
    ) -> Result<(), PersistError>;
}

pub fn load_as<T: DeserializeOwned>(
    p: &dyn Persister,
    dpid: Dpid,
    model: &str,
) -> Result<Option<T>, PersistError> {
    match p.load(dpid, model)? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub fn store_as<T: Serialize>(
    p: &dyn Persister,
    dpid: Dpid,
    model: &str,
    val: &T,
) -> Result<(), PersistError> {
    p.store(dpid, model, serde_json::to_value(val)?)
}

#[derive(Default)]
pub struct MemoryPersister {
    docs: Mutex<BTreeMap<(Dpid, String), Value>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn load(&self, dpid: Dpid, model: &str) -> Result<Option<Value>, PersistError> {
        Ok(self.docs.lock().get(&(dpid, model.to_string())).cloned())
    }

    fn store(&self, dpid: Dpid, model: &str, value: Value) -> Result<(), PersistError> {
        self.docs.lock().insert((dpid, model.to_string()), value);
        Ok(())
    }
}

/// One JSON file per datapath under a state directory, holding an
/// object keyed by model.
pub struct JsonFilePersister {
    dir: PathBuf,
    // Serializes read-modify-write of a file.
    lock: Mutex<()>,
}

impl JsonFilePersister {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    fn path(&self, dpid: Dpid) -> PathBuf {
        self.dir.join(format!("{:016x}.json", dpid.val()))
    }

    fn read(&self, path: &Path) -> Result<Map<String, Value>, PersistError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Map::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes)? {
            Value::Object(m) => Ok(m),
            _ => Err(PersistError::Malformed { path: path.display().to_string() }),
        }
    }
}

impl Persister for JsonFilePersister {
    fn load(&self, dpid: Dpid, model: &str) -> Result<Option<Value>, PersistError> {
        let _guard = self.lock.lock();
        Ok(self.read(&self.path(dpid))?.remove(model))
    }

    fn store(&self, dpid: Dpid, model: &str, value: Value) -> Result<(), PersistError> {
        let _guard = self.lock.lock();
        let path = self.path(dpid);
        let mut doc = self.read(&path)?;
        doc.insert(model.to_string(), value);

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&Value::Object(doc))?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
