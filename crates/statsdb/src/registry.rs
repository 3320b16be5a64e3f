//! The process-wide registry of named stats stores. Replication resolves
//! inbound `db_name`s through here, and the HTTP surface lists it.

use crate::{Error, StatsDb};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static! {
    static ref STORES: Mutex<HashMap<String, StatsDb>> = Mutex::new(HashMap::new());
}

/// Register a store under its name. Names are unique for the process
/// lifetime; stores are never torn down before exit.
pub fn register(db: StatsDb) -> Result<(), Error> {
    let mut stores = STORES.lock().unwrap();
    if stores.contains_key(db.name()) {
        return Err(Error::DuplicateStore(db.name().to_string()));
    }
    stores.insert(db.name().to_string(), db);
    Ok(())
}

pub fn lookup(name: &str) -> Option<StatsDb> {
    STORES.lock().unwrap().get(name).cloned()
}

pub fn names() -> Vec<String> {
    let mut names: Vec<_> = STORES.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}
