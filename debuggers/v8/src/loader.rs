//! Value loader
//!
//! Per session cache of value mirrors keyed by handle. Handles are looked up on the
//! VM when they are missing, and every `refs` entry a response carries is added to the
//! cache on the way.

use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::Mutex;

use chromedbg_core::{Error, Result};

use crate::commands::{DebuggerCommand, LookupArgs};
use crate::connection::V8Connection;
use crate::protocol::{SuccessCommandResponse, ValueHandle};
use crate::value::{merge, ValueMirror};

#[derive(Debug)]
pub struct ValueLoader {
    cache: Mutex<HashMap<i64, ValueMirror>>,
    max_string_length: i64,
}

impl ValueLoader {
    pub fn new(max_string_length: i64) -> Self {
        ValueLoader {
            cache: Mutex::new(HashMap::new()),
            max_string_length,
        }
    }

    pub fn clear_caches(&self) {
        self.cache.lock().clear();
    }

    pub fn cached(&self, handle: i64) -> Option<ValueMirror> {
        self.cache.lock().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Put a mirror in the cache, merging with what is there already
    pub fn add_mirror(&self, mirror: ValueMirror) -> ValueMirror {
        let mut cache = self.cache.lock();
        let merged = match cache.get(&mirror.handle()) {
            Some(cached) => merge(cached, &mirror),
            None => mirror,
        };
        cache.insert(merged.handle(), merged.clone());
        merged
    }

    pub fn add_handle(&self, handle: &ValueHandle) -> Result<ValueMirror> {
        Ok(self.add_mirror(ValueMirror::from_handle(handle)?))
    }

    /// Cache every handle in the `refs` of a response
    pub fn add_refs(&self, response: &SuccessCommandResponse) {
        let refs = match response.refs() {
            Ok(refs) => refs,
            Err(e) => {
                warn!("Ignoring malformed refs: {}", e);
                return;
            }
        };

        for handle in refs.iter() {
            if let Err(e) = self.add_handle(handle) {
                warn!("Ignoring malformed ref {}: {}", handle.handle(), e);
            }
        }
    }

    async fn lookup(
        &self,
        connection: &V8Connection,
        handles: Vec<i64>,
        max_string_length: i64,
    ) -> Result<Vec<ValueMirror>> {
        debug!("Looking up handles {:?}", handles);

        let command = DebuggerCommand::lookup(&LookupArgs::new(handles, max_string_length))?;
        let response = connection.call(&command, Ok).await?;
        self.add_refs(&response);

        response
            .body_map::<ValueHandle>()?
            .iter()
            .map(|(_, handle)| ValueMirror::from_handle(handle).map_err(Error::from))
            .collect()
    }

    /// The mirror for `handle`, asking the VM if it isn't cached
    pub async fn resolve(&self, connection: &V8Connection, handle: i64) -> Result<ValueMirror> {
        if let Some(mirror) = self.cached(handle) {
            return Ok(mirror);
        }

        for mirror in self
            .lookup(connection, vec![handle], self.max_string_length)
            .await?
        {
            self.add_mirror(mirror);
        }

        self.cached(handle)
            .ok_or_else(|| Error::InvalidState(format!("VM returned no value for handle {}", handle)))
    }

    /// Resolve several handles with at most one lookup
    pub async fn resolve_all(
        &self,
        connection: &V8Connection,
        handles: &[i64],
    ) -> Result<Vec<ValueMirror>> {
        let missing: Vec<i64> = handles
            .iter()
            .copied()
            .filter(|h| self.cached(*h).is_none())
            .collect();

        if !missing.is_empty() {
            for mirror in self
                .lookup(connection, missing, self.max_string_length)
                .await?
            {
                self.add_mirror(mirror);
            }
        }

        handles
            .iter()
            .map(|h| {
                self.cached(*h).ok_or_else(|| {
                    Error::InvalidState(format!("VM returned no value for handle {}", h))
                })
            })
            .collect()
    }

    /// Named children of `mirror`, loading its property list and any child not
    /// known yet
    pub async fn properties(
        &self,
        connection: &V8Connection,
        mirror: &ValueMirror,
    ) -> Result<Vec<(String, ValueMirror)>> {
        let mirror = if mirror.has_properties() {
            mirror.clone()
        } else {
            for loaded in self
                .lookup(connection, vec![mirror.handle()], self.max_string_length)
                .await?
            {
                self.add_mirror(loaded);
            }
            match self.cached(mirror.handle()) {
                Some(loaded) if loaded.has_properties() => loaded,
                _ => return Ok(vec![]),
            }
        };

        let properties = mirror.properties().unwrap_or(&[]);

        // Inline display data is enough for a first view of the child
        for property in properties {
            if self.cached(property.handle).is_none() {
                if let Some(display) = &property.display {
                    self.add_mirror(ValueMirror::from_reference(property.handle, display));
                }
            }
        }

        let handles: Vec<i64> = properties.iter().map(|p| p.handle).collect();
        let children = self.resolve_all(connection, &handles).await?;

        Ok(properties
            .iter()
            .map(|p| p.name.clone())
            .zip(children)
            .collect())
    }

    /// Fetch more of a truncated string, returns whether anything new was loaded
    pub async fn reload_heavy_value(
        &self,
        connection: &V8Connection,
        mirror: &ValueMirror,
    ) -> Result<bool> {
        let string = mirror.string();
        if !string.needs_reload() {
            return Ok(false);
        }

        let size = string.reload_size() as i64;
        let reloaded = self.lookup(connection, vec![mirror.handle()], size).await?;

        let mut updated = false;
        for fresh in reloaded.iter().filter(|m| m.handle() == mirror.handle()) {
            let total = fresh.string().total_length();
            updated |= string.update(&fresh.display_string(), total);
        }
        Ok(updated)
    }
}
