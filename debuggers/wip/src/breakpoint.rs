//! Breakpoints
//!
//! The inspector can't change a breakpoint in place. Local edits are staged and the
//! session flushes them by removing the breakpoint from the tab and setting it again.
//! A disabled breakpoint stays known locally but is not set in the tab.
//!
//! There is no ignore count in the protocol either, hits are skipped client side.

use indexmap::IndexMap;
use parking_lot::Mutex;

use chromedbg_core::{Error, Result};

use crate::protocol::{SetBreakpointByUrlResult, WipCommand};

/// Everything needed to create a breakpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub url: String,
    pub line: u64,
    pub column: Option<u64>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub ignore_count: u32,
}

impl BreakpointSpec {
    pub fn new(url: &str, line: u64) -> Self {
        BreakpointSpec {
            url: url.to_string(),
            line,
            column: None,
            enabled: true,
            condition: None,
            ignore_count: 0,
        }
    }

    pub fn set_command(&self) -> WipCommand {
        WipCommand::set_breakpoint_by_url(
            &self.url,
            self.line,
            self.column,
            self.condition.as_deref(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    id: u32,
    spec: BreakpointSpec,
    remote_id: Option<String>,
    locations: Vec<(String, u64)>,
    hits_to_skip: u32,
    dirty: bool,
}

impl Breakpoint {
    pub fn new(id: u32, spec: BreakpointSpec) -> Self {
        Breakpoint {
            id,
            hits_to_skip: spec.ignore_count,
            spec,
            remote_id: None,
            locations: vec![],
            dirty: false,
        }
    }

    /// Session-local number, stays the same when a flush recreates the breakpoint
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Id the tab knows the breakpoint by, `None` while it isn't set there
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.spec.url
    }

    pub fn line(&self) -> u64 {
        self.spec.line
    }

    pub fn column(&self) -> Option<u64> {
        self.spec.column
    }

    pub fn is_enabled(&self) -> bool {
        self.spec.enabled
    }

    pub fn condition(&self) -> Option<&str> {
        self.spec.condition.as_deref()
    }

    pub fn ignore_count(&self) -> u32 {
        self.spec.ignore_count
    }

    /// Script id and line of each place the breakpoint resolved to
    pub fn locations(&self) -> &[(String, u64)] {
        &self.locations
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.spec.enabled != enabled {
            self.spec.enabled = enabled;
            self.dirty = true;
        }
    }

    pub fn set_condition(&mut self, condition: Option<&str>) {
        let condition = condition.filter(|c| !c.is_empty()).map(String::from);
        if self.spec.condition != condition {
            self.spec.condition = condition;
            self.dirty = true;
        }
    }

    pub fn set_ignore_count(&mut self, ignore_count: u32) {
        if self.spec.ignore_count != ignore_count {
            self.spec.ignore_count = ignore_count;
            self.dirty = true;
        }
    }

    pub fn spec(&self) -> &BreakpointSpec {
        &self.spec
    }

    fn set_remote(&mut self, result: Option<&SetBreakpointByUrlResult>) {
        match result {
            Some(result) => {
                self.remote_id = Some(result.breakpoint_id().to_string());
                self.locations = result
                    .locations()
                    .iter()
                    .map(|l| (l.script_id().to_string(), l.line_number().max(0) as u64))
                    .collect();
            }
            None => {
                self.remote_id = None;
                self.locations.clear();
            }
        }
    }
}

/// Breakpoints of one session, in creation order
#[derive(Debug, Default)]
pub struct BreakpointManager {
    next_id: Mutex<u32>,
    breakpoints: Mutex<IndexMap<u32, Breakpoint>>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        BreakpointManager::default()
    }

    /// Record a breakpoint the tab has just set, `result` is `None` for a disabled one
    pub fn add(&self, spec: BreakpointSpec, result: Option<&SetBreakpointByUrlResult>) -> Breakpoint {
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            *next_id
        };

        let mut breakpoint = Breakpoint::new(id, spec);
        breakpoint.set_remote(result);
        self.breakpoints.lock().insert(id, breakpoint.clone());
        breakpoint
    }

    pub fn remove(&self, id: u32) -> Option<Breakpoint> {
        self.breakpoints.lock().shift_remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<Breakpoint> {
        self.breakpoints.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().values().cloned().collect()
    }

    /// Stage local edits to a breakpoint
    pub fn update<F>(&self, id: u32, edit: F) -> Result<Breakpoint>
    where
        F: FnOnce(&mut Breakpoint),
    {
        let mut breakpoints = self.breakpoints.lock();
        let breakpoint = breakpoints
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState(format!("no breakpoint {}", id)))?;
        edit(breakpoint);
        Ok(breakpoint.clone())
    }

    /// The old breakpoint is gone from the tab
    pub fn mark_removed(&self, id: u32) {
        if let Some(current) = self.breakpoints.lock().get_mut(&id) {
            current.set_remote(None);
        }
    }

    /// The tab has accepted `flushed`, clear the dirty flag unless edited since
    pub fn mark_flushed(&self, flushed: &Breakpoint, result: Option<&SetBreakpointByUrlResult>) {
        if let Some(current) = self.breakpoints.lock().get_mut(&flushed.id) {
            current.set_remote(result);
            current.hits_to_skip = flushed.spec.ignore_count;
            if current.spec == flushed.spec {
                current.dirty = false;
            }
        }
    }

    /// Count a pause at the given remote breakpoint ids
    ///
    /// True when every breakpoint hit still has hits to skip, in which case each of
    /// them uses one up and the pause should be resumed without reporting it.
    pub fn skip_hit(&self, remote_ids: &[String]) -> bool {
        if remote_ids.is_empty() {
            return false;
        }

        let mut breakpoints = self.breakpoints.lock();
        let mut hit: Vec<&mut Breakpoint> = breakpoints
            .values_mut()
            .filter(|b| {
                b.remote_id
                    .as_ref()
                    .map_or(false, |id| remote_ids.contains(id))
            })
            .collect();

        if hit.len() != remote_ids.len() || hit.iter().any(|b| b.hits_to_skip == 0) {
            return false;
        }
        for breakpoint in hit.iter_mut() {
            breakpoint.hits_to_skip -= 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use chromedbg_core::parser::ProtocolType;

    use crate::protocol::SetBreakpointByUrlResult;

    use super::{BreakpointManager, BreakpointSpec};

    fn set_result(id: &str) -> SetBreakpointByUrlResult {
        SetBreakpointByUrlResult::parse(json!({
            "breakpointId": id,
            "locations": [{"scriptId": "31", "lineNumber": 4, "columnNumber": 0}]
        }))
        .unwrap()
    }

    #[test]
    fn check_staged_edits() {
        let manager = BreakpointManager::new();
        let breakpoint = manager.add(BreakpointSpec::new("app.js", 4), Some(&set_result("bp1")));
        assert_eq!(breakpoint.id(), 1);
        assert_eq!(breakpoint.remote_id(), Some("bp1"));
        assert_eq!(breakpoint.locations(), &[("31".to_string(), 4)]);
        assert!(!breakpoint.is_dirty());

        let staged = manager
            .update(1, |b| {
                b.set_enabled(true);
                b.set_condition(Some(""));
            })
            .unwrap();
        assert!(!staged.is_dirty());

        let staged = manager
            .update(1, |b| {
                b.set_condition(Some("i == 3"));
                b.set_ignore_count(2);
            })
            .unwrap();
        assert!(staged.is_dirty());
        assert_eq!(
            staged.spec().set_command().params(),
            &json!({"url": "app.js", "lineNumber": 4, "condition": "i == 3"})
        );

        assert!(manager.update(9, |_| {}).is_err());
    }

    #[test]
    fn check_flush_tracking() {
        let manager = BreakpointManager::new();
        manager.add(BreakpointSpec::new("app.js", 4), Some(&set_result("bp1")));

        let staged = manager.update(1, |b| b.set_enabled(false)).unwrap();
        manager.mark_removed(1);
        assert_eq!(manager.get(1).unwrap().remote_id(), None);
        assert!(manager.get(1).unwrap().locations().is_empty());

        // Edited again before the first flush was acknowledged
        manager.update(1, |b| b.set_condition(Some("x"))).unwrap();
        manager.mark_flushed(&staged, None);
        assert!(manager.get(1).unwrap().is_dirty());

        let staged = manager.update(1, |b| b.set_enabled(true)).unwrap();
        manager.mark_flushed(&staged, Some(&set_result("bp2")));
        let flushed = manager.get(1).unwrap();
        assert!(!flushed.is_dirty());
        assert_eq!(flushed.id(), 1);
        assert_eq!(flushed.remote_id(), Some("bp2"));

        assert!(manager.remove(1).is_some());
        assert!(manager.all().is_empty());
    }

    #[test]
    fn check_ignore_count_skips_hits() {
        let manager = BreakpointManager::new();
        let mut spec = BreakpointSpec::new("app.js", 4);
        spec.ignore_count = 2;
        manager.add(spec, Some(&set_result("bp1")));
        manager.add(BreakpointSpec::new("app.js", 9), Some(&set_result("bp2")));

        assert!(!manager.skip_hit(&[]));
        assert!(!manager.skip_hit(&["bp2".to_string()]));
        assert!(!manager.skip_hit(&["bp1".to_string(), "bp2".to_string()]));
        assert!(!manager.skip_hit(&["unknown".to_string()]));

        assert!(manager.skip_hit(&["bp1".to_string()]));
        assert!(manager.skip_hit(&["bp1".to_string()]));
        assert!(!manager.skip_hit(&["bp1".to_string()]));
    }
}
