//! Breakpoints
//!
//! Local edits to a breakpoint are staged. They only reach the VM when the session
//! flushes the breakpoint with a `changebreakpoint` command.

use indexmap::IndexMap;
use parking_lot::Mutex;

use chromedbg_core::{Error, Result};

use crate::commands::{BreakpointTarget, ChangeBreakpointArgs, SetBreakpointArgs};
use crate::protocol::BreakpointInfo;

/// Everything needed to create a breakpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub target: BreakpointTarget,
    pub line: u64,
    pub column: Option<u64>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub ignore_count: u32,
}

impl BreakpointSpec {
    pub fn new(target: BreakpointTarget, line: u64) -> Self {
        BreakpointSpec {
            target,
            line,
            column: None,
            enabled: true,
            condition: None,
            ignore_count: 0,
        }
    }

    pub fn set_args(&self) -> SetBreakpointArgs {
        let mut args = SetBreakpointArgs::new(&self.target, self.line);
        args.column = self.column;
        args.enabled = self.enabled;
        args.condition = self.condition.clone();
        if self.ignore_count > 0 {
            args.ignore_count = Some(self.ignore_count);
        }
        args
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    id: i64,
    spec: BreakpointSpec,
    dirty: bool,
}

impl Breakpoint {
    pub fn new(id: i64, spec: BreakpointSpec) -> Self {
        Breakpoint {
            id,
            spec,
            dirty: false,
        }
    }

    /// Rebuild a breakpoint from a `listbreakpoints` entry
    pub fn from_info(info: &BreakpointInfo) -> Option<Breakpoint> {
        let target = match info.type_name() {
            "scriptId" => BreakpointTarget::ScriptId(info.script_id()?),
            "scriptName" | "script" => BreakpointTarget::ScriptName(info.script_name()?.to_string()),
            "scriptRegExp" => BreakpointTarget::ScriptRegExp(info.script_regexp()?.to_string()),
            _ => return None,
        };

        Some(Breakpoint::new(
            info.number(),
            BreakpointSpec {
                target,
                line: info.line()?.max(0) as u64,
                column: info.column().map(|c| c.max(0) as u64),
                enabled: info.active(),
                condition: info.condition().filter(|c| !c.is_empty()).map(String::from),
                ignore_count: info.ignore_count().max(0) as u32,
            },
        ))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn target(&self) -> &BreakpointTarget {
        &self.spec.target
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

    /// Whether there are local edits the VM hasn't seen
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

    /// Arguments of the `changebreakpoint` carrying the staged state
    pub fn change_args(&self) -> ChangeBreakpointArgs {
        ChangeBreakpointArgs {
            breakpoint: self.id,
            enabled: Some(self.spec.enabled),
            condition: Some(self.spec.condition.clone().unwrap_or_default()),
            ignore_count: Some(self.spec.ignore_count),
        }
    }
}

/// Breakpoints of one session, in creation order
#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: Mutex<IndexMap<i64, Breakpoint>>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        BreakpointManager::default()
    }

    pub fn add(&self, breakpoint: Breakpoint) {
        self.breakpoints.lock().insert(breakpoint.id, breakpoint);
    }

    pub fn remove(&self, id: i64) -> Option<Breakpoint> {
        self.breakpoints.lock().shift_remove(&id)
    }

    pub fn get(&self, id: i64) -> Option<Breakpoint> {
        self.breakpoints.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().values().cloned().collect()
    }

    /// Stage local edits to a breakpoint
    pub fn update<F>(&self, id: i64, edit: F) -> Result<Breakpoint>
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

    /// The VM has accepted `flushed`, clear the dirty flag unless edited since
    pub fn mark_flushed(&self, flushed: &Breakpoint) {
        if let Some(current) = self.breakpoints.lock().get_mut(&flushed.id) {
            if current.spec == flushed.spec {
                current.dirty = false;
            }
        }
    }

    /// Replace everything with the VM's own list
    pub fn replace_all(&self, breakpoints: Vec<Breakpoint>) {
        let mut current = self.breakpoints.lock();
        current.clear();
        for breakpoint in breakpoints {
            current.insert(breakpoint.id, breakpoint);
        }
    }
}
