//! Scripts
//!
//! Every loaded source unit the VM reports is kept here, once per id. Sources are
//! fetched lazily and cached on the script.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

/// One loaded source unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    pub id: String,
    pub name: Option<String>,
    pub line_offset: u64,
    pub column_offset: u64,
    pub line_count: Option<u64>,
    pub source: Option<Arc<String>>,
    pub collected: bool,
}

impl Script {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Script {
            id: id.to_string(),
            name: name.map(|s| s.to_string()),
            line_offset: 0,
            column_offset: 0,
            line_count: None,
            source: None,
            collected: false,
        }
    }

    pub fn with_offsets(mut self, line_offset: u64, column_offset: u64) -> Self {
        self.line_offset = line_offset;
        self.column_offset = column_offset;
        self
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source.map(Arc::new);
        self
    }

    /// Name to show the user, anonymous scripts show their id
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("<script {}>", self.id),
        }
    }
}

/// Scripts of one session, deduplicated by id
#[derive(Debug, Default)]
pub struct ScriptManager {
    scripts: Mutex<IndexMap<String, Script>>,
}

impl ScriptManager {
    pub fn new() -> Self {
        ScriptManager::default()
    }

    /// Add or update a script, returns true if it was not known before
    ///
    /// An already fetched source is kept if the update doesn't carry one.
    pub fn add(&self, mut script: Script) -> bool {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&script.id) {
            Some(existing) => {
                if script.source.is_none() {
                    script.source = existing.source.take();
                }
                *existing = script;
                false
            }
            None => {
                scripts.insert(script.id.clone(), script);
                true
            }
        }
    }

    pub fn mark_collected(&self, id: &str) -> bool {
        match self.scripts.lock().get_mut(id) {
            Some(script) => {
                script.collected = true;
                true
            }
            None => false,
        }
    }

    pub fn set_source(&self, id: &str, source: String) {
        if let Some(script) = self.scripts.lock().get_mut(id) {
            script.source = Some(Arc::new(source));
        }
    }

    pub fn find(&self, id: &str) -> Option<Script> {
        self.scripts.lock().get(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<Script> {
        self.scripts
            .lock()
            .values()
            .filter(|s| s.name.as_deref() == Some(name))
            .cloned()
            .collect()
    }

    pub fn cached_source(&self, id: &str) -> Option<Arc<String>> {
        self.scripts.lock().get(id).and_then(|s| s.source.clone())
    }

    /// All scripts in the order they were first reported
    pub fn all(&self) -> Vec<Script> {
        self.scripts.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.scripts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Script, ScriptManager};

    #[test]
    fn check_dedup_by_id() {
        let manager = ScriptManager::new();
        assert!(manager.add(Script::new("12", Some("app.js"))));
        assert!(!manager.add(Script::new("12", Some("app.js")).with_offsets(3, 0)));
        assert!(manager.add(Script::new("13", None)));

        let all = manager.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].line_offset, 3);
        assert_eq!(all[1].display_name(), "<script 13>");
    }

    #[test]
    fn check_source_kept_on_update() {
        let manager = ScriptManager::new();
        manager.add(Script::new("1", Some("a.js")));
        manager.set_source("1", "var a = 1;".to_string());
        manager.add(Script::new("1", Some("a.js")));
        assert_eq!(manager.cached_source("1").unwrap().as_str(), "var a = 1;");
    }

    #[test]
    fn check_collected() {
        let manager = ScriptManager::new();
        manager.add(Script::new("7", Some("eval")));
        assert!(manager.mark_collected("7"));
        assert!(!manager.mark_collected("8"));
        assert!(manager.find("7").unwrap().collected);
        assert_eq!(manager.find_by_name("eval").len(), 1);
    }
}
