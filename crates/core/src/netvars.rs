//! Two last-writer-wins variable namespaces: global (per room) and
//! per-client. HashMap-keyed record store, LWW merge on timestamp with a
//! last-writer tie-break, debounced outbound sends for locally-set values.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct VarRecord {
    pub value: String,
    pub timestamp: f64,
    pub last_writer: u16,
}

fn accept(incoming: &VarRecord, current: Option<&VarRecord>) -> bool {
    match current {
        None => true,
        Some(current) => {
            incoming.timestamp > current.timestamp
                || (incoming.timestamp == current.timestamp && incoming.last_writer > current.last_writer)
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVarChange {
    pub name: String,
    pub old: Option<String>,
    pub new: String,
}

#[derive(Debug, Clone)]
pub struct ClientVarChange {
    pub client_no: u16,
    pub name: String,
    pub old: Option<String>,
    pub new: String,
}

#[derive(Debug, Default)]
pub struct NvStore {
    global: HashMap<String, VarRecord>,
    per_client: HashMap<u16, HashMap<String, VarRecord>>,
    last_outbound_global: HashMap<String, f64>,
    last_outbound_client: HashMap<(u16, String), f64>,
    initial_sync_done: bool,
}

impl NvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.initial_sync_done
    }

    pub fn mark_initial_sync_done(&mut self) {
        self.initial_sync_done = true;
    }

    pub fn reset(&mut self) {
        self.global.clear();
        self.per_client.clear();
        self.last_outbound_global.clear();
        self.last_outbound_client.clear();
        self.initial_sync_done = false;
    }

    pub fn get_global(&self, name: &str) -> Option<&str> {
        self.global.get(name).map(|r| r.value.as_str())
    }

    pub fn get_client(&self, client_no: u16, name: &str) -> Option<&str> {
        self.per_client.get(&client_no).and_then(|m| m.get(name)).map(|r| r.value.as_str())
    }

    /// Local write: always adopts the new value (the local client is its
    /// own authority until the merge arrives back from the server), and
    /// reports whether the debounce window allows sending now.
    pub fn set_global_local(&mut self, name: &str, value: &str, now: f64, local_client_no: u16, debounce_secs: f64) -> bool {
        self.global.insert(
            name.to_string(),
            VarRecord { value: value.to_string(), timestamp: now, last_writer: local_client_no },
        );
        self.debounced_global(name, now, debounce_secs)
    }

    pub fn set_client_local(
        &mut self,
        target: u16,
        name: &str,
        value: &str,
        now: f64,
        local_client_no: u16,
        debounce_secs: f64,
    ) -> bool {
        self.per_client.entry(target).or_default().insert(
            name.to_string(),
            VarRecord { value: value.to_string(), timestamp: now, last_writer: local_client_no },
        );
        self.debounced_client(target, name, now, debounce_secs)
    }

    fn debounced_global(&mut self, name: &str, now: f64, debounce_secs: f64) -> bool {
        let allow = match self.last_outbound_global.get(name) {
            Some(&last) => now - last >= debounce_secs,
            None => true,
        };
        if allow {
            self.last_outbound_global.insert(name.to_string(), now);
        }
        allow
    }

    fn debounced_client(&mut self, target: u16, name: &str, now: f64, debounce_secs: f64) -> bool {
        let key = (target, name.to_string());
        let allow = match self.last_outbound_client.get(&key) {
            Some(&last) => now - last >= debounce_secs,
            None => true,
        };
        if allow {
            self.last_outbound_client.insert(key, now);
        }
        allow
    }

    /// Merges an incoming global record, returning a change record iff the
    /// incoming value won and actually differs from what was there.
    pub fn merge_global(&mut self, name: &str, incoming: VarRecord) -> Option<GlobalVarChange> {
        let current = self.global.get(name);
        if !accept(&incoming, current) {
            return None;
        }
        let old = current.map(|r| r.value.clone());
        let changed = old.as_deref() != Some(incoming.value.as_str());
        self.global.insert(name.to_string(), incoming.clone());
        changed.then(|| GlobalVarChange { name: name.to_string(), old, new: incoming.value })
    }

    pub fn merge_client(&mut self, client_no: u16, name: &str, incoming: VarRecord) -> Option<ClientVarChange> {
        let map = self.per_client.entry(client_no).or_default();
        let current = map.get(name);
        if !accept(&incoming, current) {
            return None;
        }
        let old = current.map(|r| r.value.clone());
        let changed = old.as_deref() != Some(incoming.value.as_str());
        map.insert(name.to_string(), incoming.clone());
        changed.then(|| ClientVarChange { client_no, name: name.to_string(), old, new: incoming.value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(value: &str, ts: f64, writer: u16) -> VarRecord {
        VarRecord { value: value.to_string(), timestamp: ts, last_writer: writer }
    }

    #[test]
    fn later_timestamp_wins_forward_order() {
        let mut store = NvStore::new();
        store.merge_global("x", rec("A", 10.0, 1));
        store.merge_global("x", rec("B", 11.0, 2));
        assert_eq!(store.get_global("x"), Some("B"));
    }

    #[test]
    fn later_timestamp_wins_reverse_order() {
        let mut store = NvStore::new();
        store.merge_global("x", rec("B", 11.0, 2));
        store.merge_global("x", rec("A", 10.0, 1));
        assert_eq!(store.get_global("x"), Some("B"));
    }

    #[test]
    fn tie_breaks_by_writer_client_no() {
        let mut store = NvStore::new();
        store.merge_global("x", rec("A", 10.0, 1));
        let change = store.merge_global("x", rec("B", 10.0, 2));
        assert!(change.is_some());
        assert_eq!(store.get_global("x"), Some("B"));
    }

    #[test]
    fn debounce_coalesces_rapid_local_sets() {
        let mut store = NvStore::new();
        assert!(store.set_global_local("x", "1", 0.0, 7, 0.1));
        assert!(!store.set_global_local("x", "2", 0.02, 7, 0.1));
        assert!(!store.set_global_local("x", "3", 0.05, 7, 0.1));
        assert!(store.set_global_local("x", "4", 0.2, 7, 0.1));
    }

    #[test]
    fn no_change_event_when_value_unchanged() {
        let mut store = NvStore::new();
        store.merge_global("x", rec("A", 10.0, 1));
        let change = store.merge_global("x", rec("A", 11.0, 1));
        assert!(change.is_none());
    }
}
