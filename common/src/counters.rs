use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Vista serializable: grupo -> (contador -> valor).
pub type CounterSnapshot = BTreeMap<String, BTreeMap<String, u64>>;

/// Contadores de una tarea (o de un job, tras sumar los de sus tareas).
#[derive(Debug, Clone, Default)]
pub struct Counters {
    inner: Arc<Mutex<CounterSnapshot>>,
}

/// Un contador concreto dentro de `Counters`.
#[derive(Debug, Clone)]
pub struct Counter {
    counters: Counters,
    group: String,
    name: String,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, group: &str, name: &str) -> Counter {
        Counter {
            counters: self.clone(),
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn value(&self, group: &str, name: &str) -> u64 {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(group).and_then(|g| g.get(name)).copied().unwrap_or(0)
    }

    fn add(&self, group: &str, name: &str, n: u64) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(group.to_string())
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += n;
    }

    /// Suma un snapshot (por ejemplo el de una tarea terminada).
    pub fn merge(&self, snapshot: &CounterSnapshot) {
        for (group, counters) in snapshot {
            for (name, n) in counters {
                self.add(group, name, *n);
            }
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Counter {
    pub fn increment(&self, n: u64) {
        self.counters.add(&self.group, &self.name, n);
    }

    pub fn value(&self) -> u64 {
        self.counters.value(&self.group, &self.name)
    }
}
