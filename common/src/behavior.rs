//! Registro global de behaviors con nombre.
//!
//! Una clausura no cruza procesos: lo que viaja en la configuración es el
//! nombre de una función de nivel superior (la "factory") y sus argumentos en
//! JSON. Cada proceso de tarea resuelve el nombre en este registro y llama a
//! la factory una sola vez para obtener el behavior real.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::conf::JobConf;
use crate::error::{MrError, Result};
use crate::record::{KeyValue, Records, Shape, TaskRecords};
use crate::shuffle::hash_key_to_partition;
use crate::task::TaskContext;
use crate::{join, wordcount};

pub type RecordsFn = Box<dyn FnMut(Records) -> anyhow::Result<Records> + Send>;
pub type RawFn = Box<dyn FnMut(&mut TaskContext) -> anyhow::Result<()> + Send>;
pub type PartitionFn = Box<dyn Fn(&Value, &Value, usize) -> usize + Send + Sync>;

/// Lo que devuelve una factory: cómo se ejecuta el slot dentro de la tarea.
pub enum Behavior {
    /// Recibe la entrada de la tarea con la forma `source` y devuelve
    /// registros que se escriben con la forma `sink`.
    Records {
        source: Shape,
        sink: Shape,
        f: RecordsFn,
    },
    /// Recibe sólo el contexto de la tarea y maneja su propia salida
    /// (por ejemplo con dux). Lo que devuelva se ignora.
    Raw(RawFn),
    /// Función de particionado: (clave, valor, n) -> partición.
    Partition(PartitionFn),
}

pub type BehaviorFactory = fn(&JobConf, &[Value]) -> anyhow::Result<Behavior>;

impl Behavior {
    pub fn records<F>(source: Shape, sink: Shape, f: F) -> Self
    where
        F: FnMut(Records) -> anyhow::Result<Records> + Send + 'static,
    {
        Behavior::Records {
            source,
            sink,
            f: Box::new(f),
        }
    }

    pub fn raw<F>(f: F) -> Self
    where
        F: FnMut(&mut TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        Behavior::Raw(Box::new(f))
    }

    pub fn partition<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value, usize) -> usize + Send + Sync + 'static,
    {
        Behavior::Partition(Box::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Behavior::Records { .. } => "records",
            Behavior::Raw(_) => "raw",
            Behavior::Partition(_) => "partition",
        }
    }

    /// Ejecuta un behavior de registros sobre la entrada ya leída y devuelve
    /// los pares que hay que escribir.
    pub fn run_records(&mut self, input: TaskRecords) -> Result<Vec<KeyValue>> {
        match self {
            Behavior::Records { source, sink, f } => {
                let records = source.shape(input)?;
                let out = f(records)?;
                out.into_iter().map(|r| sink.unshape(r)).collect()
            }
            other => Err(MrError::conf(format!(
                "se esperaba un behavior de registros y llegó {}",
                other.kind()
            ))),
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Records { source, sink, .. } => f
                .debug_struct("Records")
                .field("source", source)
                .field("sink", sink)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

static BEHAVIORS: Lazy<RwLock<HashMap<String, BehaviorFactory>>> =
    Lazy::new(|| RwLock::new(builtins()));

fn builtins() -> HashMap<String, BehaviorFactory> {
    let mut map: HashMap<String, BehaviorFactory> = HashMap::new();
    map.insert("identity.map".to_string(), identity_map);
    map.insert("identity.reduce".to_string(), identity_reduce);
    map.insert("hash.partition".to_string(), hash_partition);
    map.insert("wordcount.tokenize".to_string(), wordcount::tokenize);
    map.insert("wordcount.sum".to_string(), wordcount::sum);
    map.insert("join.key_by".to_string(), join::key_by);
    map.insert("join.inner".to_string(), join::inner);
    map
}

/// Registra (o reemplaza) una factory con nombre en este proceso.
pub fn register(name: &str, factory: BehaviorFactory) {
    let mut map = BEHAVIORS.write().unwrap_or_else(PoisonError::into_inner);
    if map.insert(name.to_string(), factory).is_some() {
        debug!("behavior {} reemplazado", name);
    }
}

pub fn lookup(name: &str) -> Result<BehaviorFactory> {
    let map = BEHAVIORS.read().unwrap_or_else(PoisonError::into_inner);
    map.get(name)
        .copied()
        .ok_or_else(|| MrError::UnknownBehavior(name.to_string()))
}

pub fn is_registered(name: &str) -> bool {
    lookup(name).is_ok()
}

fn identity_map(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    Ok(Behavior::records(Shape::KeyVals, Shape::KeyVals, Ok))
}

fn identity_reduce(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    // keyvals sobre grupos ya aplana cada valor con su clave
    Ok(Behavior::records(Shape::KeyVals, Shape::KeyVals, Ok))
}

fn hash_partition(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    Ok(Behavior::partition(|key, _value, n| {
        hash_key_to_partition(key, n)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doubler(_conf: &JobConf, args: &[Value]) -> anyhow::Result<Behavior> {
        let factor = args.first().and_then(|v| v.as_i64()).unwrap_or(2);
        Ok(Behavior::records(Shape::Vals, Shape::Vals, move |recs| {
            Ok(recs
                .into_iter()
                .map(|r| json!(r.as_i64().unwrap_or(0) * factor))
                .collect())
        }))
    }

    #[test]
    fn register_y_lookup() {
        register("tests.behavior.doubler", doubler);
        assert!(is_registered("tests.behavior.doubler"));

        let factory = lookup("tests.behavior.doubler").unwrap();
        let behavior = factory(&JobConf::new(), &[json!(3)]).unwrap();
        match behavior {
            Behavior::Records { mut f, .. } => {
                assert_eq!(f(vec![json!(1), json!(2)]).unwrap(), vec![json!(3), json!(6)]);
            }
            other => panic!("behavior inesperado: {other:?}"),
        }
    }

    #[test]
    fn lookup_de_nombre_desconocido_falla() {
        assert!(matches!(
            lookup("no.existe"),
            Err(MrError::UnknownBehavior(name)) if name == "no.existe"
        ));
    }

    #[test]
    fn builtins_estan_registrados() {
        for name in [
            "identity.map",
            "identity.reduce",
            "hash.partition",
            "wordcount.tokenize",
            "wordcount.sum",
            "join.key_by",
            "join.inner",
        ] {
            assert!(is_registered(name), "{name}");
        }
    }
}
