//! Registro de slots: cada (rol, índice) es una "clase" con nombre fijo.
//!
//! El runtime de tareas sólo sabe instanciar por nombre, así que la tabla de
//! clases se genera en compilación: `SLOT_CAPACITY` trampolines por rol, cada
//! uno conoce su propio (rol, índice) y al ejecutarse lee de la configuración
//! de la tarea qué behavior le tocó y con qué argumentos.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::behavior::{self, Behavior};
use crate::conf::{keys, JobConf};
use crate::error::{MrError, Result};
use crate::step::Step;

/// Slots disponibles por rol.
pub const SLOT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Map,
    Combine,
    Reduce,
    Partition,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Map, Role::Combine, Role::Reduce, Role::Partition];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Map => "map",
            Role::Combine => "combine",
            Role::Reduce => "reduce",
            Role::Partition => "partition",
        }
    }

    /// Clave del job donde va el nombre de la clase de este rol.
    pub fn class_key(&self) -> &'static str {
        match self {
            Role::Map => keys::MAP_CLASS,
            Role::Combine => keys::COMBINE_CLASS,
            Role::Reduce => keys::REDUCE_CLASS,
            Role::Partition => keys::PARTITIONER_CLASS,
        }
    }

    const fn from_code(code: u8) -> Role {
        match code {
            0 => Role::Map,
            1 => Role::Combine,
            2 => Role::Reduce,
            _ => Role::Partition,
        }
    }

    fn table(&self) -> &'static [SlotClass; SLOT_CAPACITY] {
        match self {
            Role::Map => &MAP_SLOTS,
            Role::Combine => &COMBINE_SLOTS,
            Role::Reduce => &REDUCE_SLOTS,
            Role::Partition => &PARTITION_SLOTS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MrError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| MrError::conf(format!("rol desconocido: {s}")))
    }
}

/// Clase pre-generada para un (rol, índice).
pub struct SlotClass {
    pub role: Role,
    pub index: usize,
    pub name: &'static str,
    entry: fn(&JobConf) -> Result<Behavior>,
}

impl SlotClass {
    /// Reconstruye el behavior de este slot a partir de la configuración.
    pub fn instantiate(&self, conf: &JobConf) -> Result<Behavior> {
        (self.entry)(conf)
    }
}

impl fmt::Debug for SlotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotClass")
            .field("role", &self.role)
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

fn trampoline<const R: u8, const I: usize>(conf: &JobConf) -> Result<Behavior> {
    bind(Role::from_code(R), I, conf)
}

macro_rules! slot_tables {
    ($($i:literal)*) => {
        static MAP_SLOTS: [SlotClass; SLOT_CAPACITY] = [$(SlotClass {
            role: Role::Map,
            index: $i,
            name: concat!("mr.slot.map.", stringify!($i)),
            entry: trampoline::<0, $i>,
        }),*];
        static COMBINE_SLOTS: [SlotClass; SLOT_CAPACITY] = [$(SlotClass {
            role: Role::Combine,
            index: $i,
            name: concat!("mr.slot.combine.", stringify!($i)),
            entry: trampoline::<1, $i>,
        }),*];
        static REDUCE_SLOTS: [SlotClass; SLOT_CAPACITY] = [$(SlotClass {
            role: Role::Reduce,
            index: $i,
            name: concat!("mr.slot.reduce.", stringify!($i)),
            entry: trampoline::<2, $i>,
        }),*];
        static PARTITION_SLOTS: [SlotClass; SLOT_CAPACITY] = [$(SlotClass {
            role: Role::Partition,
            index: $i,
            name: concat!("mr.slot.partition.", stringify!($i)),
            entry: trampoline::<3, $i>,
        }),*];
    };
}

slot_tables!(
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
    16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
);

fn next_key(role: Role) -> String {
    format!("{}.next", role.as_str())
}

fn behavior_key(role: Role, index: usize) -> String {
    format!("{}.{}.behaviorRef", role.as_str(), index)
}

fn args_key(role: Role, index: usize) -> String {
    format!("{}.{}.args", role.as_str(), index)
}

/// Reserva el siguiente slot de `role` en `conf` y guarda behavior y
/// argumentos. Pasarse de la capacidad es un error de armado del job, antes
/// de enviarlo.
pub fn allocate(
    role: Role,
    conf: &mut JobConf,
    behavior_ref: &str,
    args: &[Value],
) -> Result<&'static SlotClass> {
    let index = conf.get_usize(&next_key(role), 0)?;
    if index >= SLOT_CAPACITY {
        return Err(MrError::SlotCapacity {
            role,
            index,
            capacity: SLOT_CAPACITY,
        });
    }

    let args_text = serde_json::to_string(args)?;
    conf.set(next_key(role), (index + 1).to_string());
    conf.set(behavior_key(role, index), behavior_ref);
    conf.set(args_key(role, index), args_text);

    let class = &role.table()[index];
    debug!("slot {} -> {}", class.name, behavior_ref);
    Ok(class)
}

/// Paso que reserva un slot y lo instala como clase del rol en el job.
pub fn step(role: Role, behavior_ref: &str, args: Vec<Value>) -> Step {
    let behavior_ref = behavior_ref.to_string();
    let label = format!("{role} {behavior_ref}");
    Step::new(label, move |mut conf| {
        let class = allocate(role, &mut conf, &behavior_ref, &args)?;
        conf.set(role.class_key(), class.name);
        Ok(conf)
    })
}

/// Busca una clase por nombre en las tablas pre-generadas.
pub fn resolve_class(name: &str) -> Result<&'static SlotClass> {
    Role::ALL
        .iter()
        .flat_map(|role| role.table().iter())
        .find(|class| class.name == name)
        .ok_or_else(|| MrError::UnknownClass(name.to_string()))
}

/// Clase instalada para `role` en el job, si hay una.
pub fn class_for(conf: &JobConf, role: Role) -> Result<Option<&'static SlotClass>> {
    match conf.get(role.class_key()) {
        None => Ok(None),
        Some(name) => {
            let class = resolve_class(name)?;
            if class.role != role {
                return Err(MrError::conf(format!(
                    "{} apunta a {}, que es de rol {}",
                    role.class_key(),
                    name,
                    class.role
                )));
            }
            Ok(Some(class))
        }
    }
}

/// Copia la contabilidad de slots de `from` a `to` (contadores e índices
/// reservados) para que ramas armadas aparte no reutilicen índices.
pub fn carry_slots(from: &JobConf, to: &mut JobConf) {
    for (k, v) in from.iter() {
        let is_slot_key = Role::ALL
            .iter()
            .any(|role| k.starts_with(&format!("{}.", role.as_str())));
        if is_slot_key {
            to.set(k, v);
        }
    }
}

fn bind(role: Role, index: usize, conf: &JobConf) -> Result<Behavior> {
    let bind_err = |reason: String| MrError::Bind {
        role,
        index,
        reason,
    };

    let behavior_ref = conf
        .get(&behavior_key(role, index))
        .ok_or_else(|| bind_err("falta behaviorRef".to_string()))?;
    let raw_args = conf.get_or(&args_key(role, index), "[]");
    let args: Vec<Value> = serde_json::from_str(raw_args)
        .map_err(|e| bind_err(format!("argumentos ilegibles ({raw_args}): {e}")))?;

    let factory = behavior::lookup(behavior_ref)?;
    let behavior = factory(conf, &args).map_err(|e| bind_err(format!("{behavior_ref}: {e:#}")))?;

    if role == Role::Partition && !matches!(behavior, Behavior::Partition(_)) {
        return Err(bind_err(format!(
            "{behavior_ref} devolvió un behavior {} para un particionador",
            behavior.kind()
        )));
    }

    debug!("enlazado {}.{} -> {} ({})", role, index, behavior_ref, behavior.kind());
    Ok(behavior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Shape;
    use serde_json::json;

    fn add_n(_conf: &JobConf, args: &[Value]) -> anyhow::Result<Behavior> {
        let n = args
            .first()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow::anyhow!("falta n"))?;
        Ok(Behavior::records(Shape::Vals, Shape::Vals, move |recs| {
            Ok(recs
                .into_iter()
                .map(|r| json!(r.as_i64().unwrap_or(0) + n))
                .collect())
        }))
    }

    fn run_records(behavior: Behavior, input: Vec<Value>) -> Vec<Value> {
        match behavior {
            Behavior::Records { mut f, .. } => f(input).unwrap(),
            other => panic!("esperaba records, llegó {other:?}"),
        }
    }

    #[test]
    fn allocate_entrega_indices_consecutivos_sin_reusar() {
        let mut conf = JobConf::new();
        let a = allocate(Role::Map, &mut conf, "identity.map", &[]).unwrap();
        let b = allocate(Role::Map, &mut conf, "identity.map", &[]).unwrap();
        let r = allocate(Role::Reduce, &mut conf, "identity.reduce", &[]).unwrap();

        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(r.index, 0);
        assert_eq!(a.name, "mr.slot.map.0");
        assert_eq!(b.name, "mr.slot.map.1");
        assert_eq!(conf.get("map.next"), Some("2"));
        assert_eq!(conf.get("map.1.behaviorRef"), Some("identity.map"));
        assert_eq!(conf.get("map.1.args"), Some("[]"));
    }

    #[test]
    fn bind_y_resolve_reproducen_el_behavior() {
        behavior::register("tests.registry.add_n", add_n);

        for index in [0usize, 5, SLOT_CAPACITY - 1] {
            let mut conf = JobConf::new().with("combine.next", index.to_string());
            let class = allocate(Role::Combine, &mut conf, "tests.registry.add_n", &[json!(10)])
                .unwrap();
            assert_eq!(class.index, index);

            // del lado de la tarea sólo viaja el nombre y la configuración en texto
            let conf = JobConf::from_json(&conf.to_json().unwrap()).unwrap();
            let resolved = resolve_class(class.name).unwrap();
            assert_eq!((resolved.role, resolved.index), (Role::Combine, index));

            let behavior = resolved.instantiate(&conf).unwrap();
            assert_eq!(run_records(behavior, vec![json!(1), json!(2)]), vec![json!(11), json!(12)]);
        }
    }

    #[test]
    fn pasarse_de_la_capacidad_falla_al_armar() {
        let mut conf = JobConf::new().with("reduce.next", (SLOT_CAPACITY - 1).to_string());
        allocate(Role::Reduce, &mut conf, "identity.reduce", &[]).unwrap();

        let err = allocate(Role::Reduce, &mut conf, "identity.reduce", &[]).unwrap_err();
        assert!(matches!(
            err,
            MrError::SlotCapacity { role: Role::Reduce, index, capacity } if index == SLOT_CAPACITY && capacity == SLOT_CAPACITY
        ));
    }

    #[test]
    fn step_instala_la_clase_del_rol() {
        let conf = step(Role::Map, "identity.map", vec![])
            .then(step(Role::Map, "wordcount.tokenize", vec![]))
            .apply(JobConf::new())
            .unwrap();

        assert_eq!(conf.get(keys::MAP_CLASS), Some("mr.slot.map.1"));
        let class = class_for(&conf, Role::Map).unwrap().unwrap();
        assert_eq!(class.index, 1);
        assert!(class_for(&conf, Role::Reduce).unwrap().is_none());
    }

    #[test]
    fn errores_de_enlace() {
        assert!(matches!(resolve_class("mr.slot.map.99"), Err(MrError::UnknownClass(_))));

        // slot sin behaviorRef
        let conf = JobConf::new();
        assert!(matches!(
            resolve_class("mr.slot.map.3").unwrap().instantiate(&conf),
            Err(MrError::Bind { index: 3, .. })
        ));

        // argumentos corruptos
        let conf = JobConf::new()
            .with("map.0.behaviorRef", "identity.map")
            .with("map.0.args", "[1,");
        assert!(matches!(
            resolve_class("mr.slot.map.0").unwrap().instantiate(&conf),
            Err(MrError::Bind { .. })
        ));

        // factory que rechaza sus argumentos
        behavior::register("tests.registry.add_n", add_n);
        let conf = JobConf::new()
            .with("map.0.behaviorRef", "tests.registry.add_n")
            .with("map.0.args", "[]");
        assert!(matches!(
            resolve_class("mr.slot.map.0").unwrap().instantiate(&conf),
            Err(MrError::Bind { .. })
        ));

        // un particionador tiene que devolver una función de partición
        let conf = JobConf::new()
            .with("partition.0.behaviorRef", "identity.map")
            .with("partition.0.args", "[]");
        assert!(resolve_class("mr.slot.partition.0").unwrap().instantiate(&conf).is_err());

        // la clave de clase no puede apuntar a otro rol
        let conf = JobConf::new().with(keys::REDUCE_CLASS, "mr.slot.map.0");
        assert!(class_for(&conf, Role::Reduce).is_err());
    }

    #[test]
    fn carry_slots_copia_solo_contabilidad() {
        let mut branch = JobConf::new().with("otra", "x");
        allocate(Role::Map, &mut branch, "identity.map", &[]).unwrap();

        let mut parent = JobConf::new();
        carry_slots(&branch, &mut parent);
        assert_eq!(parent.get("map.next"), Some("1"));
        assert_eq!(parent.get("map.0.behaviorRef"), Some("identity.map"));
        assert_eq!(parent.get("otra"), None);

        let next = allocate(Role::Map, &mut parent, "identity.map", &[]).unwrap();
        assert_eq!(next.index, 1);
    }
}
