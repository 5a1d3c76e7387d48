use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MrError, Result};

/// Claves de configuración conocidas por el engine.
pub mod keys {
    pub const JOB_NAME: &str = "mapreduce.job.name";

    pub const INPUT_FORMAT: &str = "mapreduce.job.inputformat.class";
    pub const INPUT_DIR: &str = "mapreduce.input.fileinputformat.inputdir";
    /// Clases con las que `kvtext` decodifica cada lado de la línea.
    pub const INPUT_KEY_CLASS: &str = "mapreduce.job.input.key.class";
    pub const INPUT_VALUE_CLASS: &str = "mapreduce.job.input.value.class";

    pub const OUTPUT_FORMAT: &str = "mapreduce.job.outputformat.class";
    pub const OUTPUT_DIR: &str = "mapreduce.output.fileoutputformat.outputdir";
    pub const OUTPUT_BASENAME: &str = "mapreduce.output.basename";
    pub const OUTPUT_KEY_CLASS: &str = "mapreduce.job.output.key.class";
    pub const OUTPUT_VALUE_CLASS: &str = "mapreduce.job.output.value.class";

    pub const MAP_CLASS: &str = "mapreduce.job.map.class";
    pub const COMBINE_CLASS: &str = "mapreduce.job.combine.class";
    pub const REDUCE_CLASS: &str = "mapreduce.job.reduce.class";
    pub const PARTITIONER_CLASS: &str = "mapreduce.job.partitioner.class";
    pub const NUM_REDUCES: &str = "mapreduce.job.reduces";

    /// Mapa serializado nombre -> diff de cada salida dux.
    pub const DUX_OUTPUTS: &str = "dux.outputs";
    /// Lista serializada de diffs, una por rama de entrada.
    pub const MUX_INPUTS: &str = "mux.inputs";
}

/// Configuración de un job: claves y valores de texto.
///
/// Es el único canal entre el proceso que arma el grafo y los procesos de
/// tarea, así que se trata como un valor: se clona, se compara (`diff`) y se
/// combina (`merge`), nunca se comparte mutable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConf {
    props: BTreeMap<String, String>,
}

/// Diferencia entre dos configuraciones. `None` marca una clave borrada.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfDiff {
    changes: BTreeMap<String, Option<String>>,
}

impl JobConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(|s| s.as_str())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    /// Lee un entero; una clave ausente devuelve `default`.
    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| MrError::Conf(format!("{key}={raw}: {e}"))),
        }
    }

    /// Lista separada por comas, sin entradas vacías.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.props.insert(key.into(), value.into());
    }

    /// Variante encadenable de `set`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn unset(&mut self, key: &str) -> Option<String> {
        self.props.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Claves cuyo valor en `self` difiere de `base`.
    pub fn diff(&self, base: &JobConf) -> ConfDiff {
        let mut changes = BTreeMap::new();

        for (k, v) in &self.props {
            if base.props.get(k) != Some(v) {
                changes.insert(k.clone(), Some(v.clone()));
            }
        }
        for k in base.props.keys() {
            if !self.props.contains_key(k) {
                changes.insert(k.clone(), None);
            }
        }

        ConfDiff { changes }
    }

    /// Aplica un diff sobre una copia de esta configuración.
    pub fn merge(&self, diff: &ConfDiff) -> JobConf {
        let mut out = self.clone();
        for (k, v) in &diff.changes {
            match v {
                Some(v) => {
                    out.props.insert(k.clone(), v.clone());
                }
                None => {
                    out.props.remove(k);
                }
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl ConfDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(|k| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.changes.get(key).map(|v| v.as_deref())
    }

    /// Copia del diff sin las claves indicadas.
    pub fn without(&self, keys: &[&str]) -> ConfDiff {
        let changes = self
            .changes
            .iter()
            .filter(|(k, _)| !keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ConfDiff { changes }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobConf {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let props = iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        JobConf { props }
    }
}
