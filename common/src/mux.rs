//! Entrada multiplexada: varias ramas de entrada en un mismo job, cada una
//! con su formato y sus rutas; el mapper lo puede poner la rama o el job.

use std::path::PathBuf;

use crate::conf::{keys, ConfDiff, JobConf};
use crate::error::{MrError, Result};
use crate::format::{input_format, InputFormat, InputSplit};
use crate::record::KeyValue;
use crate::registry;
use crate::step::Step;

/// Claves de entrada: siempre las define la rama.
const INPUT_KEYS: [&str; 5] = [
    keys::MUX_INPUTS,
    keys::INPUT_FORMAT,
    keys::INPUT_DIR,
    keys::INPUT_KEY_CLASS,
    keys::INPUT_VALUE_CLASS,
];

fn without(conf: &JobConf, keys: &[&str]) -> JobConf {
    let mut base = conf.clone();
    for key in keys {
        base.unset(key);
    }
    base
}

/// Base contra la que se calcula el diff de una rama nueva. Sin mapper,
/// para que el de la rama quede en su diff.
fn pristine(conf: &JobConf) -> JobConf {
    let mut base = without(conf, &INPUT_KEYS);
    base.unset(keys::MAP_CLASS);
    base
}

/// Ramas declaradas en el job, en orden.
pub fn inputs(conf: &JobConf) -> Result<Vec<ConfDiff>> {
    match conf.get(keys::MUX_INPUTS) {
        None => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| MrError::conf(format!("{} ilegible: {e}", keys::MUX_INPUTS))),
    }
}

/// Agrega una rama: `step` configura su entrada (y opcionalmente su mapper).
pub fn add_input(conf: &mut JobConf, step: &Step) -> Result<()> {
    let mut branches = inputs(conf)?;

    let base = pristine(conf);
    let branch = step.apply(base.clone())?;
    match branch.get(keys::INPUT_FORMAT) {
        None => {
            return Err(MrError::conf(format!(
                "la rama {} no define formato de entrada",
                branches.len()
            )))
        }
        Some("mux") => return Err(MrError::conf("una rama mux no puede ser mux")),
        Some(_) => {}
    }

    // los slots reservados por la rama pasan al job para no repetir índices
    registry::carry_slots(&branch, conf);
    branches.push(branch.diff(&base).without(&[keys::MUX_INPUTS]));

    conf.set(keys::MUX_INPUTS, serde_json::to_string(&branches)?);
    conf.set(keys::INPUT_FORMAT, "mux");
    conf.unset(keys::INPUT_DIR);
    conf.unset(keys::MAP_CLASS);
    Ok(())
}

pub fn mux_step(branches: Vec<Step>) -> Step {
    Step::new(format!("mux x{}", branches.len()), move |mut conf| {
        for branch in &branches {
            add_input(&mut conf, branch)?;
        }
        Ok(conf)
    })
}

/// Configuración con la que corre una tarea de la rama `diff`. El mapper
/// del job vale para toda rama que no declare uno propio.
pub fn branch_conf(conf: &JobConf, diff: &ConfDiff) -> JobConf {
    without(conf, &INPUT_KEYS).merge(diff)
}

fn branch_confs(conf: &JobConf) -> Result<Vec<(ConfDiff, JobConf)>> {
    let branches = inputs(conf)?;
    if branches.is_empty() {
        return Err(MrError::conf("entrada mux sin ramas"));
    }
    Ok(branches
        .into_iter()
        .map(|diff| {
            let sub = branch_conf(conf, &diff);
            (diff, sub)
        })
        .collect())
}

pub struct MuxInputFormat;

impl InputFormat for MuxInputFormat {
    fn splits(&self, conf: &JobConf) -> Result<Vec<InputSplit>> {
        let mut out = Vec::new();
        for (diff, sub) in branch_confs(conf)? {
            for split in input_format(&sub)?.splits(&sub)? {
                out.push(InputSplit {
                    path: split.path,
                    branch: Some(diff.clone()),
                });
            }
        }
        Ok(out)
    }

    fn read(&self, split: &InputSplit, conf: &JobConf) -> Result<Vec<KeyValue>> {
        let diff = split
            .branch
            .as_ref()
            .ok_or_else(|| MrError::conf("split mux sin rama"))?;
        let sub = branch_conf(conf, diff);
        input_format(&sub)?.read(split, &sub)
    }

    fn locations(&self, conf: &JobConf) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for (_, sub) in branch_confs(conf)? {
            for path in input_format(&sub)?.locations(&sub)? {
                if !out.contains(&path) {
                    out.push(path);
                }
            }
        }
        Ok(out)
    }
}
