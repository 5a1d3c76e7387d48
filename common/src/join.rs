//! Join interno entre dos CSV por una columna.
//!
//! Cada lado pasa por `join.key_by` con su etiqueta; ambos caen en el mismo
//! shuffle (entrada mux) y `join.inner` cruza las filas de cada clave.

use anyhow::{anyhow, bail};
use serde_json::{json, Value};
use std::path::Path;

use crate::behavior::Behavior;
use crate::conf::JobConf;
use crate::dseq::{DSeq, DSink};
use crate::graph::{self, Stage};
use crate::record::{key_text, Shape, ValueKind};

pub const LEFT: &str = "left";
pub const RIGHT: &str = "right";

/// Map: fila -> `[fila[columna], {"side": lado, "row": fila}]`.
/// Argumentos: `[columna, lado]`. Filas sin la columna se descartan.
pub fn key_by(_conf: &JobConf, args: &[Value]) -> anyhow::Result<Behavior> {
    let column = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("join.key_by necesita la columna como primer argumento"))?
        .to_string();
    let side = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("join.key_by necesita el lado como segundo argumento"))?
        .to_string();
    if side != LEFT && side != RIGHT {
        bail!("lado de join desconocido: {side}");
    }

    Ok(Behavior::records(Shape::Vals, Shape::KeyVals, move |rows| {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(key) = row.get(&column) else {
                continue;
            };
            let key = key_text(key);
            out.push(json!([key, {"side": side, "row": row}]));
        }
        Ok(out)
    }))
}

/// Reduce: `[clave, [etiquetadas...]]` -> un `[clave, {"left", "right"}]`
/// por cada combinación de filas de los dos lados.
pub fn inner(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    Ok(Behavior::records(Shape::KeyValGroups, Shape::KeyVals, |groups| {
        let mut out = Vec::new();
        for group in groups {
            let key = &group[0];
            let tagged = group[1].as_array().cloned().unwrap_or_default();

            let (mut left, mut right) = (Vec::new(), Vec::new());
            for item in tagged {
                match item.get("side").and_then(Value::as_str) {
                    Some(LEFT) => left.push(item["row"].clone()),
                    Some(RIGHT) => right.push(item["row"].clone()),
                    _ => bail!("registro de join sin lado: {item}"),
                }
            }

            for l in &left {
                for r in &right {
                    out.push(json!([key, {"left": l, "right": r}]));
                }
            }
        }
        Ok(out)
    }))
}

/// Grafo del join: dos CSV -> `[clave, {"left", "right"}]` en JSONL.
pub fn join_graph(
    left: impl AsRef<Path>,
    right: impl AsRef<Path>,
    column: &str,
    output_dir: impl AsRef<Path>,
    reduces: usize,
) -> Stage {
    let branch = |path: &Path, side: &str| {
        graph::input(DSeq::csv([path])).map("join.key_by", vec![json!(column), json!(side)])
    };
    graph::partition(
        vec![branch(left.as_ref(), LEFT), branch(right.as_ref(), RIGHT)],
        reduces,
    )
    .reduce("join.inner", vec![])
    .output(DSink::jsonl(ValueKind::Text, ValueKind::Json, output_dir))
}
