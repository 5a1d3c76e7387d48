//! Conteo de palabras como par de behaviors registrados.

use serde_json::{json, Value};

use crate::behavior::Behavior;
use crate::conf::JobConf;
use crate::dseq::{DSeq, DSink};
use crate::graph::{self, Stage};
use crate::record::{Shape, ValueKind};

/// Limpia un token: solo alfanumérico y '_', en minúscula.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/// Map: cada línea -> `[palabra, 1]` por token.
pub fn tokenize(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    Ok(Behavior::records(Shape::Vals, Shape::KeyVals, |lines| {
        let mut out = Vec::new();
        for line in lines {
            let Some(line) = line.as_str() else {
                anyhow::bail!("wordcount espera líneas de texto, llegó {line}");
            };
            for raw in line.split_whitespace() {
                let word = normalize(raw);
                if !word.is_empty() {
                    out.push(json!([word, 1]));
                }
            }
        }
        Ok(out)
    }))
}

/// Reduce (o combine): `[palabra, [n...]]` -> `[palabra, suma]`.
pub fn sum(_conf: &JobConf, _args: &[Value]) -> anyhow::Result<Behavior> {
    Ok(Behavior::records(Shape::KeyValGroups, Shape::KeyVals, |groups| {
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            let total: i64 = group[1]
                .as_array()
                .map(|counts| counts.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            out.push(json!([group[0].clone(), total]));
        }
        Ok(out)
    }))
}

/// Grafo de conteo: texto -> (palabra, conteo) en JSONL.
pub fn wordcount_graph(inputs: &[String], output_dir: &str, reduces: usize) -> Stage {
    graph::input(DSeq::text(inputs))
        .map("wordcount.tokenize", vec![])
        .combine("wordcount.sum", vec![])
        .partition(reduces)
        .reduce("wordcount.sum", vec![])
        .output(DSink::jsonl(ValueKind::Text, ValueKind::Long, output_dir))
}
