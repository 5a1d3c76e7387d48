use serde_json::{json, Value};
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    fs::{self, File},
    hash::{Hash, Hasher},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::behavior::{Behavior, PartitionFn};
use crate::counters::Counters;
use crate::error::{MrError, Result};
use crate::format::{RecordWriter, TaskAttemptContext};
use crate::record::{key_text, KeyGroup, KeyValue, TaskRecords};

const DEFAULT_MAX_IN_MEM_RECORDS: usize = 100_000;

/// Umbral de pares en memoria antes de volcar a disco.
/// Se puede sobreescribir con la env var MAX_IN_MEM_RECORDS.
fn max_in_mem_records() -> usize {
    std::env::var("MAX_IN_MEM_RECORDS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_IN_MEM_RECORDS)
}

/// Identidad de una clave: su JSON canónico, así `"1"` y `1` no se mezclan.
fn canonical(key: &Value) -> String {
    key.to_string()
}

/// Partición por defecto: hash estable de la clave.
pub fn hash_key_to_partition(key: &Value, num_partitions: usize) -> usize {
    let mut h = DefaultHasher::new();
    canonical(key).hash(&mut h);
    (h.finish() % num_partitions.max(1) as u64) as usize
}

/// Carpeta donde una tarea map deja sus particiones.
pub fn map_output_dir(shuffle_dir: &Path, map_index: usize) -> PathBuf {
    shuffle_dir.join(format!("map-{:05}", map_index))
}

pub fn partition_file(map_dir: &Path, partition: usize) -> PathBuf {
    map_dir.join(format!("part-{}.jsonl", partition))
}

/// Archivos que tiene que leer la tarea reduce `partition`, uno por map.
pub fn partition_inputs(shuffle_dir: &Path, partition: usize) -> Result<Vec<PathBuf>> {
    if !shuffle_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(shuffle_dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|dir| partition_file(&dir, partition))
        .filter(|f| f.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Lee un archivo de partición (JSONL `[clave, valor]`).
pub fn read_partition(path: &Path) -> Result<Vec<KeyValue>> {
    let reader = BufReader::new(File::open(path)?);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (k, v): (Value, Value) = serde_json::from_str(&line).map_err(|e| {
            MrError::format(format!("error al parsear partición {}: {e}", path.display()))
        })?;
        out.push((k, v));
    }

    Ok(out)
}

/// Agrupa pares por clave; determinista: ordenado por texto de la clave y,
/// a igual texto, por su JSON.
pub fn group_sorted(pairs: Vec<KeyValue>) -> Vec<KeyGroup> {
    let mut groups: BTreeMap<(String, String), KeyGroup> = BTreeMap::new();
    for (k, v) in pairs {
        groups
            .entry((key_text(&k), canonical(&k)))
            .or_insert_with(|| (k, Vec::new()))
            .1
            .push(v);
    }
    groups.into_values().collect()
}

/// Salida de una tarea map cuando el job tiene reduces: reparte cada par en
/// su partición, aplica el combiner y escribe un JSONL por partición.
pub struct ShuffleWriter {
    dir: PathBuf,
    partitioner: Option<PartitionFn>,
    combiner: Option<Behavior>,
    buffers: Vec<Vec<KeyValue>>,
    buffered: usize,
    threshold: usize,
    writers: Vec<BufWriter<File>>,
    counters: Counters,
    closed: bool,
}

impl ShuffleWriter {
    pub fn new(
        dir: PathBuf,
        num_partitions: usize,
        partitioner: Option<PartitionFn>,
        combiner: Option<Behavior>,
        counters: Counters,
    ) -> Result<Self> {
        if num_partitions == 0 {
            return Err(MrError::conf("shuffle sin particiones"));
        }
        fs::create_dir_all(&dir)?;

        // Abrimos un writer por partición
        let mut writers = Vec::with_capacity(num_partitions);
        for pid in 0..num_partitions {
            let file = File::create(partition_file(&dir, pid))?;
            writers.push(BufWriter::new(file));
        }

        Ok(Self {
            dir,
            partitioner,
            combiner,
            buffers: vec![Vec::new(); num_partitions],
            buffered: 0,
            threshold: max_in_mem_records(),
            writers,
            counters,
            closed: false,
        })
    }

    fn num_partitions(&self) -> usize {
        self.writers.len()
    }

    fn partition_of(&self, key: &Value, value: &Value) -> Result<usize> {
        let n = self.num_partitions();
        let pid = match &self.partitioner {
            Some(f) => f(key, value, n),
            None => hash_key_to_partition(key, n),
        };
        if pid >= n {
            return Err(MrError::conf(format!(
                "el particionador devolvió {pid} con {n} particiones"
            )));
        }
        Ok(pid)
    }

    /// Vuelca lo acumulado en memoria (combinado si hay combiner).
    fn spill(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        for pid in 0..self.buffers.len() {
            let pairs = std::mem::take(&mut self.buffers[pid]);
            if pairs.is_empty() {
                continue;
            }

            let pairs = match self.combiner.as_mut() {
                Some(combiner) => {
                    let before = pairs.len() as u64;
                    let combined = combiner.run_records(TaskRecords::Groups(group_sorted(pairs)))?;
                    self.counters
                        .counter(crate::task::TASK_GROUP, "combine_input_records")
                        .increment(before);
                    self.counters
                        .counter(crate::task::TASK_GROUP, "combine_output_records")
                        .increment(combined.len() as u64);
                    combined
                }
                None => pairs,
            };

            let writer = &mut self.writers[pid];
            for (k, v) in pairs {
                serde_json::to_writer(&mut *writer, &json!([k, v]))?;
                writer.write_all(b"\n")?;
            }
        }

        debug!("spill de {} pares en {}", self.buffered, self.dir.display());
        self.buffered = 0;
        Ok(())
    }
}

impl RecordWriter for ShuffleWriter {
    fn write(&mut self, key: &Value, value: &Value) -> Result<()> {
        if self.closed {
            return Err(MrError::WriterClosed);
        }
        let pid = self.partition_of(key, value)?;
        self.buffers[pid].push((key.clone(), value.clone()));
        self.buffered += 1;
        if self.buffered >= self.threshold {
            self.spill()?;
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &TaskAttemptContext) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.spill()?;
        for w in self.writers.iter_mut() {
            w.flush()?;
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::JobConf;
    use crate::record::Shape;
    use crate::task::{TaskAttemptId, TaskKind};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("mr_shuffle_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn ctx() -> TaskAttemptContext {
        TaskAttemptContext {
            conf: JobConf::new(),
            attempt: TaskAttemptId::new("j", TaskKind::Map, 0, 0),
            counters: Counters::new(),
        }
    }

    #[test]
    fn hash_key_to_partition_retorna_id_en_rango() {
        let n = 10;
        for key in [json!("a"), json!("b"), json!(3), json!(["x", 1]), json!(null)] {
            let pid = hash_key_to_partition(&key, n);
            assert!(pid < n);
            assert_eq!(pid, hash_key_to_partition(&key, n));
        }
    }

    #[test]
    fn group_sorted_agrupa_y_ordena() {
        let groups = group_sorted(vec![
            (json!("b"), json!(1)),
            (json!("a"), json!(2)),
            (json!("b"), json!(3)),
        ]);
        assert_eq!(
            groups,
            vec![(json!("a"), vec![json!(2)]), (json!("b"), vec![json!(1), json!(3)])]
        );
    }

    #[test]
    fn claves_de_distinto_tipo_no_se_agrupan_juntas() {
        let groups = group_sorted(vec![
            (json!("1"), json!("s")),
            (json!(1), json!("n")),
            (json!("true"), json!("s")),
            (json!(true), json!("b")),
            (json!("1"), json!("s2")),
        ]);
        assert_eq!(
            groups,
            vec![
                (json!("1"), vec![json!("s"), json!("s2")]),
                (json!(1), vec![json!("n")]),
                (json!("true"), vec![json!("s")]),
                (json!(true), vec![json!("b")]),
            ]
        );
    }

    #[test]
    fn shuffle_writer_reparte_por_particion_y_combina() {
        let tmp = temp_dir("writer");
        let map_dir = map_output_dir(&tmp, 0);

        // combiner que suma los valores de cada clave
        let combiner = Behavior::records(Shape::KeyValGroups, Shape::KeyVals, |groups| {
            Ok(groups
                .into_iter()
                .map(|g| {
                    let total: i64 = g[1].as_array().unwrap().iter().filter_map(|v| v.as_i64()).sum();
                    json!([g[0].clone(), total])
                })
                .collect())
        });
        let partitioner: PartitionFn = Box::new(|k: &Value, _v: &Value, _n: usize| {
            if k.as_str() == Some("a") {
                0
            } else {
                1
            }
        });

        let counters = Counters::new();
        let mut w =
            ShuffleWriter::new(map_dir.clone(), 2, Some(partitioner), Some(combiner), counters.clone())
                .unwrap();
        for (k, v) in [("a", 1), ("b", 1), ("a", 2), ("c", 5)] {
            w.write(&json!(k), &json!(v)).unwrap();
        }
        w.close(&ctx()).unwrap();

        let p0 = read_partition(&partition_file(&map_dir, 0)).unwrap();
        let p1 = read_partition(&partition_file(&map_dir, 1)).unwrap();
        assert_eq!(p0, vec![(json!("a"), json!(3))]);
        assert_eq!(p1, vec![(json!("b"), json!(1)), (json!("c"), json!(5))]);
        assert_eq!(counters.value(crate::task::TASK_GROUP, "combine_input_records"), 4);

        assert_eq!(partition_inputs(&tmp, 1).unwrap(), vec![partition_file(&map_dir, 1)]);
        assert!(w.write(&json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn particion_fuera_de_rango_es_error() {
        let tmp = temp_dir("out_of_range");
        let partitioner: PartitionFn = Box::new(|_k: &Value, _v: &Value, n: usize| n);
        let mut w =
            ShuffleWriter::new(tmp.join("m"), 2, Some(partitioner), None, Counters::new()).unwrap();
        assert!(w.write(&json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn partition_inputs_sin_shuffle_devuelve_vacio() {
        let tmp = temp_dir("no_shuffle");
        assert!(partition_inputs(&tmp.join("nada"), 0).unwrap().is_empty());
    }
}
