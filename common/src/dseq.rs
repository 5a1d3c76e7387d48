//! Secuencias y sumideros distribuidos: una ubicación más el paso que
//! configura un job para leerla o escribirla.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::conf::{keys, JobConf};
use crate::dux;
use crate::error::Result;
use crate::format::input_format;
use crate::mux;
use crate::record::{KeyValue, ValueKind};
use crate::step::Step;

/// Secuencia de entrada: el paso que fija formato y rutas de entrada, y las
/// ubicaciones que lee.
#[derive(Clone)]
pub struct DSeq {
    step: Step,
    locations: Vec<PathBuf>,
}

impl DSeq {
    pub fn new(step: Step, locations: Vec<PathBuf>) -> Self {
        Self { step, locations }
    }

    fn files<I, P>(format: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let locations: Vec<PathBuf> = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        let joined = locations
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(",");
        let step = Step::props([
            (keys::INPUT_FORMAT, format.to_string()),
            (keys::INPUT_DIR, joined),
        ]);
        Self::new(step, locations)
    }

    /// Líneas de texto: clave = número de línea, valor = la línea.
    pub fn text<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self::files("text", paths)
    }

    /// Líneas `clave<TAB>valor` como las deja [`DSink::text`]; cada lado se
    /// decodifica con la clase indicada.
    pub fn key_value_text<I, P>(paths: I, key: ValueKind, value: ValueKind) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let seq = Self::files("kvtext", paths);
        let step = seq.step.clone().then(Step::props([
            (keys::INPUT_KEY_CLASS, key.to_string()),
            (keys::INPUT_VALUE_CLASS, value.to_string()),
        ]));
        Self::new(step, seq.locations)
    }

    pub fn jsonl<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self::files("jsonl", paths)
    }

    pub fn csv<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self::files("csv", paths)
    }

    /// Varias secuencias leídas por un mismo job (entrada mux).
    pub fn multi(seqs: Vec<DSeq>) -> Self {
        let mut locations = Vec::new();
        for seq in &seqs {
            for loc in &seq.locations {
                if !locations.contains(loc) {
                    locations.push(loc.clone());
                }
            }
        }
        let step = mux::mux_step(seqs.into_iter().map(|s| s.step).collect());
        Self::new(step, locations)
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Lee todos los registros en el proceso actual, con el formato de la secuencia.
    pub fn read(&self) -> Result<Vec<KeyValue>> {
        if self.locations.is_empty() {
            return Ok(Vec::new());
        }
        let conf = self.step.apply(JobConf::new())?;
        let format = input_format(&conf)?;
        let mut out = Vec::new();
        for split in format.splits(&conf)? {
            out.extend(format.read(&split, &conf)?);
        }
        Ok(out)
    }
}

impl fmt::Debug for DSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DSeq")
            .field("step", &self.step.label())
            .field("locations", &self.locations)
            .finish()
    }
}

/// Sumidero: el paso que configura la salida y la secuencia que la vuelve a leer.
#[derive(Clone)]
pub struct DSink {
    dseq: DSeq,
    step: Step,
}

impl DSink {
    pub fn new(dseq: DSeq, step: Step) -> Self {
        Self { dseq, step }
    }

    fn files(format: &str, key: ValueKind, value: ValueKind, dir: &Path, dseq: DSeq) -> Self {
        let step = Step::props([
            (keys::OUTPUT_FORMAT, format.to_string()),
            (keys::OUTPUT_DIR, dir.to_string_lossy().to_string()),
            (keys::OUTPUT_KEY_CLASS, key.to_string()),
            (keys::OUTPUT_VALUE_CLASS, value.to_string()),
        ]);
        Self::new(dseq, step)
    }

    /// Pares `[clave, valor]` en JSONL; se releen con [`DSeq::jsonl`].
    pub fn jsonl(key: ValueKind, value: ValueKind, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::files("jsonl", key, value, dir, DSeq::jsonl([dir]))
    }

    /// `clave<TAB>valor` por línea; se releen con [`DSeq::key_value_text`]
    /// usando las mismas clases.
    pub fn text(key: ValueKind, value: ValueKind, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::files("text", key, value, dir, DSeq::key_value_text([dir], key, value))
    }

    /// Descarta la salida.
    pub fn null() -> Self {
        Self::new(
            DSeq::new(Step::identity(), Vec::new()),
            Step::set(keys::OUTPUT_FORMAT, "null"),
        )
    }

    /// Salidas con nombre (dux); la secuencia lee todas juntas.
    pub fn dux<N: Into<String>>(outputs: Vec<(N, DSink)>) -> Self {
        let mut named = Vec::with_capacity(outputs.len());
        let mut seqs = Vec::new();
        for (name, sink) in outputs {
            if !sink.dseq.locations.is_empty() {
                seqs.push(sink.dseq.clone());
            }
            named.push((name.into(), sink.step));
        }
        Self::new(DSeq::multi(seqs), dux::dux_step(named))
    }

    pub fn dseq(&self) -> &DSeq {
        &self.dseq
    }

    pub fn step(&self) -> &Step {
        &self.step
    }
}

impl fmt::Debug for DSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DSink")
            .field("step", &self.step.label())
            .field("dseq", &self.dseq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::format::{output_format, TaskAttemptContext};
    use crate::task::{TaskAttemptId, TaskKind};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::fs;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("mr_dseq_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn pasos_solo_tocan_sus_claves() {
        let base: JobConf = [("otra.clave", "x"), (keys::NUM_REDUCES, "3")]
            .into_iter()
            .collect();

        let seq = DSeq::text(["/datos/a.txt", "/datos/b"]);
        let diff = seq.step().apply(base.clone()).unwrap().diff(&base);
        let touched: BTreeSet<&str> = diff.keys().collect();
        assert_eq!(touched, BTreeSet::from([keys::INPUT_DIR, keys::INPUT_FORMAT]));
        assert_eq!(diff.get(keys::INPUT_DIR), Some(Some("/datos/a.txt,/datos/b")));

        let sink = DSink::jsonl(ValueKind::Text, ValueKind::Long, "/salida");
        let diff = sink.step().apply(base.clone()).unwrap().diff(&base);
        let touched: BTreeSet<&str> = diff.keys().collect();
        assert_eq!(
            touched,
            BTreeSet::from([
                keys::OUTPUT_KEY_CLASS,
                keys::OUTPUT_VALUE_CLASS,
                keys::OUTPUT_FORMAT,
                keys::OUTPUT_DIR,
            ])
        );

        // aplicar dos veces da lo mismo
        let once = sink.step().apply(base.clone()).unwrap();
        let twice = sink.step().apply(once.clone()).unwrap();
        assert!(twice.diff(&once).is_empty());
    }

    #[test]
    fn sink_y_su_secuencia_hacen_round_trip() {
        let tmp = temp_dir("round_trip");
        let out = tmp.join("out");
        let sink = DSink::jsonl(ValueKind::Text, ValueKind::Any, &out);
        let conf = sink.step().apply(JobConf::new()).unwrap();

        let ctx = TaskAttemptContext {
            conf: conf.clone(),
            attempt: TaskAttemptId::new("rt", TaskKind::Reduce, 0, 0),
            counters: Counters::new(),
        };
        let mut w = output_format(&conf).unwrap().record_writer(&ctx).unwrap();
        w.write(&json!("a"), &json!({"n": 1})).unwrap();
        w.write(&json!("b"), &json!([1, 2])).unwrap();
        w.close(&ctx).unwrap();

        assert_eq!(
            sink.dseq().read().unwrap(),
            vec![(json!("a"), json!({"n": 1})), (json!("b"), json!([1, 2]))]
        );
        assert_eq!(sink.dseq().locations(), &[out]);
    }

    #[test]
    fn sink_de_texto_y_su_secuencia_hacen_round_trip() {
        let tmp = temp_dir("text_round_trip");
        let out = tmp.join("out");
        let sink = DSink::text(ValueKind::Text, ValueKind::Long, &out);
        let conf = sink.step().apply(JobConf::new()).unwrap();

        let ctx = TaskAttemptContext {
            conf: conf.clone(),
            attempt: TaskAttemptId::new("rt", TaskKind::Reduce, 0, 0),
            counters: Counters::new(),
        };
        let mut w = output_format(&conf).unwrap().record_writer(&ctx).unwrap();
        w.write(&json!("a"), &json!(1)).unwrap();
        w.write(&json!("10"), &json!(20)).unwrap();
        w.close(&ctx).unwrap();

        assert_eq!(
            sink.dseq().read().unwrap(),
            vec![(json!("a"), json!(1)), (json!("10"), json!(20))]
        );
    }

    #[test]
    fn dux_sink_lee_la_union_de_sus_salidas() {
        let tmp = temp_dir("dux_sink");
        let sink = DSink::dux(vec![
            ("a", DSink::jsonl(ValueKind::Any, ValueKind::Any, tmp.join("a"))),
            ("b", DSink::text(ValueKind::Any, ValueKind::Any, tmp.join("b"))),
            ("nada", DSink::null()),
        ]);
        assert_eq!(sink.dseq().locations(), &[tmp.join("a"), tmp.join("b")]);

        let conf = sink.step().apply(JobConf::new()).unwrap();
        assert_eq!(conf.get(keys::OUTPUT_FORMAT), Some("dux"));
        assert_eq!(dux::outputs(&conf).unwrap().len(), 3);

        let read_conf = sink.dseq().step().apply(JobConf::new()).unwrap();
        assert_eq!(read_conf.get(keys::INPUT_FORMAT), Some("mux"));
        assert_eq!(mux::inputs(&read_conf).unwrap().len(), 2);
    }

    #[test]
    fn null_sink_no_tiene_ubicaciones() {
        let sink = DSink::null();
        assert!(sink.dseq().locations().is_empty());
        assert!(sink.dseq().read().unwrap().is_empty());
    }
}
