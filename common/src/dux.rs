//! Salida demultiplexada: una tarea escribe en varias salidas con nombre,
//! cada una con su propio formato, clases de clave/valor y basename.
//!
//! Cada salida se guarda como un diff contra la configuración base bajo
//! `dux.outputs`. Dentro de la tarea los writers se abren recién cuando
//! alguien pide `(nombre, basename)` por primera vez, y se cierran todos
//! juntos al terminar.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::conf::{keys, ConfDiff, JobConf};
use crate::counters::Counter;
use crate::error::{MrError, Result};
use crate::format::{output_format, OutputFormat, RecordWriter, TaskAttemptContext};
use crate::step::Step;
use crate::task::TaskContext;

/// Grupo de contadores: un contador por salida con nombre.
pub const COUNTER_GROUP: &str = "Demultiplexing Output";

/// nombre -> diff de su configuración
pub type DuxOutputs = BTreeMap<String, ConfDiff>;

/// Writer compartido de una salida con nombre.
pub type SharedWriter = Arc<Mutex<NamedWriter>>;

/// Claves que dux fuerza en el job y que ninguna sub-salida debe heredar.
const FORCED_KEYS: [&str; 4] = [
    keys::DUX_OUTPUTS,
    keys::OUTPUT_FORMAT,
    keys::OUTPUT_KEY_CLASS,
    keys::OUTPUT_VALUE_CLASS,
];

fn pristine(conf: &JobConf) -> JobConf {
    let mut base = conf.clone();
    for key in FORCED_KEYS {
        base.unset(key);
    }
    base
}

/// Salidas declaradas en el job (vacío si no hay ninguna).
pub fn outputs(conf: &JobConf) -> Result<DuxOutputs> {
    match conf.get(keys::DUX_OUTPUTS) {
        None => Ok(DuxOutputs::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| MrError::conf(format!("{} ilegible: {e}", keys::DUX_OUTPUTS))),
    }
}

/// Declara la salida `name`: aplica `step` sobre la base limpia y guarda el diff.
pub fn add_output(conf: &mut JobConf, name: &str, step: &Step) -> Result<()> {
    let mut declared = outputs(conf)?;
    if declared.contains_key(name) {
        return Err(MrError::DuplicateOutput(name.to_string()));
    }

    let base = pristine(conf);
    let sub = step.apply(base.clone())?;
    if sub.get(keys::OUTPUT_FORMAT) == Some("dux") {
        return Err(MrError::conf(format!("la salida {name} no puede ser dux")));
    }
    let diff = sub.diff(&base).without(&[keys::DUX_OUTPUTS]);
    declared.insert(name.to_string(), diff);

    conf.set(keys::DUX_OUTPUTS, serde_json::to_string(&declared)?);
    conf.set(keys::OUTPUT_FORMAT, "dux");
    conf.set(keys::OUTPUT_KEY_CLASS, "any");
    conf.set(keys::OUTPUT_VALUE_CLASS, "any");
    debug!("dux: salida {} declarada", name);
    Ok(())
}

/// Paso que declara varias salidas con nombre, en orden.
pub fn dux_step(named: Vec<(String, Step)>) -> Step {
    let label = format!(
        "dux [{}]",
        named.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", ")
    );
    Step::new(label, move |mut conf| {
        for (name, step) in &named {
            add_output(&mut conf, name, step)?;
        }
        Ok(conf)
    })
}

/// Configuración efectiva de la salida `name`.
pub fn sub_conf(conf: &JobConf, name: &str) -> Result<JobConf> {
    let declared = outputs(conf)?;
    let diff = declared
        .get(name)
        .ok_or_else(|| MrError::UnknownOutput(name.to_string()))?;
    Ok(pristine(conf).merge(diff))
}

fn sub_confs(conf: &JobConf) -> Result<Vec<(String, JobConf)>> {
    let base = pristine(conf);
    Ok(outputs(conf)?
        .into_iter()
        .map(|(name, diff)| {
            let sub = base.merge(&diff);
            (name, sub)
        })
        .collect())
}

/// Unión de las ubicaciones de todas las sub-salidas, sin repetidos.
pub fn list_output_paths(conf: &JobConf) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for (_, sub) in sub_confs(conf)? {
        for path in output_format(&sub)?.output_paths(&sub)? {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

/* =========================
   Formato y writer
   ========================= */

pub struct DuxOutputFormat;

impl OutputFormat for DuxOutputFormat {
    fn record_writer(&self, ctx: &TaskAttemptContext) -> Result<Box<dyn RecordWriter>> {
        Ok(Box::new(DuxRecordWriter::new(ctx.clone())?))
    }

    fn output_paths(&self, conf: &JobConf) -> Result<Vec<PathBuf>> {
        list_output_paths(conf)
    }

    fn check_output_specs(&self, conf: &JobConf) -> Result<()> {
        for (_, sub) in sub_confs(conf)? {
            output_format(&sub)?.check_output_specs(&sub)?;
        }
        Ok(())
    }

    fn commit_job(&self, conf: &JobConf) -> Result<()> {
        for (_, sub) in sub_confs(conf)? {
            output_format(&sub)?.commit_job(&sub)?;
        }
        Ok(())
    }
}

/// Writer de una sub-salida, con su contador.
pub struct NamedWriter {
    name: String,
    inner: Box<dyn RecordWriter>,
    ctx: TaskAttemptContext,
    counter: Counter,
    closed: bool,
}

impl NamedWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&mut self, key: &Value, value: &Value) -> Result<()> {
        if self.closed {
            return Err(MrError::WriterClosed);
        }
        self.inner.write(key, value)?;
        self.counter.increment(1);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.inner.close(&self.ctx)
    }
}

type CacheKey = (String, Option<String>);

#[derive(Default)]
struct WriterCache {
    writers: BTreeMap<CacheKey, SharedWriter>,
    closed: bool,
}

/// Writer de salida de una tarea dux. No acepta `write` directo: hay que
/// elegir la salida con [`write`] o [`write_base`].
pub struct DuxRecordWriter {
    ctx: TaskAttemptContext,
    outputs: DuxOutputs,
    cache: Mutex<WriterCache>,
}

impl DuxRecordWriter {
    pub fn new(ctx: TaskAttemptContext) -> Result<Self> {
        let outputs = outputs(&ctx.conf)?;
        Ok(Self {
            ctx,
            outputs,
            cache: Mutex::new(WriterCache::default()),
        })
    }

    /// Writer para `(name, basename)`; se abre la primera vez y después se reutiliza.
    pub fn get_writer(&self, name: &str, basename: Option<&str>) -> Result<SharedWriter> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.closed {
            return Err(MrError::WriterClosed);
        }

        let key = (name.to_string(), basename.map(str::to_string));
        if let Some(writer) = cache.writers.get(&key) {
            return Ok(Arc::clone(writer));
        }

        let diff = self
            .outputs
            .get(name)
            .ok_or_else(|| MrError::UnknownOutput(name.to_string()))?;
        let mut conf = pristine(&self.ctx.conf).merge(diff);
        if let Some(basename) = basename {
            conf.set(keys::OUTPUT_BASENAME, basename);
        }
        let sub_ctx = TaskAttemptContext {
            conf,
            attempt: self.ctx.attempt.clone(),
            counters: self.ctx.counters.clone(),
        };
        let inner = output_format(&sub_ctx.conf)?.record_writer(&sub_ctx)?;

        debug!("dux: writer abierto para {} ({:?})", name, basename);
        let writer = Arc::new(Mutex::new(NamedWriter {
            name: name.to_string(),
            inner,
            counter: self.ctx.counters.counter(COUNTER_GROUP, name),
            ctx: sub_ctx,
            closed: false,
        }));
        cache.writers.insert(key, Arc::clone(&writer));
        Ok(writer)
    }

    pub fn write(&self, name: &str, key: &Value, value: &Value) -> Result<()> {
        self.write_to(name, None, key, value)
    }

    pub fn write_base(&self, name: &str, basename: &str, key: &Value, value: &Value) -> Result<()> {
        self.write_to(name, Some(basename), key, value)
    }

    fn write_to(&self, name: &str, basename: Option<&str>, key: &Value, value: &Value) -> Result<()> {
        let writer = self.get_writer(name, basename)?;
        let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write(key, value)
    }

    /// Cierra todos los writers pedidos, aunque no hayan recibido registros.
    /// Si alguno falla se siguen cerrando los demás y se devuelve el primer error.
    pub fn close_all(&self) -> Result<()> {
        let writers = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.closed = true;
            std::mem::take(&mut cache.writers)
        };

        let mut first_err = None;
        for ((name, basename), writer) in writers {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = writer.close() {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!("dux: error cerrando {} ({:?}): {}", name, basename, e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl RecordWriter for DuxRecordWriter {
    fn write(&mut self, _key: &Value, _value: &Value) -> Result<()> {
        Err(MrError::conf(
            "la salida es dux: hay que escribir con dux::write o dux::write_base",
        ))
    }

    fn close(&mut self, _ctx: &TaskAttemptContext) -> Result<()> {
        self.close_all()
    }

    fn as_dux(&self) -> Option<&DuxRecordWriter> {
        Some(self)
    }
}

/* =========================
   Uso desde una tarea
   ========================= */

/// Router dux de la tarea.
pub fn router(ctx: &TaskContext) -> Result<&DuxRecordWriter> {
    ctx.output()
        .as_dux()
        .ok_or_else(|| MrError::conf("la salida de la tarea no es dux"))
}

pub fn get_writer(ctx: &TaskContext, name: &str, basename: Option<&str>) -> Result<SharedWriter> {
    router(ctx)?.get_writer(name, basename)
}

/// Escribe en el canal fijo `name`.
pub fn write(ctx: &TaskContext, name: &str, key: &Value, value: &Value) -> Result<()> {
    router(ctx)?.write(name, key, value)
}

/// Escribe en `name` con un basename calculado por registro.
pub fn write_base(
    ctx: &TaskContext,
    name: &str,
    basename: &str,
    key: &Value,
    value: &Value,
) -> Result<()> {
    router(ctx)?.write_base(name, basename, key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::task::{TaskAttemptId, TaskKind};
    use serde_json::json;
    use std::fs;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("mr_dux_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn jsonl_to(dir: &std::path::Path) -> Step {
        Step::props([
            (keys::OUTPUT_FORMAT, "jsonl".to_string()),
            (keys::OUTPUT_DIR, dir.to_string_lossy().to_string()),
        ])
    }

    fn dux_conf(named: Vec<(&str, Step)>) -> JobConf {
        let named = named.into_iter().map(|(n, s)| (n.to_string(), s)).collect();
        dux_step(named).apply(JobConf::new()).unwrap()
    }

    fn router_for(conf: &JobConf) -> (DuxRecordWriter, Counters) {
        let counters = Counters::new();
        let ctx = TaskAttemptContext {
            conf: conf.clone(),
            attempt: TaskAttemptId::new("dux", TaskKind::Map, 0, 0),
            counters: counters.clone(),
        };
        (DuxRecordWriter::new(ctx).unwrap(), counters)
    }

    #[test]
    fn add_output_fuerza_formato_dux_y_no_anida() {
        let tmp = temp_dir("add_output");
        let conf = dux_conf(vec![("a", jsonl_to(&tmp.join("a")))]);
        assert_eq!(conf.get(keys::OUTPUT_FORMAT), Some("dux"));
        assert_eq!(conf.get(keys::OUTPUT_KEY_CLASS), Some("any"));

        let declared = outputs(&conf).unwrap();
        assert_eq!(declared["a"].get(keys::OUTPUT_FORMAT), Some(Some("jsonl")));
        assert!(declared["a"].get(keys::DUX_OUTPUTS).is_none());

        let sub = sub_conf(&conf, "a").unwrap();
        assert_eq!(sub.get(keys::OUTPUT_FORMAT), Some("jsonl"));
        assert!(sub.get(keys::DUX_OUTPUTS).is_none());
    }

    #[test]
    fn nombre_duplicado_es_error() {
        let tmp = temp_dir("duplicate");
        let mut conf = dux_conf(vec![("a", jsonl_to(&tmp.join("a")))]);
        let err = add_output(&mut conf, "a", &jsonl_to(&tmp.join("b"))).unwrap_err();
        assert!(matches!(err, MrError::DuplicateOutput(name) if name == "a"));
    }

    #[test]
    fn get_writer_cachea_por_nombre_y_basename() {
        let tmp = temp_dir("cache");
        let conf = dux_conf(vec![("a", jsonl_to(&tmp.join("a")))]);
        let (router, _) = router_for(&conf);

        let w1 = router.get_writer("a", Some("base1")).unwrap();
        let w2 = router.get_writer("a", Some("base1")).unwrap();
        let w3 = router.get_writer("a", Some("base2")).unwrap();
        assert!(Arc::ptr_eq(&w1, &w2));
        assert!(!Arc::ptr_eq(&w1, &w3));

        router.close_all().unwrap();
        assert!(tmp.join("a").join("base1-m-00000.jsonl").exists());
        assert!(tmp.join("a").join("base2-m-00000.jsonl").exists());
    }

    #[test]
    fn close_cierra_todos_los_writers_pedidos() {
        let tmp = temp_dir("close_all");
        let conf = dux_conf(vec![
            ("a", jsonl_to(&tmp.join("a"))),
            ("b", jsonl_to(&tmp.join("b"))),
        ]);
        let (router, counters) = router_for(&conf);

        let b = router.get_writer("b", None).unwrap();
        for i in 0..3 {
            router.write("a", &json!(i), &json!("x")).unwrap();
        }
        router.close_all().unwrap();

        let a_out = fs::read_to_string(tmp.join("a").join("part-m-00000.jsonl")).unwrap();
        assert_eq!(a_out.lines().count(), 3);
        assert_eq!(fs::read_to_string(tmp.join("b").join("part-m-00000.jsonl")).unwrap(), "");
        assert_eq!(counters.value(COUNTER_GROUP, "a"), 3);
        assert_eq!(counters.value(COUNTER_GROUP, "b"), 0);

        // después de cerrar no se escribe más, ni por el router ni por un handle viejo
        assert!(matches!(router.write("a", &json!(1), &json!(1)), Err(MrError::WriterClosed)));
        assert!(matches!(
            b.lock().unwrap().write(&json!(1), &json!(1)),
            Err(MrError::WriterClosed)
        ));
        // cerrar dos veces no falla
        router.close_all().unwrap();
    }

    #[test]
    fn close_sigue_cerrando_tras_un_error() {
        let tmp = temp_dir("close_error");
        // x2 choca con x1 y z2 con z1; se cierra en orden de nombre
        let conf = dux_conf(vec![
            ("x1", jsonl_to(&tmp.join("x"))),
            ("x2", jsonl_to(&tmp.join("x"))),
            ("y", jsonl_to(&tmp.join("y"))),
            ("z1", jsonl_to(&tmp.join("z"))),
            ("z2", jsonl_to(&tmp.join("z"))),
        ]);
        let (router, _) = router_for(&conf);
        for (i, name) in ["x1", "x2", "y", "z1", "z2"].into_iter().enumerate() {
            router.write(name, &json!(i), &json!(i)).unwrap();
        }

        let x_file = tmp.join("x").join("part-m-00000.jsonl");
        match router.close_all() {
            Err(MrError::Format(msg)) => {
                assert!(msg.contains(&x_file.display().to_string()), "{msg}");
            }
            other => panic!("se esperaba el error de x2, llegó {other:?}"),
        }
        assert!(tmp.join("y").join("part-m-00000.jsonl").exists());
        assert!(tmp.join("z").join("part-m-00000.jsonl").exists());
    }

    #[test]
    fn nombre_desconocido_es_error() {
        let tmp = temp_dir("unknown");
        let conf = dux_conf(vec![("a", jsonl_to(&tmp.join("a")))]);
        let (router, _) = router_for(&conf);
        let err = router.write("zzz", &json!(1), &json!(1)).unwrap_err();
        assert!(matches!(err, MrError::UnknownOutput(name) if name == "zzz"));
    }

    #[test]
    fn write_directo_sobre_dux_es_error() {
        let tmp = temp_dir("direct");
        let conf = dux_conf(vec![("a", jsonl_to(&tmp.join("a")))]);
        let (mut router, _) = router_for(&conf);
        assert!(RecordWriter::write(&mut router, &json!(1), &json!(1)).is_err());
    }

    #[test]
    fn list_output_paths_es_la_union_sin_repetidos() {
        let tmp = temp_dir("paths");
        let conf = dux_conf(vec![
            ("a", jsonl_to(&tmp.join("uno"))),
            ("b", jsonl_to(&tmp.join("dos"))),
            ("c", jsonl_to(&tmp.join("uno")).then(Step::set(keys::OUTPUT_BASENAME, "c"))),
            ("nada", Step::set(keys::OUTPUT_FORMAT, "null")),
        ]);
        let paths = list_output_paths(&conf).unwrap();
        assert_eq!(paths, vec![tmp.join("uno"), tmp.join("dos")]);
        assert_eq!(DuxOutputFormat.output_paths(&conf).unwrap(), paths);
    }
}
