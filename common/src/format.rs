//! Formatos de entrada y salida.
//!
//! El formato se elige por nombre en la configuración del job, igual que una
//! clase en un engine MapReduce clásico, pero acá es un conjunto cerrado.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::conf::{keys, ConfDiff, JobConf};
use crate::counters::Counters;
use crate::dux::{DuxOutputFormat, DuxRecordWriter};
use crate::error::{MrError, Result};
use crate::mux::MuxInputFormat;
use crate::record::{KeyValue, ValueKind};
use crate::task::TaskAttemptId;

/// Basename por defecto de los archivos de salida.
pub const DEFAULT_BASENAME: &str = "part";

/// Directorio de trabajo de los intentos dentro de cada salida.
pub const TEMPORARY_DIR: &str = "_temporary";

/// Lo que un formato de salida necesita saber del intento que escribe.
#[derive(Debug, Clone)]
pub struct TaskAttemptContext {
    pub conf: JobConf,
    pub attempt: TaskAttemptId,
    pub counters: Counters,
}

pub trait RecordWriter: Send {
    fn write(&mut self, key: &Value, value: &Value) -> Result<()>;

    fn close(&mut self, ctx: &TaskAttemptContext) -> Result<()>;

    /// Sólo la salida dux se deja usar como router de salidas con nombre.
    fn as_dux(&self) -> Option<&DuxRecordWriter> {
        None
    }
}

pub trait OutputFormat: Send + Sync {
    fn record_writer(&self, ctx: &TaskAttemptContext) -> Result<Box<dyn RecordWriter>>;

    /// Ubicaciones físicas donde queda lo escrito.
    fn output_paths(&self, conf: &JobConf) -> Result<Vec<PathBuf>>;

    /// Validación previa al envío del job.
    fn check_output_specs(&self, _conf: &JobConf) -> Result<()> {
        Ok(())
    }

    /// Limpieza al terminar el job con éxito.
    fn commit_job(&self, _conf: &JobConf) -> Result<()> {
        Ok(())
    }
}

/// Unidad de lectura de una tarea map: un archivo, y si viene de una
/// entrada multiplexada, el diff de configuración de su rama.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSplit {
    pub path: PathBuf,
    #[serde(default)]
    pub branch: Option<ConfDiff>,
}

pub trait InputFormat: Send + Sync {
    fn splits(&self, conf: &JobConf) -> Result<Vec<InputSplit>>;

    fn read(&self, split: &InputSplit, conf: &JobConf) -> Result<Vec<KeyValue>>;

    /// Ubicaciones configuradas, sin expandir.
    fn locations(&self, conf: &JobConf) -> Result<Vec<PathBuf>>;
}

pub fn output_format(conf: &JobConf) -> Result<Box<dyn OutputFormat>> {
    match conf.get(keys::OUTPUT_FORMAT) {
        Some("text") => Ok(Box::new(FileOutputFormat::new(LineEncoding::Text))),
        Some("jsonl") => Ok(Box::new(FileOutputFormat::new(LineEncoding::Jsonl))),
        Some("null") => Ok(Box::new(NullOutputFormat)),
        Some("dux") => Ok(Box::new(DuxOutputFormat)),
        Some(other) => Err(MrError::conf(format!("formato de salida desconocido: {other}"))),
        None => Err(MrError::conf(format!("falta {}", keys::OUTPUT_FORMAT))),
    }
}

pub fn input_format(conf: &JobConf) -> Result<Box<dyn InputFormat>> {
    match conf.get(keys::INPUT_FORMAT) {
        Some("text") => Ok(Box::new(FileInputFormat::new(LineDecoding::Text))),
        Some("kvtext") => Ok(Box::new(FileInputFormat::new(LineDecoding::KeyValueText))),
        Some("jsonl") => Ok(Box::new(FileInputFormat::new(LineDecoding::Jsonl))),
        Some("csv") => Ok(Box::new(FileInputFormat::new(LineDecoding::Csv))),
        Some("mux") => Ok(Box::new(MuxInputFormat)),
        Some(other) => Err(MrError::conf(format!("formato de entrada desconocido: {other}"))),
        None => Err(MrError::conf(format!("falta {}", keys::INPUT_FORMAT))),
    }
}

fn declared_kind(conf: &JobConf, key: &str) -> Result<ValueKind> {
    conf.get_or(key, "any").parse()
}

/* =========================
   Salida a archivos
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEncoding {
    /// `clave<TAB>valor`; una clave o valor nulo no se escribe.
    Text,
    /// `[clave, valor]` en JSON, uno por línea.
    Jsonl,
}

#[derive(Debug, Clone, Copy)]
pub struct FileOutputFormat {
    encoding: LineEncoding,
}

impl FileOutputFormat {
    pub fn new(encoding: LineEncoding) -> Self {
        Self { encoding }
    }

    fn output_dir(conf: &JobConf) -> Result<PathBuf> {
        conf.get(keys::OUTPUT_DIR)
            .map(PathBuf::from)
            .ok_or_else(|| MrError::conf(format!("falta {}", keys::OUTPUT_DIR)))
    }

    fn file_name(&self, conf: &JobConf, attempt: &TaskAttemptId) -> String {
        let basename = conf.get_or(keys::OUTPUT_BASENAME, DEFAULT_BASENAME);
        let ext = match self.encoding {
            LineEncoding::Text => "",
            LineEncoding::Jsonl => ".jsonl",
        };
        format!(
            "{}-{}-{:05}{}",
            basename,
            attempt.kind.code(),
            attempt.partition,
            ext
        )
    }
}

impl OutputFormat for FileOutputFormat {
    fn record_writer(&self, ctx: &TaskAttemptContext) -> Result<Box<dyn RecordWriter>> {
        let dir = Self::output_dir(&ctx.conf)?;
        let name = self.file_name(&ctx.conf, &ctx.attempt);

        let final_path = dir.join(&name);
        if final_path.exists() {
            return Err(MrError::format(format!(
                "la salida {} ya existe",
                final_path.display()
            )));
        }

        let tmp_path = dir
            .join(TEMPORARY_DIR)
            .join(ctx.attempt.to_string())
            .join(&name);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = BufWriter::new(File::create(&tmp_path)?);

        debug!("abriendo {} (temporal {})", final_path.display(), tmp_path.display());
        Ok(Box::new(FileRecordWriter {
            encoding: self.encoding,
            key_kind: declared_kind(&ctx.conf, keys::OUTPUT_KEY_CLASS)?,
            value_kind: declared_kind(&ctx.conf, keys::OUTPUT_VALUE_CLASS)?,
            out: Some(out),
            tmp_path,
            final_path,
        }))
    }

    fn output_paths(&self, conf: &JobConf) -> Result<Vec<PathBuf>> {
        Ok(vec![Self::output_dir(conf)?])
    }

    fn check_output_specs(&self, conf: &JobConf) -> Result<()> {
        let dir = Self::output_dir(conf)?;
        if dir.exists() {
            return Err(MrError::format(format!(
                "el directorio de salida {} ya existe",
                dir.display()
            )));
        }
        Ok(())
    }

    fn commit_job(&self, conf: &JobConf) -> Result<()> {
        let tmp = Self::output_dir(conf)?.join(TEMPORARY_DIR);
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        Ok(())
    }
}

pub struct FileRecordWriter {
    encoding: LineEncoding,
    key_kind: ValueKind,
    value_kind: ValueKind,
    out: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl RecordWriter for FileRecordWriter {
    fn write(&mut self, key: &Value, value: &Value) -> Result<()> {
        self.key_kind.check(key)?;
        self.value_kind.check(value)?;

        let out = self.out.as_mut().ok_or(MrError::WriterClosed)?;
        match self.encoding {
            LineEncoding::Text => {
                let line = match (key, value) {
                    (Value::Null, Value::Null) => return Ok(()),
                    (Value::Null, v) => text_of(v),
                    (k, Value::Null) => text_of(k),
                    (k, v) => format!("{}\t{}", text_of(k), text_of(v)),
                };
                writeln!(out, "{}", line)?;
            }
            LineEncoding::Jsonl => {
                serde_json::to_writer(&mut *out, &json!([key, value]))?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &TaskAttemptContext) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush()?;
        drop(out);

        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.final_path.exists() {
            return Err(MrError::format(format!(
                "la salida {} ya existe",
                self.final_path.display()
            )));
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(attempt_dir) = self.tmp_path.parent() {
            let _ = fs::remove_dir(attempt_dir);
        }
        Ok(())
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Descarta todo.
pub struct NullOutputFormat;

struct NullRecordWriter;

impl OutputFormat for NullOutputFormat {
    fn record_writer(&self, _ctx: &TaskAttemptContext) -> Result<Box<dyn RecordWriter>> {
        Ok(Box::new(NullRecordWriter))
    }

    fn output_paths(&self, _conf: &JobConf) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

impl RecordWriter for NullRecordWriter {
    fn write(&mut self, _key: &Value, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _ctx: &TaskAttemptContext) -> Result<()> {
        Ok(())
    }
}

/* =========================
   Entrada desde archivos
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDecoding {
    /// clave = número de línea, valor = la línea.
    Text,
    /// `clave<TAB>valor`, lo que escribe [`LineEncoding::Text`]. Cada lado se
    /// decodifica según la clase de entrada declarada.
    KeyValueText,
    /// cada línea es `[clave, valor]`.
    Jsonl,
    /// primera fila = encabezados; valor = objeto encabezado -> campo.
    Csv,
}

#[derive(Debug, Clone, Copy)]
pub struct FileInputFormat {
    decoding: LineDecoding,
}

impl FileInputFormat {
    pub fn new(decoding: LineDecoding) -> Self {
        Self { decoding }
    }
}

impl InputFormat for FileInputFormat {
    fn splits(&self, conf: &JobConf) -> Result<Vec<InputSplit>> {
        Ok(list_input_files(conf)?
            .into_iter()
            .map(|path| InputSplit { path, branch: None })
            .collect())
    }

    fn read(&self, split: &InputSplit, conf: &JobConf) -> Result<Vec<KeyValue>> {
        match self.decoding {
            LineDecoding::Text => read_text_lines(&split.path),
            LineDecoding::KeyValueText => read_key_value_lines(
                &split.path,
                declared_kind(conf, keys::INPUT_KEY_CLASS)?,
                declared_kind(conf, keys::INPUT_VALUE_CLASS)?,
            ),
            LineDecoding::Jsonl => read_jsonl_pairs(&split.path),
            LineDecoding::Csv => read_csv_rows(&split.path),
        }
    }

    fn locations(&self, conf: &JobConf) -> Result<Vec<PathBuf>> {
        Ok(conf.get_list(keys::INPUT_DIR).into_iter().map(PathBuf::from).collect())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('_') || n.starts_with('.'))
        .unwrap_or(false)
}

fn is_pattern(entry: &str) -> bool {
    entry.contains(|c| matches!(c, '*' | '?' | '['))
}

/// Expande las entradas configuradas a archivos concretos:
/// archivos tal cual, directorios a sus archivos visibles, y patrones glob.
pub fn list_input_files(conf: &JobConf) -> Result<Vec<PathBuf>> {
    let entries = conf.get_list(keys::INPUT_DIR);
    if entries.is_empty() {
        return Err(MrError::conf(format!("falta {}", keys::INPUT_DIR)));
    }

    let mut files = Vec::new();
    for entry in entries {
        if is_pattern(&entry) {
            let matches = glob::glob(&entry).map_err(MrError::conf)?;
            for path in matches.flatten() {
                if path.is_file() && !is_hidden(&path) {
                    files.push(path);
                }
            }
            continue;
        }

        let path = PathBuf::from(&entry);
        if path.is_dir() {
            let mut in_dir: Vec<PathBuf> = fs::read_dir(&path)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && !is_hidden(p))
                .collect();
            in_dir.sort();
            files.extend(in_dir);
        } else if path.is_file() {
            files.push(path);
        } else {
            return Err(MrError::format(format!("la entrada {} no existe", entry)));
        }
    }

    files.dedup();
    Ok(files)
}

fn read_text_lines(path: &Path) -> Result<Vec<KeyValue>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        out.push((json!(i), Value::String(line?)));
    }
    Ok(out)
}

/// Un lado de una línea `kvtext`. Con clase `any` lo que no es JSON queda
/// como texto.
fn decode_field(kind: ValueKind, raw: &str) -> Result<Value> {
    match kind {
        ValueKind::Text => Ok(Value::String(raw.to_string())),
        ValueKind::Null => Ok(Value::Null),
        ValueKind::Any => {
            Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
        }
        ValueKind::Long | ValueKind::Double | ValueKind::Json => {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| MrError::format(format!("campo {raw:?} no es {kind}: {e}")))?;
            kind.check(&value)?;
            Ok(value)
        }
    }
}

fn read_key_value_lines(
    path: &Path,
    key_kind: ValueKind,
    value_kind: ValueKind,
) -> Result<Vec<KeyValue>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let pair = match line.split_once('\t') {
            Some((k, v)) => (decode_field(key_kind, k)?, decode_field(value_kind, v)?),
            // el writer omite el lado nulo
            None if value_kind == ValueKind::Null => (decode_field(key_kind, &line)?, Value::Null),
            None => (Value::Null, decode_field(value_kind, &line)?),
        };
        out.push(pair);
    }
    Ok(out)
}

fn read_jsonl_pairs(path: &Path) -> Result<Vec<KeyValue>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line)? {
            Value::Array(mut pair) if pair.len() == 2 => {
                let v = pair.pop().unwrap_or(Value::Null);
                let k = pair.pop().unwrap_or(Value::Null);
                out.push((k, v));
            }
            other => {
                return Err(MrError::format(format!(
                    "{}: se esperaba [clave, valor], llegó {}",
                    path.display(),
                    other
                )))
            }
        }
    }
    Ok(out)
}

fn read_csv_rows(path: &Path) -> Result<Vec<KeyValue>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    // Limpia BOM por si viene de Excel/Windows
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut out = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        let mut obj = serde_json::Map::new();
        for (idx, h) in headers.iter().enumerate() {
            let val = row.get(idx).unwrap_or("");
            obj.insert(h.clone(), json!(val));
        }
        out.push((json!(i), Value::Object(obj)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskAttemptId, TaskKind};
    use std::io::Write;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("mr_format_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn ctx(conf: JobConf, partition: usize) -> TaskAttemptContext {
        TaskAttemptContext {
            conf,
            attempt: TaskAttemptId::new("job1", TaskKind::Reduce, partition, 0),
            counters: Counters::new(),
        }
    }

    #[test]
    fn text_output_escribe_y_mueve_al_cerrar() {
        let tmp = temp_dir("text_out");
        let out_dir = tmp.join("out");
        let conf = JobConf::new()
            .with(keys::OUTPUT_FORMAT, "text")
            .with(keys::OUTPUT_DIR, out_dir.to_string_lossy());
        let ctx = ctx(conf.clone(), 3);

        let format = output_format(&conf).unwrap();
        let mut w = format.record_writer(&ctx).unwrap();
        w.write(&json!("hola"), &json!(2)).unwrap();
        w.write(&Value::Null, &json!("solo valor")).unwrap();
        w.write(&json!("solo clave"), &Value::Null).unwrap();

        let final_path = out_dir.join("part-r-00003");
        assert!(!final_path.exists());
        w.close(&ctx).unwrap();

        let content = fs::read_to_string(&final_path).unwrap();
        assert_eq!(content, "hola\t2\nsolo valor\nsolo clave\n");
        assert!(w.write(&json!("x"), &json!(1)).is_err());

        format.commit_job(&conf).unwrap();
        assert!(!out_dir.join(TEMPORARY_DIR).exists());
    }

    #[test]
    fn jsonl_output_valida_clases_y_respeta_basename() {
        let tmp = temp_dir("jsonl_out");
        let out_dir = tmp.join("out");
        let conf = JobConf::new()
            .with(keys::OUTPUT_FORMAT, "jsonl")
            .with(keys::OUTPUT_DIR, out_dir.to_string_lossy())
            .with(keys::OUTPUT_BASENAME, "pares")
            .with(keys::OUTPUT_KEY_CLASS, "text")
            .with(keys::OUTPUT_VALUE_CLASS, "long");
        let ctx = ctx(conf.clone(), 0);

        let mut w = output_format(&conf).unwrap().record_writer(&ctx).unwrap();
        w.write(&json!("a"), &json!(1)).unwrap();
        assert!(matches!(w.write(&json!(1), &json!(1)), Err(MrError::Type { .. })));
        assert!(matches!(w.write(&json!("a"), &json!("uno")), Err(MrError::Type { .. })));
        w.close(&ctx).unwrap();

        let content = fs::read_to_string(out_dir.join("pares-r-00000.jsonl")).unwrap();
        assert_eq!(content, "[\"a\",1]\n");

        // una segunda apertura del mismo archivo choca
        assert!(output_format(&conf).unwrap().record_writer(&ctx).is_err());
    }

    #[test]
    fn check_output_specs_rechaza_directorio_existente() {
        let tmp = temp_dir("specs");
        let conf = JobConf::new()
            .with(keys::OUTPUT_FORMAT, "jsonl")
            .with(keys::OUTPUT_DIR, tmp.to_string_lossy());
        assert!(output_format(&conf).unwrap().check_output_specs(&conf).is_err());

        let conf = conf.with(keys::OUTPUT_DIR, tmp.join("nuevo").to_string_lossy());
        assert!(output_format(&conf).unwrap().check_output_specs(&conf).is_ok());
    }

    #[test]
    fn list_input_files_expande_directorios_y_globs() {
        let tmp = temp_dir("list_input");
        let dir = tmp.join("data");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.txt"), "b").unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("_SUCCESS"), "").unwrap();
        fs::write(dir.join(".oculto"), "").unwrap();
        fs::write(tmp.join("suelto.log"), "x").unwrap();

        let conf = JobConf::new().with(
            keys::INPUT_DIR,
            format!("{},{}", dir.display(), tmp.join("*.log").display()),
        );
        let files = list_input_files(&conf).unwrap();
        assert_eq!(
            files,
            vec![dir.join("a.txt"), dir.join("b.txt"), tmp.join("suelto.log")]
        );

        let missing = JobConf::new().with(keys::INPUT_DIR, tmp.join("nada").to_string_lossy());
        assert!(list_input_files(&missing).is_err());
    }

    #[test]
    fn lectores_text_jsonl_y_csv() {
        let tmp = temp_dir("readers");

        let text = tmp.join("t.txt");
        fs::write(&text, "uno\ndos\n").unwrap();
        let split = InputSplit { path: text, branch: None };
        let pairs = FileInputFormat::new(LineDecoding::Text)
            .read(&split, &JobConf::new())
            .unwrap();
        assert_eq!(pairs, vec![(json!(0), json!("uno")), (json!(1), json!("dos"))]);

        let jsonl = tmp.join("p.jsonl");
        let mut f = fs::File::create(&jsonl).unwrap();
        writeln!(f, "{}", r#"["a",1]"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{}", r#"[{"x":1},null]"#).unwrap();
        let split = InputSplit { path: jsonl, branch: None };
        let pairs = FileInputFormat::new(LineDecoding::Jsonl)
            .read(&split, &JobConf::new())
            .unwrap();
        assert_eq!(pairs, vec![(json!("a"), json!(1)), (json!({"x": 1}), Value::Null)]);

        let csv_path = tmp.join("d.csv");
        fs::write(&csv_path, "\u{feff}nombre,edad\nAna,30\nBob, 25\n").unwrap();
        let split = InputSplit { path: csv_path, branch: None };
        let rows = FileInputFormat::new(LineDecoding::Csv)
            .read(&split, &JobConf::new())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1["nombre"], json!("Ana"));
        assert_eq!(rows[1].1["edad"], json!("25"));
    }

    #[test]
    fn kvtext_decodifica_segun_las_clases_declaradas() {
        let tmp = temp_dir("kvtext");
        let path = tmp.join("part-r-00000");
        fs::write(&path, "apple\t3\nsin clave\tcon\ttab\n").unwrap();
        let split = InputSplit { path, branch: None };

        let conf = JobConf::new()
            .with(keys::INPUT_KEY_CLASS, "text")
            .with(keys::INPUT_VALUE_CLASS, "any");
        let pairs = FileInputFormat::new(LineDecoding::KeyValueText)
            .read(&split, &conf)
            .unwrap();
        assert_eq!(
            pairs,
            vec![(json!("apple"), json!(3)), (json!("sin clave"), json!("con\ttab"))]
        );

        let strict = conf.with(keys::INPUT_VALUE_CLASS, "long");
        assert!(FileInputFormat::new(LineDecoding::KeyValueText)
            .read(&split, &strict)
            .is_err());
    }

    #[test]
    fn jsonl_mal_formado_es_error() {
        let tmp = temp_dir("bad_jsonl");
        let path = tmp.join("x.jsonl");
        fs::write(&path, "{\"no\":\"par\"}\n").unwrap();
        let split = InputSplit { path, branch: None };
        assert!(FileInputFormat::new(LineDecoding::Jsonl)
            .read(&split, &JobConf::new())
            .is_err());
    }
}
