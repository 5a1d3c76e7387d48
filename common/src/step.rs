use std::fmt;
use std::sync::Arc;

use crate::conf::JobConf;
use crate::error::Result;

type StepFn = dyn Fn(JobConf) -> Result<JobConf> + Send + Sync;

/// Paso de configuración: recibe una configuración y devuelve otra.
///
/// Los pasos se componen aplicándolos en orden; uno posterior puede pisar
/// claves escritas por uno anterior (por ejemplo el formato de salida).
#[derive(Clone)]
pub struct Step {
    label: String,
    f: Arc<StepFn>,
}

impl Step {
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobConf) -> Result<JobConf> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            f: Arc::new(f),
        }
    }

    pub fn identity() -> Self {
        Self::new("identity", Ok)
    }

    /// Paso que sólo fija una clave.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        let label = format!("set {key}");
        Self::new(label, move |conf| Ok(conf.with(key.clone(), value.clone())))
    }

    /// Paso literal: fija todas las claves dadas.
    pub fn props<I, K, V>(props: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let props: Vec<(String, String)> = props
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new("props", move |mut conf| {
            for (k, v) in &props {
                conf.set(k.clone(), v.clone());
            }
            Ok(conf)
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn apply(&self, conf: JobConf) -> Result<JobConf> {
        (self.f)(conf)
    }

    /// `self` y después `next`.
    pub fn then(self, next: Step) -> Step {
        let label = format!("{} > {}", self.label, next.label);
        Step::new(label, move |conf| next.apply(self.apply(conf)?))
    }

    pub fn compose<I: IntoIterator<Item = Step>>(steps: I) -> Step {
        steps
            .into_iter()
            .fold(Step::identity(), |acc, step| acc.then(step))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_aplica_en_orden_y_el_ultimo_gana() {
        let step = Step::compose(vec![
            Step::set("fmt", "text"),
            Step::set("dir", "/tmp/a"),
            Step::set("fmt", "jsonl"),
        ]);

        let conf = step.apply(JobConf::new()).unwrap();
        assert_eq!(conf.get("fmt"), Some("jsonl"));
        assert_eq!(conf.get("dir"), Some("/tmp/a"));
    }

    #[test]
    fn props_no_toca_claves_ajenas() {
        let base = JobConf::new().with("otra", "x");
        let out = Step::props([("a", "1"), ("b", "2")]).apply(base.clone()).unwrap();

        let diff = out.diff(&base);
        let keys: Vec<&str> = diff.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn un_paso_que_falla_corta_la_composicion() {
        let failing = Step::new("falla", |_| Err(crate::error::MrError::conf("no")));
        let step = Step::set("a", "1").then(failing).then(Step::set("b", "2"));
        assert!(step.apply(JobConf::new()).is_err());
    }
}
