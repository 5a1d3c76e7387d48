use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{MrError, Result};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar texto, números, objetos, etc.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

/// Par clave/valor tal como lo ve el engine.
pub type KeyValue = (Value, Value);

/// Grupo de valores de una misma clave (entrada de reduce/combine).
pub type KeyGroup = (Value, Vec<Value>);

/// Forma en que un behavior recibe su entrada o entrega su salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Keys,
    Vals,
    KeyVals,
    KeyGroups,
    ValGroups,
    KeyValGroups,
}

/// Entrada de una tarea: pares sueltos (map) o agrupados por clave (reduce).
#[derive(Debug, Clone)]
pub enum TaskRecords {
    Pairs(Vec<KeyValue>),
    Groups(Vec<KeyGroup>),
}

impl Shape {
    pub fn is_grouped(&self) -> bool {
        matches!(self, Shape::KeyGroups | Shape::ValGroups | Shape::KeyValGroups)
    }

    /// Convierte la entrada de la tarea a la forma que espera el behavior.
    ///
    /// Pares con forma de grupos no tienen sentido y son error; grupos con
    /// forma de pares se aplanan.
    pub fn shape(&self, input: TaskRecords) -> Result<Records> {
        match input {
            TaskRecords::Pairs(pairs) => {
                if self.is_grouped() {
                    return Err(MrError::conf(format!(
                        "la forma {self} necesita entrada agrupada"
                    )));
                }
                Ok(pairs.into_iter().map(|(k, v)| self.pick(k, v)).collect())
            }
            TaskRecords::Groups(groups) => Ok(match self {
                Shape::KeyGroups => groups.into_iter().map(|(k, _)| k).collect(),
                Shape::ValGroups => groups.into_iter().map(|(_, vs)| Value::Array(vs)).collect(),
                Shape::KeyValGroups => groups
                    .into_iter()
                    .map(|(k, vs)| Value::Array(vec![k, Value::Array(vs)]))
                    .collect(),
                _ => groups
                    .into_iter()
                    .flat_map(|(k, vs)| {
                        let shape = *self;
                        vs.into_iter().map(move |v| shape.pick(k.clone(), v))
                    })
                    .collect(),
            }),
        }
    }

    fn pick(&self, key: Value, value: Value) -> Record {
        match self {
            Shape::Keys => key,
            Shape::Vals => value,
            _ => Value::Array(vec![key, value]),
        }
    }

    /// Convierte un registro devuelto por un behavior en el par a escribir.
    pub fn unshape(&self, rec: Record) -> Result<KeyValue> {
        match self {
            Shape::Keys => Ok((rec, Value::Null)),
            Shape::Vals => Ok((Value::Null, rec)),
            Shape::KeyVals => match rec {
                Value::Array(mut pair) if pair.len() == 2 => {
                    let v = pair.pop().unwrap_or(Value::Null);
                    let k = pair.pop().unwrap_or(Value::Null);
                    Ok((k, v))
                }
                other => Err(MrError::Type {
                    expected: "[clave, valor]".to_string(),
                    found: other.to_string(),
                }),
            },
            grouped => Err(MrError::conf(format!(
                "la forma {grouped} no sirve como salida"
            ))),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Keys => "keys",
            Shape::Vals => "vals",
            Shape::KeyVals => "keyvals",
            Shape::KeyGroups => "keygroups",
            Shape::ValGroups => "valgroups",
            Shape::KeyValGroups => "keyvalgroups",
        };
        f.write_str(name)
    }
}

/// "Clase" declarada para claves o valores de una salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Any,
    Null,
    Text,
    Long,
    Double,
    Json,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Null => "null",
            ValueKind::Text => "text",
            ValueKind::Long => "long",
            ValueKind::Double => "double",
            ValueKind::Json => "json",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueKind::Any | ValueKind::Json => true,
            ValueKind::Null => value.is_null(),
            ValueKind::Text => value.is_string(),
            ValueKind::Long => value.is_i64() || value.is_u64(),
            ValueKind::Double => value.is_number(),
        }
    }

    pub fn check(&self, value: &Value) -> Result<()> {
        if self.accepts(value) {
            Ok(())
        } else {
            Err(MrError::Type {
                expected: self.as_str().to_string(),
                found: value.to_string(),
            })
        }
    }
}

impl FromStr for ValueKind {
    type Err = MrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(ValueKind::Any),
            "null" => Ok(ValueKind::Null),
            "text" => Ok(ValueKind::Text),
            "long" => Ok(ValueKind::Long),
            "double" => Ok(ValueKind::Double),
            "json" => Ok(ValueKind::Json),
            other => Err(MrError::conf(format!("clase de valor desconocida: {other}"))),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Texto estable de una clave, usado para ordenar, agrupar y particionar.
pub fn key_text(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
