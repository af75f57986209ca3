//! Runtime values flowing between calls.
//!
//! Values are produced by expression evaluation and call outputs, coerced to
//! declared types at call boundaries, and flattened into simpletons when file
//! outputs are copied between storage roots.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Declared type of a task input, output, or declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Integer,
    Float,
    String,
    File,
    Array(Box<ValueType>),
    /// Accepts any value unchanged.
    Any,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Boolean => write!(f, "Boolean"),
            ValueType::Integer => write!(f, "Int"),
            ValueType::Float => write!(f, "Float"),
            ValueType::String => write!(f, "String"),
            ValueType::File => write!(f, "File"),
            ValueType::Array(member) => write!(f, "Array[{member}]"),
            ValueType::Any => write!(f, "Any"),
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// A file referenced by path. Paths are opaque strings so that cloud URIs
    /// (`gs://…`, `s3://…`) survive round trips untouched.
    File(String),
    Array(Vec<WorkflowValue>),
}

#[derive(Debug, Error)]
pub enum CoercionError {
    #[error("cannot coerce {actual} into {expected}")]
    Incompatible { expected: ValueType, actual: String },
    #[error("cannot parse {raw:?} as {expected}")]
    Unparseable { expected: ValueType, raw: String },
}

impl WorkflowValue {
    pub fn type_name(&self) -> String {
        match self {
            WorkflowValue::Boolean(_) => "Boolean".to_string(),
            WorkflowValue::Integer(_) => "Int".to_string(),
            WorkflowValue::Float(_) => "Float".to_string(),
            WorkflowValue::String(_) => "String".to_string(),
            WorkflowValue::File(_) => "File".to_string(),
            WorkflowValue::Array(_) => "Array".to_string(),
        }
    }

    /// Infer the declared type this value satisfies without coercion. Empty
    /// arrays infer `Array[Any]`.
    pub fn inferred_type(&self) -> ValueType {
        match self {
            WorkflowValue::Boolean(_) => ValueType::Boolean,
            WorkflowValue::Integer(_) => ValueType::Integer,
            WorkflowValue::Float(_) => ValueType::Float,
            WorkflowValue::String(_) => ValueType::String,
            WorkflowValue::File(_) => ValueType::File,
            WorkflowValue::Array(items) => {
                let member = items
                    .first()
                    .map(WorkflowValue::inferred_type)
                    .unwrap_or(ValueType::Any);
                ValueType::Array(Box::new(member))
            }
        }
    }

    pub fn as_array(&self) -> Option<&[WorkflowValue]> {
        match self {
            WorkflowValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Convert to a JSON value for persistence and logging.
    pub fn to_json(&self) -> JsonValue {
        match self {
            WorkflowValue::Boolean(b) => JsonValue::Bool(*b),
            WorkflowValue::Integer(i) => JsonValue::from(*i),
            WorkflowValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            WorkflowValue::String(s) => JsonValue::String(s.clone()),
            WorkflowValue::File(path) => JsonValue::String(path.clone()),
            WorkflowValue::Array(items) => {
                JsonValue::Array(items.iter().map(WorkflowValue::to_json).collect())
            }
        }
    }

    /// Decode a JSON value against a declared type. The type drives the
    /// String/File split, which JSON cannot represent on its own.
    pub fn from_json(declared: &ValueType, json: &JsonValue) -> Result<Self, CoercionError> {
        let value = match json {
            JsonValue::Bool(b) => WorkflowValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    WorkflowValue::Integer(i)
                } else {
                    WorkflowValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => WorkflowValue::String(s.clone()),
            JsonValue::Array(items) => {
                let member = match declared {
                    ValueType::Array(member) => member.as_ref().clone(),
                    _ => ValueType::Any,
                };
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(WorkflowValue::from_json(&member, item)?);
                }
                WorkflowValue::Array(values)
            }
            other => {
                return Err(CoercionError::Incompatible {
                    expected: declared.clone(),
                    actual: format!("{other}"),
                });
            }
        };
        declared.coerce(value)
    }
}

impl fmt::Display for WorkflowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowValue::Boolean(b) => write!(f, "{b}"),
            WorkflowValue::Integer(i) => write!(f, "{i}"),
            WorkflowValue::Float(v) => write!(f, "{v}"),
            WorkflowValue::String(s) => write!(f, "{s:?}"),
            WorkflowValue::File(path) => write!(f, "{path}"),
            WorkflowValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl ValueType {
    /// Coerce a value into this type, following the language's widening rules.
    /// Identity coercions are free; everything else either converts or fails.
    pub fn coerce(&self, value: WorkflowValue) -> Result<WorkflowValue, CoercionError> {
        let incompatible = |actual: &WorkflowValue| CoercionError::Incompatible {
            expected: self.clone(),
            actual: actual.type_name(),
        };
        match (self, value) {
            (ValueType::Any, value) => Ok(value),
            (ValueType::Boolean, WorkflowValue::Boolean(b)) => Ok(WorkflowValue::Boolean(b)),
            (ValueType::Integer, WorkflowValue::Integer(i)) => Ok(WorkflowValue::Integer(i)),
            (ValueType::Integer, WorkflowValue::String(s)) => s
                .parse::<i64>()
                .map(WorkflowValue::Integer)
                .map_err(|_| CoercionError::Unparseable {
                    expected: self.clone(),
                    raw: s,
                }),
            (ValueType::Float, WorkflowValue::Float(v)) => Ok(WorkflowValue::Float(v)),
            (ValueType::Float, WorkflowValue::Integer(i)) => Ok(WorkflowValue::Float(i as f64)),
            (ValueType::Float, WorkflowValue::String(s)) => s
                .parse::<f64>()
                .map(WorkflowValue::Float)
                .map_err(|_| CoercionError::Unparseable {
                    expected: self.clone(),
                    raw: s,
                }),
            (ValueType::String, WorkflowValue::String(s)) => Ok(WorkflowValue::String(s)),
            (ValueType::String, WorkflowValue::File(path)) => Ok(WorkflowValue::String(path)),
            (ValueType::String, WorkflowValue::Integer(i)) => {
                Ok(WorkflowValue::String(i.to_string()))
            }
            (ValueType::String, WorkflowValue::Float(v)) => {
                Ok(WorkflowValue::String(v.to_string()))
            }
            (ValueType::String, WorkflowValue::Boolean(b)) => {
                Ok(WorkflowValue::String(b.to_string()))
            }
            (ValueType::File, WorkflowValue::File(path)) => Ok(WorkflowValue::File(path)),
            (ValueType::File, WorkflowValue::String(s)) => Ok(WorkflowValue::File(s)),
            (ValueType::Array(member), WorkflowValue::Array(items)) => {
                let mut coerced = Vec::with_capacity(items.len());
                for item in items {
                    coerced.push(member.coerce(item)?);
                }
                Ok(WorkflowValue::Array(coerced))
            }
            (_, value) => Err(incompatible(&value)),
        }
    }
}

/// A flattened key/value slice of a structured output.
///
/// Scalar outputs flatten to their bare name; array elements flatten to
/// `name[i]`, recursively for nested arrays. Simpletons are the unit the
/// cache-hit copier rewrites when re-rooting file outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Simpleton {
    pub key: String,
    pub value: WorkflowValue,
}

impl Simpleton {
    pub fn new(key: impl Into<String>, value: WorkflowValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Flatten named outputs into simpletons.
pub fn flatten_outputs(outputs: &HashMap<String, WorkflowValue>) -> Vec<Simpleton> {
    let mut simpletons = Vec::new();
    let mut names: Vec<&String> = outputs.keys().collect();
    names.sort();
    for name in names {
        flatten_value(name, &outputs[name], &mut simpletons);
    }
    simpletons
}

fn flatten_value(key: &str, value: &WorkflowValue, out: &mut Vec<Simpleton>) {
    match value {
        WorkflowValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_value(&format!("{key}[{i}]"), item, out);
            }
        }
        scalar => out.push(Simpleton::new(key, scalar.clone())),
    }
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("malformed simpleton key {0:?}")]
    MalformedKey(String),
    #[error("array index gap while assembling output {0:?}")]
    IndexGap(String),
}

/// Rebuild named outputs from simpletons. Inverse of [`flatten_outputs`] for
/// values built from scalars and (nested) arrays.
pub fn assemble_outputs(
    simpletons: &[Simpleton],
) -> Result<HashMap<String, WorkflowValue>, AssembleError> {
    let mut grouped: HashMap<String, Vec<(Vec<usize>, WorkflowValue)>> = HashMap::new();
    for simpleton in simpletons {
        let (name, indices) = parse_simpleton_key(&simpleton.key)?;
        grouped
            .entry(name)
            .or_default()
            .push((indices, simpleton.value.clone()));
    }

    let mut outputs = HashMap::new();
    for (name, mut entries) in grouped {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let value = build_value(&name, &entries, 0)?;
        outputs.insert(name, value);
    }
    Ok(outputs)
}

fn parse_simpleton_key(key: &str) -> Result<(String, Vec<usize>), AssembleError> {
    let malformed = || AssembleError::MalformedKey(key.to_string());
    match key.find('[') {
        None => Ok((key.to_string(), Vec::new())),
        Some(open) => {
            let name = key[..open].to_string();
            if name.is_empty() {
                return Err(malformed());
            }
            let mut indices = Vec::new();
            let mut rest = &key[open..];
            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(malformed());
                }
                let close = rest.find(']').ok_or_else(malformed)?;
                let index: usize = rest[1..close].parse().map_err(|_| malformed())?;
                indices.push(index);
                rest = &rest[close + 1..];
            }
            Ok((name, indices))
        }
    }
}

fn build_value(
    name: &str,
    entries: &[(Vec<usize>, WorkflowValue)],
    depth: usize,
) -> Result<WorkflowValue, AssembleError> {
    if entries.len() == 1 && entries[0].0.len() == depth {
        return Ok(entries[0].1.clone());
    }
    let mut elements: Vec<(usize, &[(Vec<usize>, WorkflowValue)])> = Vec::new();
    let mut start = 0;
    while start < entries.len() {
        let index = *entries[start]
            .0
            .get(depth)
            .ok_or_else(|| AssembleError::MalformedKey(name.to_string()))?;
        let mut end = start;
        while end < entries.len() && entries[end].0.get(depth) == Some(&index) {
            end += 1;
        }
        elements.push((index, &entries[start..end]));
        start = end;
    }
    let mut values = Vec::with_capacity(elements.len());
    for (expected, (index, slice)) in elements.into_iter().enumerate() {
        if index != expected {
            return Err(AssembleError::IndexGap(name.to_string()));
        }
        values.push(build_value(name, slice, depth + 1)?);
    }
    Ok(WorkflowValue::Array(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_widening_primitives() {
        assert_eq!(
            ValueType::Float.coerce(WorkflowValue::Integer(3)).unwrap(),
            WorkflowValue::Float(3.0)
        );
        assert_eq!(
            ValueType::File
                .coerce(WorkflowValue::String("a/b.txt".into()))
                .unwrap(),
            WorkflowValue::File("a/b.txt".into())
        );
        assert_eq!(
            ValueType::String
                .coerce(WorkflowValue::Integer(7))
                .unwrap(),
            WorkflowValue::String("7".into())
        );
    }

    #[test]
    fn rejects_narrowing() {
        let err = ValueType::Integer
            .coerce(WorkflowValue::Boolean(true))
            .unwrap_err();
        assert!(matches!(err, CoercionError::Incompatible { .. }));
    }

    #[test]
    fn coerces_array_members() {
        let input = WorkflowValue::Array(vec![
            WorkflowValue::String("x.bam".into()),
            WorkflowValue::String("y.bam".into()),
        ]);
        let coerced = ValueType::Array(Box::new(ValueType::File))
            .coerce(input)
            .unwrap();
        assert_eq!(
            coerced,
            WorkflowValue::Array(vec![
                WorkflowValue::File("x.bam".into()),
                WorkflowValue::File("y.bam".into()),
            ])
        );
    }

    #[test]
    fn flattens_and_assembles_nested_outputs() {
        let mut outputs = HashMap::new();
        outputs.insert("count".to_string(), WorkflowValue::Integer(2));
        outputs.insert(
            "shards".to_string(),
            WorkflowValue::Array(vec![
                WorkflowValue::Array(vec![WorkflowValue::File("a".into())]),
                WorkflowValue::Array(vec![
                    WorkflowValue::File("b".into()),
                    WorkflowValue::File("c".into()),
                ]),
            ]),
        );

        let simpletons = flatten_outputs(&outputs);
        let keys: Vec<&str> = simpletons.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["count", "shards[0][0]", "shards[1][0]", "shards[1][1]"]);

        let rebuilt = assemble_outputs(&simpletons).unwrap();
        assert_eq!(rebuilt, outputs);
    }

    #[test]
    fn assemble_detects_index_gap() {
        let simpletons = vec![
            Simpleton::new("xs[0]", WorkflowValue::Integer(1)),
            Simpleton::new("xs[2]", WorkflowValue::Integer(3)),
        ];
        assert!(matches!(
            assemble_outputs(&simpletons),
            Err(AssembleError::IndexGap(_))
        ));
    }

    #[test]
    fn json_round_trip_keeps_file_typing() {
        let declared = ValueType::Array(Box::new(ValueType::File));
        let value = WorkflowValue::Array(vec![WorkflowValue::File("gs://b/x".into())]);
        let json = value.to_json();
        let back = WorkflowValue::from_json(&declared, &json).unwrap();
        assert_eq!(back, value);
    }
}
