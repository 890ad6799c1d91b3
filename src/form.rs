//! Forms map the string fields extracted from a block into something
//! structured. The contract is deliberately narrow: a form takes the
//! string-valued field map and either produces a record or reports what it
//! found objectionable. `Schema` is the batteries-included implementation,
//! a pipeline of typed field extractors; anything else that satisfies
//! `Form` can be injected at channel construction.

use block::Block;
use chrono::NaiveDateTime;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::result;

/// A structured record, the unit a sink accepts.
pub type Record = Value;

/// The string-valued fields a source's pattern extracted from a block.
pub type Fields = Map<String, Value>;

/// Predicate over a mapped record and its block. Records it rejects are
/// dropped, which is not an error.
pub type FilterFn = Box<dyn Fn(&Record, &Block) -> bool + Send>;

/// Maps extracted fields into a structured record, or reports errors.
pub trait Form: Send {
    /// Produce a record from `fields`, or the list of reasons why not.
    fn apply(
        &self,
        fields: &Fields,
        block: &Block,
    ) -> result::Result<Record, Vec<String>>;
}

/// A typed field extractor within a `Schema`.
#[derive(Clone, Debug)]
pub enum Field {
    /// Pass the value through as a string.
    Str {
        /// Used when the field is absent.
        default: Option<String>,
    },
    /// Parse the value as an integer, optionally bounded.
    Int {
        /// Used when the field is absent.
        default: Option<i64>,
        /// Smallest acceptable value.
        min: Option<i64>,
        /// Largest acceptable value.
        max: Option<i64>,
    },
    /// Parse the value as a float.
    Float {
        /// Used when the field is absent.
        default: Option<f64>,
    },
    /// Parse the value as a datetime with an explicit chrono format,
    /// emitted in RFC 3339 shape.
    Date {
        /// strftime-style format the raw value must satisfy.
        format: String,
    },
    /// Translate the value through a table.
    Enum {
        /// Raw value to emitted value.
        translate: HashMap<String, Value>,
        /// Used when the raw value has no translation or is absent.
        default: Option<Value>,
    },
}

/// A composable `Form`: named, typed field extractors applied in order.
///
/// Fields absent from the input fall back to their default; a typed field
/// with no default reports the absence. Input fields the schema does not
/// name are passed through untouched.
#[derive(Debug, Default)]
pub struct Schema {
    fields: Vec<(String, Field)>,
}

impl Schema {
    /// Make an empty schema.
    pub fn new() -> Schema {
        Schema { fields: Vec::new() }
    }

    /// Add a field extractor, builder style.
    pub fn field(mut self, name: &str, field: Field) -> Schema {
        self.fields.push((name.to_string(), field));
        self
    }

    fn extract(
        &self,
        name: &str,
        field: &Field,
        raw: Option<&str>,
        errors: &mut Vec<String>,
    ) -> Option<Value> {
        match *field {
            Field::Str { ref default } => match raw {
                Some(v) => Some(Value::String(v.to_string())),
                None => match *default {
                    Some(ref d) => Some(Value::String(d.clone())),
                    None => {
                        errors.push(format!("{} is missing", name));
                        None
                    }
                },
            },
            Field::Int { default, min, max } => {
                let parsed = match raw {
                    Some(v) => match v.parse::<i64>() {
                        Ok(n) => Some(n),
                        Err(_) => {
                            errors
                                .push(format!("{} is not an integer: {:?}", name, v));
                            return None;
                        }
                    },
                    None => default,
                };
                let n = match parsed {
                    Some(n) => n,
                    None => {
                        errors.push(format!("{} is missing", name));
                        return None;
                    }
                };
                if let Some(min) = min {
                    if n < min {
                        errors.push(format!("{} is below {}: {}", name, min, n));
                        return None;
                    }
                }
                if let Some(max) = max {
                    if n > max {
                        errors.push(format!("{} is above {}: {}", name, max, n));
                        return None;
                    }
                }
                Some(Value::Number(Number::from(n)))
            }
            Field::Float { default } => {
                let parsed = match raw {
                    Some(v) => match v.parse::<f64>() {
                        Ok(n) => Some(n),
                        Err(_) => {
                            errors.push(format!("{} is not a float: {:?}", name, v));
                            return None;
                        }
                    },
                    None => default,
                };
                match parsed {
                    Some(n) => Number::from_f64(n).map(Value::Number),
                    None => {
                        errors.push(format!("{} is missing", name));
                        None
                    }
                }
            }
            Field::Date { ref format } => {
                let v = match raw {
                    Some(v) => v,
                    None => {
                        errors.push(format!("{} is missing", name));
                        return None;
                    }
                };
                match NaiveDateTime::parse_from_str(v, format) {
                    Ok(dt) => Some(Value::String(
                        dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    )),
                    Err(e) => {
                        errors.push(format!(
                            "{} {} for format {:?}",
                            name, e, format
                        ));
                        None
                    }
                }
            }
            Field::Enum {
                ref translate,
                ref default,
            } => {
                let fallback = || match *default {
                    Some(ref d) => Some(d.clone()),
                    None => None,
                };
                match raw {
                    Some(v) => match translate.get(v) {
                        Some(t) => Some(t.clone()),
                        None => match fallback() {
                            Some(d) => Some(d),
                            None => {
                                errors.push(format!(
                                    "{} has no translation: {:?}",
                                    name, v
                                ));
                                None
                            }
                        },
                    },
                    None => match fallback() {
                        Some(d) => Some(d),
                        None => {
                            errors.push(format!("{} is missing", name));
                            None
                        }
                    },
                }
            }
        }
    }
}

impl Form for Schema {
    fn apply(
        &self,
        fields: &Fields,
        _block: &Block,
    ) -> result::Result<Record, Vec<String>> {
        let mut out = Map::new();
        let mut errors = Vec::new();
        for &(ref name, ref field) in &self.fields {
            let raw = fields.get(name).and_then(|v| v.as_str());
            if let Some(value) = self.extract(name, field, raw, &mut errors) {
                out.insert(name.clone(), value);
            }
        }
        for (name, value) in fields {
            if !out.contains_key(name)
                && !self.fields.iter().any(|&(ref n, _)| n == name)
            {
                out.insert(name.clone(), value.clone());
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Value::Object(out))
    }
}
