use std::collections::HashMap;
use std::fmt;
use std::fmt::Formatter;

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::value::Value;

/// Raw `project.json` shapes. Positional-array encodings (inputs, fields,
/// variables, lists) get hand-written visitors; everything else is plain
/// derive.

#[derive(Debug, Deserialize)]
pub struct Project {
  pub targets: Vec<Target>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
  pub is_stage: bool,
  pub name: String,
  #[serde(default)]
  pub variables: HashMap<String, Variable>,
  #[serde(default)]
  pub lists: HashMap<String, ListDecl>,
  #[serde(default)]
  pub broadcasts: HashMap<String, String>,
  #[serde(default)]
  pub blocks: Blocks,
  pub current_costume: usize,
  pub costumes: Vec<Costume>,
  #[serde(default)]
  pub sounds: Vec<Sound>,
  #[serde(default = "default_volume")]
  pub volume: f64,
  #[serde(default)]
  pub layer_order: i32,
  #[serde(default)]
  pub tempo: Option<f64>,
  #[serde(default = "default_true")]
  pub visible: bool,
  #[serde(default)]
  pub x: f64,
  #[serde(default)]
  pub y: f64,
  #[serde(default = "default_size")]
  pub size: f64,
  #[serde(default = "default_direction")]
  pub direction: f64,
  #[serde(default)]
  pub draggable: bool,
  #[serde(default = "default_rotation_style")]
  pub rotation_style: String,
}

fn default_true() -> bool {
  true
}

fn default_volume() -> f64 {
  100.
}

fn default_size() -> f64 {
  100.
}

fn default_direction() -> f64 {
  90.
}

fn default_rotation_style() -> String {
  "all around".to_string()
}

/// The block table. Detached variable/list reporters are serialized as
/// bare arrays instead of objects; they carry no code and are dropped.
#[derive(Debug, Default)]
pub struct Blocks(pub HashMap<String, Block>);

impl<'de> Deserialize<'de> for Blocks {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    let raw: HashMap<String, serde_json::Value> = Deserialize::deserialize(de)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (id, value) in raw {
      if !value.is_object() {
        continue;
      }
      match serde_json::from_value::<Block>(value) {
        Ok(block) => {
          out.insert(id, block);
        }
        Err(err) => log::warn!("skipping malformed block {id}: {err}"),
      }
    }
    Ok(Blocks(out))
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
  pub opcode: String,
  pub next: Option<String>,
  pub parent: Option<String>,
  #[serde(default)]
  pub inputs: HashMap<String, Input>,
  #[serde(default)]
  pub fields: HashMap<String, Field>,
  #[serde(default)]
  pub mutation: Option<Mutation>,
  #[serde(default)]
  pub top_level: bool,
}

/// Custom-block metadata. The argument id/name lists arrive as stringified
/// JSON arrays and `warp` is sometimes a string for no particular reason.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
  #[serde(default)]
  pub proccode: Option<String>,
  #[serde(default)]
  pub argumentids: Option<String>,
  #[serde(default)]
  pub argumentnames: Option<String>,
  #[serde(default)]
  pub warp: Option<serde_json::Value>,
}

impl Mutation {
  pub fn warp_flag(&self) -> bool {
    match &self.warp {
      Some(serde_json::Value::Bool(b)) => *b,
      Some(serde_json::Value::String(s)) => s == "true",
      _ => false,
    }
  }

  pub fn argument_ids(&self) -> Vec<String> {
    self
      .argumentids
      .as_deref()
      .and_then(|s| serde_json::from_str(s).ok())
      .unwrap_or_default()
  }

  pub fn argument_names(&self) -> Vec<String> {
    self
      .argumentnames
      .as_deref()
      .and_then(|s| serde_json::from_str(s).ok())
      .unwrap_or_default()
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Costume {
  pub name: String,
  #[serde(default = "default_bitmap_resolution")]
  pub bitmap_resolution: f64,
  pub md5ext: Option<String>,
  #[serde(default)]
  pub asset_id: String,
  #[serde(default)]
  pub data_format: String,
  #[serde(default)]
  pub rotation_center_x: f64,
  #[serde(default)]
  pub rotation_center_y: f64,
}

fn default_bitmap_resolution() -> f64 {
  1.
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sound {
  pub name: String,
  pub md5ext: Option<String>,
  #[serde(default)]
  pub rate: f64,
  #[serde(default)]
  pub sample_count: f64,
}

/// `[name, value]`, with an optional third element marking the variable as
/// a cloud variable.
#[derive(Debug)]
pub struct Variable {
  pub name: String,
  pub value: Value,
  pub cloud: bool,
}

impl<'de> Deserialize<'de> for Variable {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    struct SeqVisitor;
    impl<'de> Visitor<'de> for SeqVisitor {
      type Value = Variable;
      fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "a [name, value] variable tuple")
      }
      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let name: String = seq.next_element()?.unwrap_or_default();
        let value: JsonValue = seq.next_element()?.unwrap_or_default();
        let cloud: Option<bool> = seq.next_element()?;
        while seq.next_element::<serde_json::Value>()?.is_some() {}
        Ok(Variable {
          name,
          value: value.0,
          cloud: cloud.unwrap_or(false),
        })
      }
    }
    de.deserialize_seq(SeqVisitor)
  }
}

/// `[name, [values...]]`.
#[derive(Debug)]
pub struct ListDecl {
  pub name: String,
  pub values: Vec<Value>,
}

impl<'de> Deserialize<'de> for ListDecl {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    let (name, values): (String, Vec<JsonValue>) = Deserialize::deserialize(de)?;
    Ok(ListDecl {
      name,
      values: values.into_iter().map(|v| v.0).collect(),
    })
  }
}

/// A scalar JSON value decoded into a runtime `Value`.
#[derive(Debug)]
pub struct JsonValue(pub Value);

impl Default for JsonValue {
  fn default() -> Self {
    JsonValue(Value::Number(0.))
  }
}

impl<'de> Deserialize<'de> for JsonValue {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    let raw = serde_json::Value::deserialize(de)?;
    Ok(JsonValue(json_to_value(&raw)))
  }
}

pub fn json_to_value(raw: &serde_json::Value) -> Value {
  match raw {
    serde_json::Value::Bool(b) => Value::Bool(*b),
    serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.)),
    serde_json::Value::String(s) => Value::String(s.clone()),
    _ => Value::Number(0.),
  }
}

/// `[value]` or `[value, id]`; the value may itself be a number.
#[derive(Debug)]
pub struct Field {
  pub value: Value,
  pub id: Option<String>,
}

impl Field {
  pub fn as_str(&self) -> String {
    self.value.to_string()
  }
}

impl<'de> Deserialize<'de> for Field {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    struct SeqVisitor;
    impl<'de> Visitor<'de> for SeqVisitor {
      type Value = Field;
      fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "a [value, id?] field tuple")
      }
      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let value: JsonValue = seq.next_element()?.unwrap_or_default();
        let id: Option<String> = seq.next_element()?.unwrap_or(None);
        while seq.next_element::<serde_json::Value>()?.is_some() {}
        Ok(Field {
          value: value.0,
          id,
        })
      }
    }
    de.deserialize_seq(SeqVisitor)
  }
}

/// A block input: `[shadow, content, ...]` where the content is either a
/// block id string or a typed literal array (types 4-13).
#[derive(Debug)]
pub enum Input {
  Block(String),
  Literal(Value),
  Broadcast { name: String, id: String },
  Variable { name: String, id: String },
  List { name: String, id: String },
  Empty,
}

impl<'de> Deserialize<'de> for Input {
  fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
    struct SeqVisitor;
    impl<'de> Visitor<'de> for SeqVisitor {
      type Value = Input;
      fn expecting(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "an input array")
      }
      fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let _shadow = seq.next_element::<serde_json::Value>()?;
        let content = seq.next_element::<serde_json::Value>()?;
        while seq.next_element::<serde_json::Value>()?.is_some() {}
        let content = match content {
          Some(c) => c,
          None => return Ok(Input::Empty),
        };
        match content {
          serde_json::Value::String(id) => Ok(Input::Block(id)),
          serde_json::Value::Array(values) => Ok(decode_typed(&values)),
          _ => Ok(Input::Empty),
        }
      }
    }
    de.deserialize_seq(SeqVisitor)
  }
}

// Typed literal encodings from the serialization format.
const BROADCAST_PRIMITIVE: u64 = 11;
const VAR_PRIMITIVE: u64 = 12;
const LIST_PRIMITIVE: u64 = 13;

fn decode_typed(values: &[serde_json::Value]) -> Input {
  let kind = values.first().and_then(|v| v.as_u64()).unwrap_or(0);
  let second = values.get(1);
  let str_at = |i: usize| {
    values
      .get(i)
      .and_then(|v| v.as_str())
      .unwrap_or_default()
      .to_string()
  };
  match kind {
    4..=10 => match second {
      Some(raw) => Input::Literal(json_to_value(raw)),
      None => Input::Empty,
    },
    BROADCAST_PRIMITIVE => Input::Broadcast {
      name: str_at(1),
      id: str_at(2),
    },
    VAR_PRIMITIVE => Input::Variable {
      name: str_at(1),
      id: str_at(2),
    },
    LIST_PRIMITIVE => Input::List {
      name: str_at(1),
      id: str_at(2),
    },
    _ => Input::Empty,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn input_decodes_literal_and_block() {
    let literal: Input = serde_json::from_str(r#"[1, [4, "10"]]"#).unwrap();
    assert!(matches!(literal, Input::Literal(Value::String(ref s)) if s == "10"));
    let block: Input = serde_json::from_str(r#"[3, "someId", [10, ""]]"#).unwrap();
    assert!(matches!(block, Input::Block(ref id) if id == "someId"));
    let empty: Input = serde_json::from_str(r#"[1, null]"#).unwrap();
    assert!(matches!(empty, Input::Empty));
  }

  #[test]
  fn input_decodes_variable_reference() {
    let input: Input = serde_json::from_str(r#"[3, [12, "score", "varId"], [10, ""]]"#).unwrap();
    match input {
      Input::Variable { name, id } => {
        assert_eq!(name, "score");
        assert_eq!(id, "varId");
      }
      other => panic!("expected variable input, got {other:?}"),
    }
  }

  #[test]
  fn variable_tuple_with_cloud_flag() {
    let var: Variable = serde_json::from_str(r#"["☁ high score", 42, true]"#).unwrap();
    assert_eq!(var.name, "☁ high score");
    assert_eq!(var.value, Value::Number(42.));
    assert!(var.cloud);
  }

  #[test]
  fn field_tuple_variants() {
    let f: Field = serde_json::from_str(r#"["VARIABLE", "id"]"#).unwrap();
    assert_eq!(f.as_str(), "VARIABLE");
    assert_eq!(f.id.as_deref(), Some("id"));
    let f: Field = serde_json::from_str(r#"["number"]"#).unwrap();
    assert_eq!(f.as_str(), "number");
    assert!(f.id.is_none());
  }

  #[test]
  fn mutation_parses_stringified_lists() {
    let m: Mutation = serde_json::from_str(
      r#"{"proccode": "jump %s", "argumentids": "[\"a\"]", "argumentnames": "[\"height\"]", "warp": "true"}"#,
    )
    .unwrap();
    assert!(m.warp_flag());
    assert_eq!(m.argument_names(), vec!["height".to_string()]);
    assert_eq!(m.argument_ids(), vec!["a".to_string()]);
  }
}
