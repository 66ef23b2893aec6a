use crate::value::{equal, Value};

/// Index argument to a list block, after coercion.
pub enum ListIndex {
  Position(f64),
  Last,
  Random,
  All,
}

impl ListIndex {
  pub fn from_value(v: &Value) -> ListIndex {
    if let Value::String(s) = v {
      match s.as_str() {
        "last" => return ListIndex::Last,
        "random" | "any" => return ListIndex::Random,
        "all" => return ListIndex::All,
        _ => {}
      }
    }
    ListIndex::Position(v.to_number())
  }
}

/// An ordered sequence of values. Every mutation raises `modified` so a
/// watcher can refresh lazily instead of diffing each frame.
#[derive(Debug, Clone, Default)]
pub struct List {
  items: Vec<Value>,
  pub modified: bool,
}

impl List {
  pub fn new(items: Vec<Value>) -> List {
    List {
      items,
      modified: false,
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn items(&self) -> &[Value] {
    &self.items
  }

  /// Resolves a 1-based index (or keyword) to a vec index; None means the
  /// operation silently does nothing.
  fn resolve(&self, index: &ListIndex, len: usize) -> Option<usize> {
    match index {
      ListIndex::Last => len.checked_sub(1),
      ListIndex::Random => {
        if len == 0 {
          None
        } else {
          Some(unsafe { libc::rand() } as usize % len)
        }
      }
      ListIndex::All => None,
      ListIndex::Position(n) => {
        let i = *n as i64;
        if i >= 1 && i <= len as i64 {
          Some(i as usize - 1)
        } else {
          None
        }
      }
    }
  }

  pub fn push(&mut self, value: Value) {
    self.modified = true;
    self.items.push(value);
  }

  pub fn delete(&mut self, index: &ListIndex) {
    if let ListIndex::All = index {
      self.modified = true;
      self.items.clear();
      return;
    }
    if let Some(i) = self.resolve(index, self.items.len()) {
      self.modified = true;
      self.items.remove(i);
    }
  }

  pub fn delete_all(&mut self) {
    self.modified = true;
    self.items.clear();
  }

  /// Insert allows one-past-the-end, which appends.
  pub fn insert(&mut self, index: &ListIndex, value: Value) {
    match self.resolve(index, self.items.len() + 1) {
      Some(i) if i == self.items.len() => {
        self.modified = true;
        self.items.push(value);
      }
      Some(i) => {
        self.modified = true;
        self.items.insert(i, value);
      }
      None => {}
    }
  }

  pub fn set(&mut self, index: &ListIndex, value: Value) {
    if let Some(i) = self.resolve(index, self.items.len()) {
      self.modified = true;
      self.items[i] = value;
    }
  }

  pub fn item(&self, index: &ListIndex) -> Value {
    match self.resolve(index, self.items.len()) {
      Some(i) => self.items[i].clone(),
      None => Value::String(String::new()),
    }
  }

  pub fn contains(&self, value: &Value) -> bool {
    self.items.iter().any(|item| equal(item, value))
  }

  /// 1-based position of the first matching item, 0 when absent.
  pub fn index_of(&self, value: &Value) -> f64 {
    for (i, item) in self.items.iter().enumerate() {
      if equal(item, value) {
        return (i + 1) as f64;
      }
    }
    0.
  }

  /// The list as text: joined bare when every item is a single character,
  /// space-separated otherwise.
  pub fn contents(&self) -> String {
    let single = self
      .items
      .iter()
      .all(|item| item.to_string().chars().count() == 1);
    let sep = if single { "" } else { " " };
    self
      .items
      .iter()
      .map(|item| item.to_string())
      .collect::<Vec<_>>()
      .join(sep)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn list(items: &[f64]) -> List {
    List::new(items.iter().map(|n| Value::Number(*n)).collect())
  }

  #[test]
  fn one_based_indexing() {
    let l = list(&[10., 20., 30.]);
    assert_eq!(l.item(&ListIndex::Position(1.)), Value::Number(10.));
    assert_eq!(l.item(&ListIndex::Last), Value::Number(30.));
    assert_eq!(l.item(&ListIndex::Position(0.)), Value::String(String::new()));
    assert_eq!(l.item(&ListIndex::Position(4.)), Value::String(String::new()));
  }

  #[test]
  fn out_of_range_mutations_are_no_ops() {
    let mut l = list(&[1., 2.]);
    l.set(&ListIndex::Position(5.), Value::Number(9.));
    l.delete(&ListIndex::Position(0.));
    assert_eq!(l.len(), 2);
    assert!(!l.modified);
  }

  #[test]
  fn insert_at_end_appends() {
    let mut l = list(&[1., 2.]);
    l.insert(&ListIndex::Position(3.), Value::Number(3.));
    assert_eq!(l.item(&ListIndex::Position(3.)), Value::Number(3.));
  }

  #[test]
  fn delete_all_clears() {
    let mut l = list(&[1., 2., 3.]);
    l.delete(&ListIndex::from_value(&Value::String("all".to_string())));
    assert!(l.is_empty());
    assert!(l.modified);
  }

  #[test]
  fn mutation_sets_modified_flag() {
    let mut l = list(&[1.]);
    assert!(!l.modified);
    l.push(Value::Number(2.));
    assert!(l.modified);
    l.modified = false;
    l.set(&ListIndex::Position(1.), Value::Number(5.));
    assert!(l.modified);
  }

  #[test]
  fn loose_equality_in_search() {
    let l = List::new(vec![Value::String("2".to_string()), Value::Number(3.)]);
    assert!(l.contains(&Value::Number(2.)));
    assert_eq!(l.index_of(&Value::String("3".to_string())), 2.);
    assert_eq!(l.index_of(&Value::Number(9.)), 0.);
  }

  #[test]
  fn contents_join_rule() {
    let l = List::new(vec![
      Value::String("a".to_string()),
      Value::String("b".to_string()),
    ]);
    assert_eq!(l.contents(), "ab");
    let l = List::new(vec![
      Value::String("ab".to_string()),
      Value::String("c".to_string()),
    ]);
    assert_eq!(l.contents(), "ab c");
  }
}
