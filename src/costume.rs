use std::collections::HashMap;

use crate::value::Value;

/// Costume metadata the runtime needs; pixels live with the renderer.
/// `width`/`height` are filled in once textures are loaded and stay 0 for
/// headless runs.
#[derive(Debug, Clone)]
pub struct Costume {
  pub name: String,
  pub md5ext: String,
  pub bitmap_resolution: f64,
  pub rotation_center_x: f64,
  pub rotation_center_y: f64,
  pub width: f64,
  pub height: f64,
}

/// Sound metadata; the duration is derived from the sample count so timing
/// works even when no audio backend is attached.
#[derive(Debug, Clone)]
pub struct Sound {
  pub name: String,
  pub md5ext: Option<String>,
  pub duration_secs: f64,
}

/// Costume switching shared by sprites (costumes) and the stage
/// (backdrops): name first, then the next/previous keywords, then a
/// wrapped 1-based number.
pub fn set_costume(
  costumes: &[Costume],
  by_name: &HashMap<String, usize>,
  current: &mut usize,
  value: &Value,
  is_stage: bool,
) {
  if costumes.is_empty() {
    return;
  }
  let n = match value {
    Value::Number(n) => *n,
    _ => {
      let name = value.to_string();
      if let Some(i) = by_name.get(&name) {
        *current = *i;
        return;
      }
      let (next, previous) = if is_stage {
        ("next backdrop", "previous backdrop")
      } else {
        ("next costume", "previous costume")
      };
      if name == next {
        next_costume(costumes, current);
        return;
      }
      if name == previous {
        previous_costume(costumes, current);
        return;
      }
      let parsed = value.to_number_raw();
      if !parsed.is_finite() {
        return;
      }
      parsed
    }
  };
  let len = costumes.len() as i64;
  let i = (n.round() as i64 - 1).rem_euclid(len);
  *current = i as usize;
}

pub fn next_costume(costumes: &[Costume], current: &mut usize) {
  if !costumes.is_empty() {
    *current = (*current + 1) % costumes.len();
  }
}

pub fn previous_costume(costumes: &[Costume], current: &mut usize) {
  if !costumes.is_empty() {
    *current = (*current + costumes.len() - 1) % costumes.len();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn fixtures() -> (Vec<Costume>, HashMap<String, usize>) {
    let costumes: Vec<Costume> = ["a", "b", "c"]
      .iter()
      .map(|name| Costume {
        name: name.to_string(),
        md5ext: format!("{name}.png"),
        bitmap_resolution: 1.,
        rotation_center_x: 0.,
        rotation_center_y: 0.,
        width: 0.,
        height: 0.,
      })
      .collect();
    let by_name = costumes
      .iter()
      .enumerate()
      .map(|(i, c)| (c.name.clone(), i))
      .collect();
    (costumes, by_name)
  }

  #[test]
  fn switch_by_name_then_number() {
    let (costumes, by_name) = fixtures();
    let mut current = 0;
    set_costume(&costumes, &by_name, &mut current, &Value::from("c"), false);
    assert_eq!(current, 2);
    set_costume(&costumes, &by_name, &mut current, &Value::Number(2.), false);
    assert_eq!(current, 1);
    // Numbers wrap around.
    set_costume(&costumes, &by_name, &mut current, &Value::Number(5.), false);
    assert_eq!(current, 1);
  }

  #[test]
  fn next_and_previous_keywords() {
    let (costumes, by_name) = fixtures();
    let mut current = 2;
    set_costume(
      &costumes,
      &by_name,
      &mut current,
      &Value::from("next costume"),
      false,
    );
    assert_eq!(current, 0);
    set_costume(
      &costumes,
      &by_name,
      &mut current,
      &Value::from("previous backdrop"),
      true,
    );
    assert_eq!(current, 2);
  }

  #[test]
  fn unknown_name_is_ignored() {
    let (costumes, by_name) = fixtures();
    let mut current = 1;
    set_costume(&costumes, &by_name, &mut current, &Value::from("nope"), false);
    assert_eq!(current, 1);
  }
}
