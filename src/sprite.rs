use std::collections::HashMap;
use std::rc::Rc;

use crate::block::{Filter, Program, TargetId};
use crate::costume::{Costume, Sound};
use crate::list::List;
use crate::pen::{PenOp, PenState};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStyle {
  AllAround,
  LeftRight,
  DontRotate,
}

impl RotationStyle {
  pub fn parse(s: &str) -> RotationStyle {
    match s {
      "left-right" => RotationStyle::LeftRight,
      "don't rotate" => RotationStyle::DontRotate,
      _ => RotationStyle::AllAround,
    }
  }
}

/// Graphic effects. Values are free-form except where the original clamps.
#[derive(Debug, Clone, Default)]
pub struct Filters {
  pub color: f64,
  pub fisheye: f64,
  pub whirl: f64,
  pub pixelate: f64,
  pub mosaic: f64,
  pub brightness: f64,
  pub ghost: f64,
}

impl Filters {
  pub fn set(&mut self, filter: Filter, value: f64) {
    match filter {
      Filter::Color => self.color = value,
      Filter::Fisheye => self.fisheye = value,
      Filter::Whirl => self.whirl = value,
      Filter::Pixelate => self.pixelate = value,
      Filter::Mosaic => self.mosaic = value,
      Filter::Brightness => self.brightness = value.clamp(-100., 100.),
      Filter::Ghost => self.ghost = value.clamp(0., 100.),
    }
  }

  pub fn get(&self, filter: Filter) -> f64 {
    match filter {
      Filter::Color => self.color,
      Filter::Fisheye => self.fisheye,
      Filter::Whirl => self.whirl,
      Filter::Pixelate => self.pixelate,
      Filter::Mosaic => self.mosaic,
      Filter::Brightness => self.brightness,
      Filter::Ghost => self.ghost,
    }
  }

  pub fn change(&mut self, filter: Filter, delta: f64) {
    self.set(filter, self.get(filter) + delta);
  }

  pub fn reset(&mut self) {
    *self = Filters::default();
  }
}

#[derive(Debug, Clone)]
pub struct Say {
  pub text: String,
  pub thinking: bool,
  pub id: u32,
}

/// Immutable per-sprite data: compiled program, costume and sound tables,
/// name lookups. Shared by reference between a sprite and its clones.
#[derive(Debug)]
pub struct SpriteData {
  pub name: String,
  pub costumes: Vec<Costume>,
  pub costume_index: HashMap<String, usize>,
  pub sounds: Vec<Sound>,
  pub sound_index: HashMap<String, usize>,
  pub var_names: HashMap<String, usize>,
  pub list_names: HashMap<String, usize>,
  pub program: Rc<Program>,
}

/// Mutable per-instance state; copied by value into clones so storage is
/// never aliased between a clone and its origin.
#[derive(Debug, Clone)]
pub struct SpriteState {
  pub x: f64,
  pub y: f64,
  pub direction: f64,
  pub size: f64,
  pub visible: bool,
  pub draggable: bool,
  pub rotation_style: RotationStyle,
  pub current_costume: usize,
  pub volume: f64,
  pub instrument: usize,
  pub vars: Vec<Value>,
  pub lists: Vec<List>,
  pub filters: Filters,
  pub pen: PenState,
  pub say: Option<Say>,
}

#[derive(Debug)]
pub struct Sprite {
  pub id: TargetId,
  pub is_clone: bool,
  pub data: Rc<SpriteData>,
  pub state: SpriteState,
}

impl Sprite {
  /// A runtime duplicate: shares the compiled data, copies the state.
  /// The speech bubble stays with the original.
  pub fn clone_as(&self, id: TargetId) -> Sprite {
    let mut state = self.state.clone();
    state.say = None;
    Sprite {
      id,
      is_clone: true,
      data: Rc::clone(&self.data),
      state,
    }
  }

  pub fn current_costume(&self) -> Option<&Costume> {
    self.data.costumes.get(self.state.current_costume)
  }
}

impl SpriteState {
  /// All position changes go through here so a lowered pen leaves a line.
  pub fn move_to(&mut self, pen_ops: &mut Vec<PenOp>, x: f64, y: f64) {
    if self.pen.down && (x != self.x || y != self.y) {
      pen_ops.push(PenOp::Line {
        x1: self.x,
        y1: self.y,
        x2: x,
        y2: y,
        size: self.pen.size,
        color: self.pen.rgba(),
      });
    }
    self.x = x;
    self.y = y;
  }

  pub fn forward(&mut self, pen_ops: &mut Vec<PenOp>, steps: f64) {
    let rad = (90. - self.direction).to_radians();
    self.move_to(
      pen_ops,
      self.x + steps * rad.cos(),
      self.y + steps * rad.sin(),
    );
  }

  /// Directions are kept in (-180, 180].
  pub fn set_direction(&mut self, degrees: f64) {
    if !degrees.is_finite() {
      return;
    }
    let d = degrees.rem_euclid(360.);
    self.direction = if d > 180. { d - 360. } else { d };
  }

  pub fn dot_pen(&mut self, pen_ops: &mut Vec<PenOp>) {
    pen_ops.push(PenOp::Dot {
      x: self.x,
      y: self.y,
      size: self.pen.size,
      color: self.pen.rgba(),
    });
  }

  /// Turns back toward the stage when the costume bounds poke past an
  /// edge, then nudges the sprite back inside.
  pub fn bounce_off_edge(
    &mut self,
    pen_ops: &mut Vec<PenOp>,
    half_w: f64,
    half_h: f64,
    stage_w: f64,
    stage_h: f64,
  ) {
    let rad = (90. - self.direction).to_radians();
    let mut dx = rad.cos();
    let mut dy = rad.sin();
    let mut bounced = false;
    if self.x - half_w < -stage_w / 2. {
      dx = dx.abs();
      bounced = true;
    }
    if self.x + half_w > stage_w / 2. {
      dx = -dx.abs();
      bounced = true;
    }
    if self.y + half_h > stage_h / 2. {
      dy = -dy.abs();
      bounced = true;
    }
    if self.y - half_h < -stage_h / 2. {
      dy = dy.abs();
      bounced = true;
    }
    if !bounced {
      return;
    }
    self.set_direction(90. - dy.atan2(dx).to_degrees());
    let x = self
      .x
      .clamp(-stage_w / 2. + half_w, stage_w / 2. - half_w);
    let y = self
      .y
      .clamp(-stage_h / 2. + half_h, stage_h / 2. - half_h);
    self.move_to(pen_ops, x, y);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn state() -> SpriteState {
    SpriteState {
      x: 0.,
      y: 0.,
      direction: 90.,
      size: 100.,
      visible: true,
      draggable: false,
      rotation_style: RotationStyle::AllAround,
      current_costume: 0,
      volume: 100.,
      instrument: 0,
      vars: Vec::new(),
      lists: Vec::new(),
      filters: Filters::default(),
      pen: PenState::default(),
      say: None,
    }
  }

  #[test]
  fn forward_follows_direction() {
    let mut s = state();
    let mut ops = Vec::new();
    s.forward(&mut ops, 10.);
    assert!((s.x - 10.).abs() < 1e-9);
    assert!(s.y.abs() < 1e-9);
    s.set_direction(0.);
    s.forward(&mut ops, 5.);
    assert!((s.y - 5.).abs() < 1e-9);
  }

  #[test]
  fn direction_normalizes() {
    let mut s = state();
    s.set_direction(270.);
    assert_eq!(s.direction, -90.);
    s.set_direction(-270.);
    assert_eq!(s.direction, 90.);
    s.set_direction(180.);
    assert_eq!(s.direction, 180.);
  }

  #[test]
  fn pen_down_records_lines() {
    let mut s = state();
    let mut ops = Vec::new();
    s.move_to(&mut ops, 5., 5.);
    assert!(ops.is_empty());
    s.pen.down = true;
    s.move_to(&mut ops, 10., 10.);
    assert_eq!(ops.len(), 1);
  }

  #[test]
  fn filters_clamp_where_needed() {
    let mut f = Filters::default();
    f.set(Filter::Ghost, 250.);
    assert_eq!(f.ghost, 100.);
    f.change(Filter::Brightness, -500.);
    assert_eq!(f.brightness, -100.);
    f.set(Filter::Whirl, 720.);
    assert_eq!(f.whirl, 720.);
  }
}
