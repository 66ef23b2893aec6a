use crate::runtime::RuntimeError;
use crate::sprite::Sprite;

/// Stage-coordinate bounding box of a sprite, y up.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
  pub left: f64,
  pub right: f64,
  pub bottom: f64,
  pub top: f64,
}

impl Bounds {
  pub fn contains(&self, x: f64, y: f64) -> bool {
    x >= self.left && x <= self.right && y >= self.bottom && y <= self.top
  }

  pub fn intersects(&self, other: &Bounds) -> bool {
    self.left <= other.right
      && other.left <= self.right
      && self.bottom <= other.top
      && other.bottom <= self.top
  }
}

/// The runtime's view of the renderer: hit tests only. Drawing happens in
/// the host's render pass; pixel-accurate collision belongs to a real
/// renderer implementation.
pub trait Renderer {
  fn bounds(&self, sprite: &Sprite) -> Option<Bounds>;

  fn touches_point(&self, sprite: &Sprite, x: f64, y: f64) -> Result<bool, RuntimeError> {
    Ok(
      sprite.state.visible
        && self
          .bounds(sprite)
          .map(|b| b.contains(x, y))
          .unwrap_or(false),
    )
  }

  fn intersects(&self, a: &Sprite, b: &Sprite) -> Result<bool, RuntimeError> {
    Ok(
      a.state.visible
        && b.state.visible
        && match (self.bounds(a), self.bounds(b)) {
          (Some(ba), Some(bb)) => ba.intersects(&bb),
          _ => false,
        },
    )
  }

  fn touches_color(&self, sprite: &Sprite, color: u32) -> Result<bool, RuntimeError>;

  fn color_touches_color(
    &self,
    sprite: &Sprite,
    own: u32,
    other: u32,
  ) -> Result<bool, RuntimeError>;
}

/// Axis-aligned boxes from costume metadata; color tests degrade to false.
#[derive(Debug, Default)]
pub struct BoundsRenderer;

impl Renderer for BoundsRenderer {
  fn bounds(&self, sprite: &Sprite) -> Option<Bounds> {
    let costume = sprite.current_costume()?;
    if costume.width == 0. || costume.height == 0. {
      return None;
    }
    let scale = sprite.state.size / 100. / costume.bitmap_resolution;
    let w = costume.width * scale;
    let h = costume.height * scale;
    Some(Bounds {
      left: sprite.state.x - w / 2.,
      right: sprite.state.x + w / 2.,
      bottom: sprite.state.y - h / 2.,
      top: sprite.state.y + h / 2.,
    })
  }

  fn touches_color(&self, _sprite: &Sprite, _color: u32) -> Result<bool, RuntimeError> {
    Ok(false)
  }

  fn color_touches_color(
    &self,
    _sprite: &Sprite,
    _own: u32,
    _other: u32,
  ) -> Result<bool, RuntimeError> {
    Ok(false)
  }
}
