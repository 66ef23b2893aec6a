mod audio;
mod block;
mod compiler;
mod costume;
mod exec;
mod input;
mod list;
mod pen;
mod project;
mod renderer;
mod runtime;
mod sb3;
mod sprite;
mod stage;
mod value;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use derivative::Derivative;
use log::warn;
use sdl2::event::Event;
use sdl2::image::LoadTexture;
use sdl2::keyboard::Keycode;
use sdl2::pixels::Color;
use sdl2::rect::Rect;
use sdl2::render::{Canvas, Texture, TextureCreator};
use sdl2::ttf::Font;
use sdl2::video::{Window, WindowContext};

use crate::pen::PenOp;
use crate::project::{load_sb3, Config, Project};
use crate::sprite::RotationStyle;

#[derive(Parser, Debug)]
#[command(author, version, about = "A Scratch project player")]
struct Args {
  /// Path to the .sb3 project file
  project: PathBuf,

  /// Frames per second
  #[arg(long, default_value_t = 30)]
  fps: u32,

  /// Run non-stop (turbo mode)
  #[arg(long)]
  turbo: bool,

  /// TTF font used for say/think bubbles
  #[arg(long)]
  font: Option<PathBuf>,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Assets<'a> {
  #[derivative(Debug = "ignore")]
  textures: HashMap<String, Texture<'a>>,
}

fn load_textures<'a>(
  project: &mut Project,
  texture_creator: &'a TextureCreator<WindowContext>,
) -> Assets<'a> {
  let mut assets = Assets {
    textures: HashMap::new(),
  };
  for md5ext in project.costume_files() {
    match texture_creator.load_texture(format!("tmp/{md5ext}")) {
      Ok(texture) => {
        let query = texture.query();
        project.set_costume_dims(&md5ext, query.width as f64, query.height as f64);
        assets.textures.insert(md5ext, texture);
      }
      Err(err) => warn!("could not load costume {md5ext}: {err}"),
    }
  }
  assets
}

fn render_pen(project: &Project, canvas: &mut Canvas<Window>, assets: &Assets) {
  let w = project.config.stage_width as f64;
  let h = project.config.stage_height as f64;
  let to_screen = |x: f64, y: f64| ((x + w / 2.) as i32, (h / 2. - y) as i32);
  for op in &project.pen_ops {
    match op {
      PenOp::Line {
        x1,
        y1,
        x2,
        y2,
        color,
        ..
      } => {
        canvas.set_draw_color(Color::RGBA(color.r, color.g, color.b, color.a));
        if canvas.draw_line(to_screen(*x1, *y1), to_screen(*x2, *y2)).is_err() {
          continue;
        }
      }
      PenOp::Dot { x, y, size, color } => {
        canvas.set_draw_color(Color::RGBA(color.r, color.g, color.b, color.a));
        let (sx, sy) = to_screen(*x, *y);
        let s = (*size).max(1.) as u32;
        let _ = canvas.fill_rect(Rect::new(sx - s as i32 / 2, sy - s as i32 / 2, s, s));
      }
      PenOp::Stamp {
        md5ext,
        x,
        y,
        scale,
        direction,
      } => {
        if let Some(texture) = assets.textures.get(md5ext) {
          let query = texture.query();
          let width = (query.width as f64 * scale) as u32;
          let height = (query.height as f64 * scale) as u32;
          let (sx, sy) = to_screen(*x, *y);
          let _ = canvas.copy_ex(
            texture,
            None,
            Rect::new(sx - width as i32 / 2, sy - height as i32 / 2, width, height),
            direction - 90.,
            None,
            false,
            false,
          );
        }
      }
    }
  }
}

fn render(
  project: &Project,
  canvas: &mut Canvas<Window>,
  texture_creator: &TextureCreator<WindowContext>,
  assets: &Assets,
  font: Option<&Font>,
) {
  canvas.set_draw_color(Color::WHITE);
  canvas.clear();
  let stage_w = project.config.stage_width;
  let stage_h = project.config.stage_height;

  if let Some(costume) = project.stage.costumes.get(project.stage.current_costume) {
    if let Some(texture) = assets.textures.get(&costume.md5ext) {
      let query = texture.query();
      let x = stage_w as i32 / 2 - query.width as i32 / 2;
      let y = stage_h as i32 / 2 - query.height as i32 / 2;
      let _ = canvas.copy(texture, None, Rect::new(x, y, query.width, query.height));
    }
  }

  render_pen(project, canvas, assets);

  for id in &project.layers {
    let sprite = match project.sprite(*id) {
      Some(s) => s,
      None => continue,
    };
    if !sprite.state.visible {
      continue;
    }
    let costume = match sprite.current_costume() {
      Some(c) => c,
      None => continue,
    };
    let texture = match assets.textures.get(&costume.md5ext) {
      Some(t) => t,
      None => continue,
    };
    let query = texture.query();
    let scale = sprite.state.size / 100. / costume.bitmap_resolution;
    let width = (query.width as f64 * scale) as u32;
    let height = (query.height as f64 * scale) as u32;
    let x = stage_w as i32 / 2 + sprite.state.x as i32 - width as i32 / 2;
    let y = stage_h as i32 / 2 - sprite.state.y as i32 - height as i32 / 2;
    let (angle, flip) = match sprite.state.rotation_style {
      RotationStyle::AllAround => (sprite.state.direction - 90., false),
      RotationStyle::DontRotate => (0., false),
      RotationStyle::LeftRight => (0., sprite.state.direction < 0.),
    };
    let _ = canvas.copy_ex(
      texture,
      None,
      Rect::new(x, y, width, height),
      angle,
      None,
      false,
      flip,
    );

    if let (Some(say), Some(font)) = (&sprite.state.say, font) {
      if let Ok(surface) = font.render(say.text.as_str()).blended(Color::BLACK) {
        if let Ok(bubble) = texture_creator.create_texture_from_surface(&surface) {
          let query = bubble.query();
          let _ = canvas.copy(
            &bubble,
            None,
            Rect::new(x, y - query.height as i32, query.width, query.height),
          );
        }
      }
    }
  }
}

/// SDL keycode to the key codes scripts listen on.
fn scratch_key(keycode: Keycode) -> Option<u8> {
  match keycode {
    Keycode::Space => Some(32),
    Keycode::Left => Some(37),
    Keycode::Up => Some(38),
    Keycode::Right => Some(39),
    Keycode::Down => Some(40),
    Keycode::Return => Some(13),
    _ => {
      let name = keycode.name();
      let mut chars = name.chars();
      match (chars.next(), chars.next()) {
        (Some(c), None) => {
          let c = c.to_ascii_uppercase() as u32;
          if c < 128 {
            Some(c as u8)
          } else {
            None
          }
        }
        _ => None,
      }
    }
  }
}

fn main() -> Result<()> {
  pretty_env_logger::init();
  let args = Args::parse();
  let config = Config {
    frame_rate: args.fps.max(1),
    turbo: args.turbo,
    ..Config::default()
  };
  let mut project = load_sb3(&args.project, config).context("could not load project")?;

  let sdl_context = sdl2::init().map_err(|e| anyhow!(e))?;
  let video_subsystem = sdl_context.video().map_err(|e| anyhow!(e))?;
  let window = video_subsystem
    .window(
      "Lumen",
      project.config.stage_width,
      project.config.stage_height,
    )
    .opengl()
    .position_centered()
    .build()?;
  let mut canvas = window.into_canvas().build()?;
  let mut event_pump = sdl_context.event_pump().map_err(|e| anyhow!(e))?;
  let texture_creator = canvas.texture_creator();
  let assets = load_textures(&mut project, &texture_creator);

  let ttf_context = sdl2::ttf::init()?;
  let font = match &args.font {
    Some(path) => Some(ttf_context.load_font(path, 14).map_err(|e| anyhow!(e))?),
    None => None,
  };

  let half_w = project.config.stage_width as f64 / 2.;
  let half_h = project.config.stage_height as f64 / 2.;
  project.start();
  project.green_flag();

  'main: loop {
    for event in event_pump.poll_iter() {
      match event {
        Event::Quit { .. } => break 'main,
        Event::KeyDown {
          keycode: Some(keycode),
          repeat: false,
          ..
        } => {
          if keycode == Keycode::Escape {
            break 'main;
          }
          if let Some(code) = scratch_key(keycode) {
            project.key_down(code);
          }
        }
        Event::KeyUp {
          keycode: Some(keycode),
          ..
        } => {
          if let Some(code) = scratch_key(keycode) {
            project.key_up(code);
          }
        }
        Event::MouseMotion { x, y, .. } => {
          project.stage.mouse_x = x as f64 - half_w;
          project.stage.mouse_y = half_h - y as f64;
        }
        Event::MouseButtonDown { x, y, .. } => {
          project.stage.mouse_down = true;
          let sx = x as f64 - half_w;
          let sy = half_h - y as f64;
          if let Err(err) = project.click_at(sx, sy) {
            return Err(anyhow!(err));
          }
        }
        Event::MouseButtonUp { .. } => {
          project.stage.mouse_down = false;
        }
        _ => {}
      }
    }

    // No prompt UI is wired up; keep projects moving instead of hanging.
    if project.stage.question.is_some() {
      warn!("answering ask prompt with an empty string");
      project.answer_prompt("");
    }

    if let Err(err) = project.step() {
      project.pause();
      return Err(anyhow!(err)).context("script error");
    }
    render(&project, &mut canvas, &texture_creator, &assets, font.as_ref());
    canvas.present();
    std::thread::sleep(Duration::new(0, 1_000_000_000u32 / project.config.frame_rate));
  }
  Ok(())
}
