use std::collections::HashMap;
use std::fs::{remove_dir_all, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::thread::panicking;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::audio::{Audio, NullAudio};
use crate::block::{ListRef, Program, Scope, TargetId, VarRef};
use crate::compiler::{compile_target, ScopeTable};
use crate::costume::{Costume, Sound};
use crate::list::List;
use crate::pen::{PenOp, PenState};
use crate::renderer::{BoundsRenderer, Renderer};
use crate::runtime::Runtime;
use crate::sb3;
use crate::sprite::{Filters, RotationStyle, Sprite, SpriteData, SpriteState};
use crate::stage::Stage;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Config {
  pub stage_width: u32,
  pub stage_height: u32,
  pub frame_rate: u32,
  pub turbo: bool,
}

impl Default for Config {
  fn default() -> Config {
    Config {
      stage_width: 480,
      stage_height: 360,
      frame_rate: 30,
      turbo: false,
    }
  }
}

/// Attachable host extensions (microphone, text to speech, cloud
/// variables). The scheduler drives the lifecycle; cloud-flagged variable
/// writes fan out through `cloud_variable_changed`.
pub trait Extension {
  fn on_start(&mut self, _project: &mut Project) {}
  fn on_pause(&mut self, _project: &mut Project) {}
  fn update(&mut self, _project: &mut Project) {}
  fn cloud_variable_changed(&mut self, _name: &str, _value: &Value) {}
}

/// The stage's variable and list storage: the global tier of the two-tier
/// scope rule.
#[derive(Debug, Default)]
pub struct Globals {
  pub vars: Vec<Value>,
  pub cloud: Vec<bool>,
  pub var_names: HashMap<String, usize>,
  pub var_order: Vec<String>,
  pub lists: Vec<List>,
  pub list_names: HashMap<String, usize>,
}

/// A loaded, compiled, runnable project.
pub struct Project {
  pub config: Config,
  pub stage: Stage,
  pub sprites: Vec<Sprite>,
  /// Sprite draw order, back to front. Storage order in `sprites` is
  /// creation order and never moves while a scheduler pass is running.
  pub layers: Vec<TargetId>,
  pub globals: Globals,
  pub pen_ops: Vec<PenOp>,
  pub runtime: Runtime,
  pub renderer: Box<dyn Renderer>,
  pub audio: Box<dyn Audio>,
  pub extensions: Vec<Box<dyn Extension>>,
  next_id: u32,
  assets_dir: Option<PathBuf>,
}

impl Drop for Project {
  fn drop(&mut self) {
    if panicking() {
      return;
    }
    if let Some(dir) = &self.assets_dir {
      if let Err(err) = remove_dir_all(dir) {
        warn!("could not clean up {}: {err}", dir.display());
      }
    }
  }
}

impl Project {
  pub fn sprite_index(&self, id: TargetId) -> Option<usize> {
    self.sprites.iter().position(|s| s.id == id)
  }

  pub fn sprite(&self, id: TargetId) -> Option<&Sprite> {
    self.sprites.iter().find(|s| s.id == id)
  }

  pub fn sprite_mut(&mut self, id: TargetId) -> Option<&mut Sprite> {
    self.sprites.iter_mut().find(|s| s.id == id)
  }

  pub fn sprite_state_mut(&mut self, id: TargetId) -> Option<&mut SpriteState> {
    self.sprite_mut(id).map(|s| &mut s.state)
  }

  /// Split borrow for motion: the sprite's state plus the pen buffer its
  /// movement may draw into.
  pub fn sprite_and_pen(&mut self, id: TargetId) -> Option<(&mut SpriteState, &mut Vec<PenOp>)> {
    let index = self.sprite_index(id)?;
    Some((&mut self.sprites[index].state, &mut self.pen_ops))
  }

  pub fn target_alive(&self, id: TargetId) -> bool {
    id == TargetId::STAGE || self.sprite(id).is_some()
  }

  pub fn program_of(&self, id: TargetId) -> Option<Rc<Program>> {
    if id == TargetId::STAGE {
      Some(Rc::clone(&self.stage.program))
    } else {
      self.sprite(id).map(|s| Rc::clone(&s.data.program))
    }
  }

  pub fn target_visible(&self, id: TargetId) -> bool {
    if id == TargetId::STAGE {
      true
    } else {
      self.sprite(id).map(|s| s.state.visible).unwrap_or(false)
    }
  }

  pub fn target_volume(&self, id: TargetId) -> f64 {
    if id == TargetId::STAGE {
      self.stage.volume
    } else {
      self.sprite(id).map(|s| s.state.volume).unwrap_or(100.)
    }
  }

  pub fn set_target_volume(&mut self, id: TargetId, volume: f64) {
    if id == TargetId::STAGE {
      self.stage.volume = volume;
    } else if let Some(state) = self.sprite_state_mut(id) {
      state.volume = volume;
    }
  }

  pub fn target_filters_mut(&mut self, id: TargetId) -> &mut Filters {
    if id == TargetId::STAGE {
      &mut self.stage.filters
    } else {
      match self.sprite_index(id) {
        Some(index) => &mut self.sprites[index].state.filters,
        None => &mut self.stage.filters,
      }
    }
  }

  pub fn var_value(&self, target: TargetId, var: &VarRef) -> Value {
    match var.scope {
      Scope::Global => self.globals.vars.get(var.index).cloned().unwrap_or_default(),
      Scope::Local => self
        .sprite(target)
        .and_then(|s| s.state.vars.get(var.index).cloned())
        .unwrap_or_default(),
    }
  }

  pub fn set_var(&mut self, target: TargetId, var: &VarRef, value: Value) {
    match var.scope {
      Scope::Global => {
        if let Some(slot) = self.globals.vars.get_mut(var.index) {
          *slot = value;
        }
        if var.cloud {
          self.notify_cloud(var.index);
        }
      }
      Scope::Local => {
        if let Some(state) = self.sprite_state_mut(target) {
          if let Some(slot) = state.vars.get_mut(var.index) {
            *slot = value;
          }
        }
      }
    }
  }

  fn notify_cloud(&mut self, index: usize) {
    let name = match self.globals.var_order.get(index) {
      Some(name) => name.clone(),
      None => return,
    };
    let value = self.globals.vars[index].clone();
    let mut extensions = std::mem::take(&mut self.extensions);
    for ext in &mut extensions {
      ext.cloud_variable_changed(&name, &value);
    }
    self.extensions = extensions;
  }

  pub fn list(&self, target: TargetId, list: &ListRef) -> Option<&List> {
    match list.scope {
      Scope::Global => self.globals.lists.get(list.index),
      Scope::Local => self.sprite(target).and_then(|s| s.state.lists.get(list.index)),
    }
  }

  pub fn list_mut(&mut self, target: TargetId, list: &ListRef) -> Option<&mut List> {
    match list.scope {
      Scope::Global => self.globals.lists.get_mut(list.index),
      Scope::Local => match self.sprite_index(target) {
        Some(index) => self.sprites[index].state.lists.get_mut(list.index),
        None => None,
      },
    }
  }

  /// Looks up a sound by name, falling back to a 1-based number.
  pub fn find_sound(&self, target: TargetId, which: &Value) -> Option<Sound> {
    let (sounds, index) = if target == TargetId::STAGE {
      (&self.stage.sounds, &self.stage.sound_index)
    } else {
      let sprite = self.sprite(target)?;
      (&sprite.data.sounds, &sprite.data.sound_index)
    };
    if let Some(i) = index.get(&which.to_string()) {
      return sounds.get(*i).cloned();
    }
    if let Value::Number(n) = which {
      let i = n.round() as i64 - 1;
      if i >= 0 {
        return sounds.get(i as usize).cloned();
      }
    }
    None
  }

  fn alloc_id(&mut self) -> TargetId {
    let id = TargetId(self.next_id);
    self.next_id += 1;
    id
  }

  /// Creates a clone of the origin sprite, layered just behind it.
  pub fn spawn_clone(&mut self, origin: TargetId) -> Option<TargetId> {
    let id = self.alloc_id();
    let index = self.sprite_index(origin)?;
    let clone = self.sprites[index].clone_as(id);
    self.sprites.push(clone);
    let layer = self
      .layers
      .iter()
      .position(|l| *l == origin)
      .unwrap_or(self.layers.len());
    self.layers.insert(layer, id);
    Some(id)
  }

  pub fn remove_sprite(&mut self, id: TargetId) {
    self.sprites.retain(|s| s.id != id);
    self.layers.retain(|l| *l != id);
  }

  /// Fills in costume pixel sizes once the host has loaded textures, so
  /// bounds-based hit testing has real extents.
  pub fn set_costume_dims(&mut self, md5ext: &str, width: f64, height: f64) {
    for costume in &mut self.stage.costumes {
      if costume.md5ext == md5ext {
        costume.width = width;
        costume.height = height;
      }
    }
    for sprite in &mut self.sprites {
      if let Some(data) = Rc::get_mut(&mut sprite.data) {
        for costume in &mut data.costumes {
          if costume.md5ext == md5ext {
            costume.width = width;
            costume.height = height;
          }
        }
      }
    }
  }

  /// Every costume file referenced by the project, for texture loading.
  pub fn costume_files(&self) -> Vec<String> {
    let mut files: Vec<String> = self
      .stage
      .costumes
      .iter()
      .chain(self.sprites.iter().flat_map(|s| s.data.costumes.iter()))
      .map(|c| c.md5ext.clone())
      .collect();
    files.sort();
    files.dedup();
    files
  }
}

/// Loads a `.sb3` archive: extract with unzip into a scratch directory,
/// then build the project from its `project.json`.
pub fn load_sb3(path: &Path, config: Config) -> Result<Project> {
  let dir = PathBuf::from("tmp");
  let status = Command::new("unzip")
    .arg("-o")
    .arg(path)
    .arg("-d")
    .arg(&dir)
    .status()
    .context("could not run unzip")?;
  if !status.success() {
    bail!("unzip failed for {}", path.display());
  }
  let file = File::open(dir.join("project.json")).context("project.json missing")?;
  let data: sb3::Project =
    serde_json::from_reader(BufReader::new(file)).context("could not parse project.json")?;
  let mut project = build(data, config)?;
  project.assets_dir = Some(dir);
  Ok(project)
}

/// Builds a project straight from `project.json` text; used by tests and
/// embedders that do their own asset handling.
pub fn load_project_json(json: &str, config: Config) -> Result<Project> {
  let data: sb3::Project = serde_json::from_str(json).context("could not parse project.json")?;
  build(data, config)
}

fn build(data: sb3::Project, config: Config) -> Result<Project> {
  let stage_data = data
    .targets
    .iter()
    .find(|t| t.is_stage)
    .context("project has no stage")?;

  let mut globals = ScopeTable::default();
  for (_, var) in sorted(&stage_data.variables) {
    globals.add_var(&var.name, var.value.clone(), var.cloud);
  }
  for (_, list) in sorted(&stage_data.lists) {
    globals.add_list(&list.name, list.values.clone());
  }

  // The stage's own script storage is the global tier.
  let stage_program = compile_target(&stage_data.blocks.0, true, &mut globals, None);
  let (stage_costumes, stage_costume_index) = build_costumes(&stage_data.costumes);
  let (stage_sounds, stage_sound_index) = build_sounds(&stage_data.sounds);
  let stage = Stage {
    program: Rc::new(stage_program),
    costumes: stage_costumes,
    costume_index: stage_costume_index,
    sounds: stage_sounds,
    sound_index: stage_sound_index,
    current_costume: stage_data.current_costume,
    volume: stage_data.volume,
    tempo: stage_data.tempo.unwrap_or(60.),
    counter: 0.,
    filters: Filters::default(),
    username: String::new(),
    answer: String::new(),
    question: None,
    prompt_id: 0,
    next_prompt_id: 0,
    keys: [false; 128],
    mouse_x: 0.,
    mouse_y: 0.,
    mouse_down: false,
    watcher_visibility: HashMap::new(),
  };

  let mut sprites = Vec::new();
  let mut layers = Vec::new();
  let mut next_id = 1u32;
  let mut sprite_targets: Vec<&sb3::Target> = data.targets.iter().filter(|t| !t.is_stage).collect();
  sprite_targets.sort_by_key(|t| t.layer_order);
  for target in sprite_targets {
    let mut locals = ScopeTable::default();
    for (_, var) in sorted(&target.variables) {
      locals.add_var(&var.name, var.value.clone(), var.cloud);
    }
    for (_, list) in sorted(&target.lists) {
      locals.add_list(&list.name, list.values.clone());
    }
    let program = compile_target(&target.blocks.0, false, &mut globals, Some(&mut locals));
    let (costumes, costume_index) = build_costumes(&target.costumes);
    let (sounds, sound_index) = build_sounds(&target.sounds);
    let sprite_data = SpriteData {
      name: target.name.clone(),
      costumes,
      costume_index,
      sounds,
      sound_index,
      var_names: locals.var_names,
      list_names: locals.list_names,
      program: Rc::new(program),
    };
    let state = SpriteState {
      x: target.x,
      y: target.y,
      direction: target.direction,
      size: target.size,
      visible: target.visible,
      draggable: target.draggable,
      rotation_style: RotationStyle::parse(&target.rotation_style),
      current_costume: target.current_costume,
      volume: target.volume,
      instrument: 0,
      vars: locals.var_values,
      lists: locals.list_values,
      filters: Filters::default(),
      pen: PenState::default(),
      say: None,
    };
    let id = TargetId(next_id);
    next_id += 1;
    debug!("compiled sprite {}", sprite_data.name);
    sprites.push(Sprite {
      id,
      is_clone: false,
      data: Rc::new(sprite_data),
      state,
    });
    layers.push(id);
  }

  let renderer = BoundsRenderer;
  let runtime = Runtime::new(config.frame_rate, config.turbo);
  Ok(Project {
    config,
    stage,
    sprites,
    layers,
    globals: Globals {
      vars: globals.var_values,
      cloud: globals.var_cloud,
      var_names: globals.var_names,
      var_order: globals.var_order,
      lists: globals.list_values,
      list_names: globals.list_names,
    },
    pen_ops: Vec::new(),
    runtime,
    renderer: Box::new(renderer),
    audio: Box::new(NullAudio),
    extensions: Vec::new(),
    next_id,
    assets_dir: None,
  })
}

fn sorted<T>(map: &HashMap<String, T>) -> Vec<(&String, &T)> {
  let mut entries: Vec<(&String, &T)> = map.iter().collect();
  entries.sort_by_key(|(k, _)| k.as_str());
  entries
}

fn build_costumes(costumes: &[sb3::Costume]) -> (Vec<Costume>, HashMap<String, usize>) {
  let mut out = Vec::with_capacity(costumes.len());
  let mut index = HashMap::new();
  for (i, c) in costumes.iter().enumerate() {
    let md5ext = c
      .md5ext
      .clone()
      .unwrap_or_else(|| format!("{}.{}", c.asset_id, c.data_format));
    index.insert(c.name.clone(), i);
    out.push(Costume {
      name: c.name.clone(),
      md5ext,
      bitmap_resolution: if c.bitmap_resolution > 0. {
        c.bitmap_resolution
      } else {
        1.
      },
      rotation_center_x: c.rotation_center_x,
      rotation_center_y: c.rotation_center_y,
      width: 0.,
      height: 0.,
    });
  }
  (out, index)
}

fn build_sounds(sounds: &[sb3::Sound]) -> (Vec<Sound>, HashMap<String, usize>) {
  let mut out = Vec::with_capacity(sounds.len());
  let mut index = HashMap::new();
  for (i, s) in sounds.iter().enumerate() {
    let duration_secs = if s.rate > 0. {
      s.sample_count / s.rate
    } else {
      // Malformed metadata degrades to "no duration", not a load failure.
      warn!("sound {} has no sample rate", s.name);
      0.
    };
    index.insert(s.name.clone(), i);
    out.push(Sound {
      name: s.name.clone(),
      md5ext: s.md5ext.clone(),
      duration_secs,
    });
  }
  (out, index)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::Event;

  fn test_config() -> Config {
    Config {
      // A small frame budget keeps the turbo inner loop short in tests.
      frame_rate: 250,
      ..Config::default()
    }
  }

  fn project_with(stage_vars: &str, sprite_vars: &str, sprite_lists: &str, blocks: &str) -> Project {
    let json = format!(
      r#"{{"targets": [
        {{"isStage": true, "name": "Stage", "variables": {stage_vars}, "lists": {{}},
         "blocks": {{}}, "currentCostume": 0, "costumes": [{{"name": "backdrop1"}}],
         "sounds": [], "volume": 100}},
        {{"isStage": false, "name": "Sprite1", "variables": {sprite_vars}, "lists": {sprite_lists},
         "blocks": {blocks}, "currentCostume": 0, "costumes": [{{"name": "costume1"}}],
         "sounds": [], "volume": 100, "x": 0, "y": 0, "layerOrder": 1}}
      ]}}"#
    );
    load_project_json(&json, test_config()).expect("test project loads")
  }

  fn global_num(p: &Project, name: &str) -> f64 {
    let i = p.globals.var_names[name];
    p.globals.vars[i].to_number()
  }

  fn queued(p: &Project) -> usize {
    p.runtime.queue.iter().flatten().count()
  }

  #[test]
  fn green_flag_replaces_queued_thread() {
    let mut p = project_with(
      "{}",
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "w", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "w": {"opcode": "control_wait", "next": null, "parent": "hat", "inputs": {"DURATION": [1, [5, "10"]]}, "fields": {}}
      }"#,
    );
    p.green_flag();
    p.green_flag();
    assert_eq!(queued(&p), 1);
  }

  #[test]
  fn broadcast_appends_independent_threads() {
    let mut p = project_with(
      "{}",
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenbroadcastreceived", "next": "w", "parent": null, "inputs": {}, "fields": {"BROADCAST_OPTION": ["go", "goid"]}, "topLevel": true},
        "w": {"opcode": "control_wait", "next": null, "parent": "hat", "inputs": {"DURATION": [1, [5, "10"]]}, "fields": {}}
      }"#,
    );
    p.trigger(&Event::Broadcast("go".to_string()));
    p.trigger(&Event::Broadcast("go".to_string()));
    assert_eq!(queued(&p), 2);
  }

  #[test]
  fn warp_procedure_runs_loop_in_one_turn() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "def": {"opcode": "procedures_definition", "next": "rep", "parent": null, "inputs": {"custom_block": [1, "proto"]}, "fields": {}, "topLevel": true},
        "proto": {"opcode": "procedures_prototype", "next": null, "parent": "def", "inputs": {}, "fields": {}, "mutation": {"proccode": "burn", "argumentids": "[]", "argumentnames": "[]", "warp": "true"}},
        "rep": {"opcode": "control_repeat", "next": null, "parent": "def", "inputs": {"TIMES": [1, [6, "100000"]], "SUBSTACK": [2, "chg"]}, "fields": {}},
        "chg": {"opcode": "data_changevariableby", "next": "mv", "parent": "rep", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["n", "nid"]}},
        "mv": {"opcode": "motion_movesteps", "next": null, "parent": "chg", "inputs": {"STEPS": [1, [4, "1"]]}, "fields": {}},
        "hat": {"opcode": "event_whenflagclicked", "next": "call", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "call": {"opcode": "procedures_call", "next": null, "parent": "hat", "inputs": {}, "fields": {}, "mutation": {"proccode": "burn", "argumentids": "[]"}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(global_num(&p, "n"), 100000.);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn non_warp_loop_requeues_each_iteration() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "def": {"opcode": "procedures_definition", "next": "rep", "parent": null, "inputs": {"custom_block": [1, "proto"]}, "fields": {}, "topLevel": true},
        "proto": {"opcode": "procedures_prototype", "next": null, "parent": "def", "inputs": {}, "fields": {}, "mutation": {"proccode": "burn", "argumentids": "[]", "argumentnames": "[]", "warp": "false"}},
        "rep": {"opcode": "control_repeat", "next": null, "parent": "def", "inputs": {"TIMES": [1, [6, "100000"]], "SUBSTACK": [2, "chg"]}, "fields": {}},
        "chg": {"opcode": "data_changevariableby", "next": "mv", "parent": "rep", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["n", "nid"]}},
        "mv": {"opcode": "motion_movesteps", "next": null, "parent": "chg", "inputs": {"STEPS": [1, [4, "1"]]}, "fields": {}},
        "hat": {"opcode": "event_whenflagclicked", "next": "call", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "call": {"opcode": "procedures_call", "next": null, "parent": "hat", "inputs": {}, "fields": {}, "mutation": {"proccode": "burn", "argumentids": "[]"}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    // The first visible mutation ends the frame's inner loop, so exactly
    // one iteration ran and the thread is waiting for the next frame.
    assert_eq!(global_num(&p, "n"), 1.);
    assert_eq!(queued(&p), 1);
  }

  #[test]
  fn non_visual_work_drains_within_one_frame() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "rep", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "rep": {"opcode": "control_repeat", "next": null, "parent": "hat", "inputs": {"TIMES": [1, [6, "100"]], "SUBSTACK": [2, "chg"]}, "fields": {}},
        "chg": {"opcode": "data_changevariableby", "next": null, "parent": "rep", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["n", "nid"]}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(global_num(&p, "n"), 100.);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn stage_variable_shadows_sprite_local() {
    let mut p = project_with(
      r#"{"sid": ["score", 5]}"#,
      r#"{"spid": ["score", 99]}"#,
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "set", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "set": {"opcode": "data_setvariableto", "next": null, "parent": "hat", "inputs": {"VALUE": [1, [4, "10"]]}, "fields": {"VARIABLE": ["score", "spid"]}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(global_num(&p, "score"), 10.);
    let sprite = &p.sprites[0];
    let local = sprite.data.var_names["score"];
    assert_eq!(sprite.state.vars[local].to_number(), 99.);
  }

  #[test]
  fn clone_storage_is_independent() {
    let mut p = project_with(
      "{}",
      "{}",
      r#"{"lid": ["items", [1, 2, 3]]}"#,
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "cl", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "cl": {"opcode": "control_create_clone_of", "next": null, "parent": "hat", "inputs": {"CLONE_OPTION": [1, "menu"]}, "fields": {}},
        "menu": {"opcode": "control_create_clone_of_menu", "next": null, "parent": "cl", "inputs": {}, "fields": {"CLONE_OPTION": ["_myself_"]}},
        "hc": {"opcode": "control_start_as_clone", "next": "add", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "add": {"opcode": "data_addtolist", "next": null, "parent": "hc", "inputs": {"ITEM": [1, [10, "4"]]}, "fields": {"LIST": ["items", "lid"]}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(p.sprites.len(), 2);
    let original = &p.sprites[0];
    let clone = &p.sprites[1];
    assert!(clone.is_clone);
    let list = original.data.list_names["items"];
    assert_eq!(original.state.lists[list].len(), 3);
    assert_eq!(clone.state.lists[list].len(), 4);
  }

  #[test]
  fn repeat_with_wait_advances_thirty_steps() {
    let mut p = project_with(
      "{}",
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "rep", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "rep": {"opcode": "control_repeat", "next": null, "parent": "hat", "inputs": {"TIMES": [1, [6, "3"]], "SUBSTACK": [2, "mv"]}, "fields": {}},
        "mv": {"opcode": "motion_movesteps", "next": "w", "parent": "rep", "inputs": {"STEPS": [1, [4, "10"]]}, "fields": {}},
        "w": {"opcode": "control_wait", "next": null, "parent": "mv", "inputs": {"DURATION": [1, [5, "0.1"]]}, "fields": {}}
      }"#,
    );
    p.green_flag();
    for _ in 0..20 {
      p.step().unwrap();
      p.runtime.advance(150.);
    }
    assert_eq!(p.sprites[0].state.x, 30.);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn broadcast_and_wait_blocks_until_listeners_finish() {
    let mut p = project_with(
      r#"{"did": ["done", 0], "rid": ["rec", 0]}"#,
      "{}",
      "{}",
      r#"{
        "h1": {"opcode": "event_whenflagclicked", "next": "bw", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "bw": {"opcode": "event_broadcastandwait", "next": "set", "parent": "h1", "inputs": {"BROADCAST_INPUT": [1, [11, "go", "goid"]]}, "fields": {}},
        "set": {"opcode": "data_setvariableto", "next": null, "parent": "bw", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["done", "did"]}},
        "h2": {"opcode": "event_whenbroadcastreceived", "next": "w", "parent": null, "inputs": {}, "fields": {"BROADCAST_OPTION": ["go", "goid"]}, "topLevel": true},
        "w": {"opcode": "control_wait", "next": "set2", "parent": "h2", "inputs": {"DURATION": [1, [5, "0.2"]]}, "fields": {}},
        "set2": {"opcode": "data_setvariableto", "next": null, "parent": "w", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["rec", "rid"]}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(global_num(&p, "done"), 0.);
    assert_eq!(global_num(&p, "rec"), 0.);
    p.runtime.advance(300.);
    p.step().unwrap();
    assert_eq!(global_num(&p, "rec"), 1.);
    assert_eq!(global_num(&p, "done"), 1.);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn recursive_call_defers_to_next_turn() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "def": {"opcode": "procedures_definition", "next": "chg", "parent": null, "inputs": {"custom_block": [1, "proto"]}, "fields": {}, "topLevel": true},
        "proto": {"opcode": "procedures_prototype", "next": null, "parent": "def", "inputs": {}, "fields": {}, "mutation": {"proccode": "recurse", "argumentids": "[]", "argumentnames": "[]", "warp": "false"}},
        "chg": {"opcode": "data_changevariableby", "next": "mv", "parent": "def", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["n", "nid"]}},
        "mv": {"opcode": "motion_movesteps", "next": "again", "parent": "chg", "inputs": {"STEPS": [1, [4, "1"]]}, "fields": {}},
        "again": {"opcode": "procedures_call", "next": null, "parent": "mv", "inputs": {}, "fields": {}, "mutation": {"proccode": "recurse", "argumentids": "[]"}},
        "hat": {"opcode": "event_whenflagclicked", "next": "call", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "call": {"opcode": "procedures_call", "next": null, "parent": "hat", "inputs": {}, "fields": {}, "mutation": {"proccode": "recurse", "argumentids": "[]"}}
      }"#,
    );
    p.green_flag();
    for _ in 0..3 {
      p.step().unwrap();
    }
    assert_eq!(global_num(&p, "n"), 3.);
    assert_eq!(queued(&p), 1);
  }

  #[test]
  fn stop_other_scripts_spares_the_caller() {
    let mut p = project_with(
      r#"{"did": ["done", 0]}"#,
      "{}",
      "{}",
      r#"{
        "h1": {"opcode": "event_whenflagclicked", "next": "w", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "w": {"opcode": "control_wait", "next": null, "parent": "h1", "inputs": {"DURATION": [1, [5, "10"]]}, "fields": {}},
        "h2": {"opcode": "event_whenflagclicked", "next": "stop", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "stop": {"opcode": "control_stop", "next": "set", "parent": "h2", "inputs": {}, "fields": {"STOP_OPTION": ["other scripts in sprite"]}},
        "set": {"opcode": "data_setvariableto", "next": null, "parent": "stop", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["done", "did"]}}
      }"#,
    );
    p.green_flag();
    assert_eq!(queued(&p), 2);
    p.step().unwrap();
    assert_eq!(global_num(&p, "done"), 1.);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn stop_all_clears_queue_but_keeps_variables() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "set", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "set": {"opcode": "data_setvariableto", "next": "stop", "parent": "hat", "inputs": {"VALUE": [1, [4, "5"]]}, "fields": {"VARIABLE": ["n", "nid"]}},
        "stop": {"opcode": "control_stop", "next": null, "parent": "set", "inputs": {}, "fields": {"STOP_OPTION": ["all"]}},
        "h2": {"opcode": "event_whenflagclicked", "next": "w", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "w": {"opcode": "control_wait", "next": null, "parent": "h2", "inputs": {"DURATION": [1, [5, "10"]]}, "fields": {}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(queued(&p), 0);
    assert_eq!(global_num(&p, "n"), 5.);
  }

  #[test]
  fn ask_blocks_until_answered() {
    let mut p = project_with(
      r#"{"gid": ["greeting", ""]}"#,
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "ask", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "ask": {"opcode": "sensing_askandwait", "next": "set", "parent": "hat", "inputs": {"QUESTION": [1, [10, "name?"]]}, "fields": {}},
        "set": {"opcode": "data_setvariableto", "next": null, "parent": "ask", "inputs": {"VALUE": [3, "join", [10, ""]]}, "fields": {"VARIABLE": ["greeting", "gid"]}},
        "join": {"opcode": "operator_join", "next": null, "parent": "set", "inputs": {"STRING1": [1, [10, "hi "]], "STRING2": [3, "ans", [10, ""]]}, "fields": {}},
        "ans": {"opcode": "sensing_answer", "next": null, "parent": "join", "inputs": {}, "fields": {}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(p.stage.question.as_deref(), Some("name?"));
    assert_eq!(queued(&p), 1);
    p.answer_prompt("bob");
    p.step().unwrap();
    let i = p.globals.var_names["greeting"];
    assert_eq!(p.globals.vars[i].to_string(), "hi bob");
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn deleted_clone_invalidates_its_threads() {
    let mut p = project_with(
      "{}",
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "cl", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "cl": {"opcode": "control_create_clone_of", "next": null, "parent": "hat", "inputs": {"CLONE_OPTION": [1, "menu"]}, "fields": {}},
        "menu": {"opcode": "control_create_clone_of_menu", "next": null, "parent": "cl", "inputs": {}, "fields": {"CLONE_OPTION": ["_myself_"]}},
        "hc": {"opcode": "control_start_as_clone", "next": "del", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "del": {"opcode": "control_delete_this_clone", "next": null, "parent": "hc", "inputs": {}, "fields": {}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(p.sprites.len(), 1);
    assert_eq!(queued(&p), 0);
  }

  #[test]
  fn timer_edge_trigger_fires_once_on_crossing() {
    let mut p = project_with(
      r#"{"did": ["done", 0]}"#,
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whengreaterthan", "next": "set", "parent": null, "inputs": {"VALUE": [1, [4, "0.05"]]}, "fields": {"WHENGREATERTHANMENU": ["TIMER"]}, "topLevel": true},
        "set": {"opcode": "data_changevariableby", "next": null, "parent": "hat", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["done", "did"]}}
      }"#,
    );
    p.green_flag();
    p.step().unwrap();
    assert_eq!(global_num(&p, "done"), 0.);
    p.runtime.advance(100.);
    p.step().unwrap();
    assert_eq!(global_num(&p, "done"), 1.);
    // Still above the threshold: no retrigger.
    p.runtime.advance(100.);
    p.step().unwrap();
    assert_eq!(global_num(&p, "done"), 1.);
  }

  #[test]
  fn forever_loop_yields_every_frame() {
    let mut p = project_with(
      r#"{"nid": ["n", 0]}"#,
      "{}",
      "{}",
      r#"{
        "hat": {"opcode": "event_whenflagclicked", "next": "rep", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "rep": {"opcode": "control_forever", "next": null, "parent": "hat", "inputs": {"SUBSTACK": [2, "chg"]}, "fields": {}},
        "chg": {"opcode": "data_changevariableby", "next": "mv", "parent": "rep", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["n", "nid"]}},
        "mv": {"opcode": "motion_movesteps", "next": null, "parent": "chg", "inputs": {"STEPS": [1, [4, "1"]]}, "fields": {}}
      }"#,
    );
    p.green_flag();
    for _ in 0..5 {
      p.step().unwrap();
    }
    assert_eq!(global_num(&p, "n"), 5.);
    assert_eq!(queued(&p), 1);
  }
}
