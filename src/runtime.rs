use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::Instant;

use crate::block::{EdgeKind, Label, ScriptRef, TargetId};
use crate::exec;
use crate::project::Project;
use crate::value::Value;

/// A fragment-level failure (for example a broken renderer call). These
/// propagate out of `step` and stop the frame loop; language-level
/// failures never raise and coerce to defaults instead.
#[derive(Debug, Clone)]
pub struct RuntimeError {
  pub message: String,
}

impl RuntimeError {
  pub fn new(message: impl Into<String>) -> RuntimeError {
    RuntimeError {
      message: message.into(),
    }
  }
}

impl fmt::Display for RuntimeError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.message)
  }
}

impl Error for RuntimeError {}

/// The per-yield-span scratch record ("R" in the original). A fragment
/// that suspends mid-block parks its loop counter or wait deadline here;
/// `Save`/`Restore` nest these across enclosing loops.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
  pub start: f64,
  pub duration: f64,
  pub count: f64,
  pub base_x: f64,
  pub base_y: f64,
  pub delta_x: f64,
  pub delta_y: f64,
  pub id: u32,
  pub threads: Vec<ScriptRef>,
}

/// One call-stack entry: argument values for the procedure invocation, the
/// nested scratch records, and where to resume when the call returns.
#[derive(Debug, Clone)]
pub struct Frame {
  pub args: Vec<Value>,
  pub stack: Vec<Scratch>,
  pub ret: Label,
  pub proc_fragment: Option<Label>,
  pub warp: bool,
}

impl Frame {
  pub fn base() -> Frame {
    Frame {
      args: Vec::new(),
      stack: vec![Scratch::default()],
      ret: 0,
      proc_fragment: None,
      warp: false,
    }
  }
}

/// A unit of concurrent execution: target + next fragment + call stack.
/// `base` is the entry fragment of the originating script and is the
/// thread's identity for dedup and broadcast-and-wait polling.
#[derive(Debug, Clone)]
pub struct Thread {
  pub target: TargetId,
  pub base: Label,
  pub fragment: Label,
  pub calls: Vec<Frame>,
  pub warp: u32,
}

impl Thread {
  pub fn new(target: TargetId, fragment: Label) -> Thread {
    Thread {
      target,
      base: fragment,
      fragment,
      calls: vec![Frame::base()],
      warp: 0,
    }
  }

  pub fn script_ref(&self) -> ScriptRef {
    ScriptRef {
      target: self.target,
      fragment: self.base,
    }
  }

  pub fn frame(&self) -> &Frame {
    self.calls.last().expect("thread call stack is never empty")
  }

  pub fn frame_mut(&mut self) -> &mut Frame {
    self.calls.last_mut().expect("thread call stack is never empty")
  }

  pub fn scratch(&self) -> &Scratch {
    self
      .frame()
      .stack
      .last()
      .expect("frame scratch stack is never empty")
  }

  pub fn scratch_mut(&mut self) -> &mut Scratch {
    self
      .frame_mut()
      .stack
      .last_mut()
      .expect("frame scratch stack is never empty")
  }

  /// Warp depth carried across a yield: every frame at or below the
  /// outermost warp frame counts.
  pub fn recompute_warp(&mut self) {
    let mut depth = 0;
    for frame in &self.calls {
      if depth > 0 || frame.warp {
        depth += 1;
      }
    }
    self.warp = depth;
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  GreenFlag,
  Clicked,
  Cloned,
  KeyPressed(u8),
  BackdropChanged(String),
  Broadcast(String),
}

impl Event {
  /// Replace-on-retrigger events restart a queued script instead of piling
  /// up; broadcasts and backdrop changes add independent threads.
  fn replaces(&self) -> bool {
    matches!(
      self,
      Event::GreenFlag | Event::Clicked | Event::Cloned | Event::KeyPressed(_)
    )
  }
}

/// Scheduler state: the run queue and the project clock.
#[derive(Debug)]
pub struct Runtime {
  pub queue: Vec<Option<Thread>>,
  pub framerate: u32,
  pub turbo: bool,
  /// Set when a fragment made an observable change this frame.
  pub visual: bool,
  /// Wall-clock snapshot taken once per scheduler pass; every duration
  /// started in the pass measures from this value.
  pub now: f64,
  pub timer_start: f64,
  pub running: bool,
  base_now: f64,
  base_time: Instant,
  say_id_counter: u32,
  edge_state: HashMap<(TargetId, usize), bool>,
}

impl Runtime {
  pub fn new(framerate: u32, turbo: bool) -> Runtime {
    Runtime {
      queue: Vec::new(),
      framerate,
      turbo,
      visual: false,
      now: 0.,
      timer_start: 0.,
      running: false,
      base_now: 0.,
      base_time: Instant::now(),
      say_id_counter: 0,
      edge_state: HashMap::new(),
    }
  }

  /// The current time in the project, in ms. Frozen while paused.
  pub fn right_now(&self) -> f64 {
    if self.running {
      self.base_now + self.base_time.elapsed().as_secs_f64() * 1000.
    } else {
      self.base_now
    }
  }

  pub fn start(&mut self) {
    if !self.running {
      self.base_time = Instant::now();
      self.running = true;
    }
  }

  pub fn pause(&mut self) {
    if self.running {
      self.base_now = self.right_now();
      self.running = false;
    }
  }

  /// Shifts the project clock forward; lets tests cross wait deadlines
  /// without sleeping.
  pub fn advance(&mut self, ms: f64) {
    self.base_now += ms;
  }

  pub fn next_say_id(&mut self) -> u32 {
    self.say_id_counter += 1;
    self.say_id_counter
  }

  /// Is any of the given scripts still queued?
  pub fn any_running(&self, refs: &[ScriptRef]) -> bool {
    self
      .queue
      .iter()
      .flatten()
      .any(|t| refs.contains(&t.script_ref()))
  }

  pub fn timer_secs(&self) -> f64 {
    (self.now - self.timer_start) / 1000.
  }
}

impl Project {
  /// Queues a thread for (target, fragment). When `replace` is set, an
  /// already queued thread of the same script is restarted in place.
  pub fn start_thread(&mut self, target: TargetId, fragment: Label, replace: bool) {
    let thread = Thread::new(target, fragment);
    if replace {
      for slot in self.runtime.queue.iter_mut() {
        if let Some(t) = slot {
          if t.target == target && t.base == fragment {
            *slot = Some(thread);
            return;
          }
        }
      }
    }
    self.runtime.queue.push(Some(thread));
  }

  /// Triggers an event for a single target; returns the scripts spawned.
  pub fn trigger_for(&mut self, target: TargetId, event: &Event) -> Vec<ScriptRef> {
    let program = match self.program_of(target) {
      Some(p) => p,
      None => return Vec::new(),
    };
    let listeners = &program.listeners;
    let mut fragments: Vec<Label> = Vec::new();
    match event {
      Event::GreenFlag => fragments.extend(&listeners.green_flag),
      Event::Clicked => fragments.extend(&listeners.clicked),
      Event::Cloned => fragments.extend(&listeners.cloned),
      Event::KeyPressed(code) => {
        fragments.extend(&listeners.any_key);
        if let Some(specific) = listeners.key_pressed.get(code) {
          fragments.extend(specific);
        }
      }
      Event::BackdropChanged(name) => {
        if let Some(list) = listeners.backdrop_changed.get(&name.to_lowercase()) {
          fragments.extend(list);
        }
      }
      Event::Broadcast(name) => {
        if let Some(list) = listeners.broadcast.get(&name.to_lowercase()) {
          fragments.extend(list);
        }
      }
    }
    let replace = event.replaces();
    let mut spawned = Vec::with_capacity(fragments.len());
    for fragment in fragments {
      self.start_thread(target, fragment, replace);
      spawned.push(ScriptRef { target, fragment });
    }
    spawned
  }

  /// Triggers an event on every target: sprites in reverse layer order,
  /// then the stage.
  pub fn trigger(&mut self, event: &Event) -> Vec<ScriptRef> {
    let mut spawned = Vec::new();
    let order: Vec<TargetId> = self.layers.iter().rev().copied().collect();
    for id in order {
      spawned.extend(self.trigger_for(id, event));
    }
    spawned.extend(self.trigger_for(TargetId::STAGE, event));
    spawned
  }

  /// The project's green flag: resets the timer and starts every
  /// green-flag script.
  pub fn green_flag(&mut self) {
    self.runtime.timer_start = self.runtime.right_now();
    self.trigger(&Event::GreenFlag);
  }

  pub fn key_down(&mut self, code: u8) {
    if let Some(k) = self.stage.keys.get_mut(code as usize) {
      if *k {
        return;
      }
      *k = true;
    }
    self.trigger(&Event::KeyPressed(code));
  }

  pub fn key_up(&mut self, code: u8) {
    if let Some(k) = self.stage.keys.get_mut(code as usize) {
      *k = false;
    }
  }

  /// Dispatches a click to the topmost sprite under the point, or to the
  /// stage when nothing is hit.
  pub fn click_at(&mut self, x: f64, y: f64) -> Result<(), RuntimeError> {
    let mut hit = None;
    for id in self.layers.iter().rev() {
      if let Some(sprite) = self.sprite(*id) {
        if self.renderer.touches_point(sprite, x, y)? {
          hit = Some(*id);
          break;
        }
      }
    }
    match hit {
      Some(id) => self.trigger_for(id, &Event::Clicked),
      None => self.trigger_for(TargetId::STAGE, &Event::Clicked),
    };
    Ok(())
  }

  /// Host-side answer to an open ask prompt.
  pub fn answer_prompt(&mut self, answer: impl Into<String>) {
    self.stage.answer = answer.into();
    self.stage.question = None;
    self.stage.prompt_id += 1;
  }

  pub fn start(&mut self) {
    self.runtime.start();
    let mut extensions = std::mem::take(&mut self.extensions);
    for ext in &mut extensions {
      ext.on_start(self);
    }
    self.extensions = extensions;
  }

  pub fn pause(&mut self) {
    self.runtime.pause();
    let mut extensions = std::mem::take(&mut self.extensions);
    for ext in &mut extensions {
      ext.on_pause(self);
    }
    self.extensions = extensions;
  }

  /// Advances one frame: runs every queued thread once, keeps draining
  /// while no visible change happened (or turbo is on) within the frame
  /// budget, then lets the host render.
  pub fn step(&mut self) -> Result<(), RuntimeError> {
    self.runtime.visual = false;
    self.poll_edge_triggers()?;
    let start = Instant::now();
    let budget_ms = 1000. / self.runtime.framerate.max(1) as f64;
    loop {
      self.runtime.now = self.runtime.right_now();
      let mut i = 0;
      while i < self.runtime.queue.len() {
        if let Some(thread) = self.runtime.queue[i].take() {
          let requeued = exec::run_thread(self, thread)?;
          // stop-all may have emptied the queue under us
          if let Some(slot) = self.runtime.queue.get_mut(i) {
            *slot = requeued;
          }
        }
        i += 1;
      }
      self.runtime.queue.retain(|slot| slot.is_some());
      let keep_draining = (self.runtime.turbo || !self.runtime.visual)
        && start.elapsed().as_secs_f64() * 1000. < budget_ms
        && !self.runtime.queue.is_empty();
      if !keep_draining {
        break;
      }
    }
    let mut extensions = std::mem::take(&mut self.extensions);
    for ext in &mut extensions {
      ext.update(self);
    }
    self.extensions = extensions;
    Ok(())
  }

  /// Edge-triggered hats (`when [timer] > value`): fire once when the
  /// watched value crosses the threshold from below.
  fn poll_edge_triggers(&mut self) -> Result<(), RuntimeError> {
    self.runtime.now = self.runtime.right_now();
    let mut targets: Vec<TargetId> = vec![TargetId::STAGE];
    targets.extend(self.layers.iter().copied());
    for id in targets {
      let program = match self.program_of(id) {
        Some(p) => p,
        None => continue,
      };
      for (i, trigger) in program.listeners.edge_triggers.iter().enumerate() {
        let current = match trigger.kind {
          EdgeKind::Timer => self.runtime.timer_secs(),
          EdgeKind::Loudness => -1.,
        };
        let threshold = exec::eval(self, id, &[], &trigger.threshold)?.to_number();
        let above = current > threshold;
        let armed = self
          .runtime
          .edge_state
          .insert((id, i), above)
          .unwrap_or(false);
        if above && !armed {
          self.start_thread(id, trigger.fragment, true);
        }
      }
    }
    Ok(())
  }

  /// Stops every script and resets transient state; variables and lists
  /// keep their contents.
  pub fn stop_all(&mut self) {
    self.runtime.queue.clear();
    self.stage.question = None;
    self.stage.prompt_id = 0;
    self.stage.next_prompt_id = 0;
    self.stage.filters.reset();
    self.audio.stop_all();
    let clones: Vec<TargetId> = self
      .sprites
      .iter()
      .filter(|s| s.is_clone)
      .map(|s| s.id)
      .collect();
    for id in clones {
      self.remove_sprite(id);
    }
    for sprite in &mut self.sprites {
      sprite.state.filters.reset();
      sprite.state.say = None;
    }
  }

  /// Stops queued scripts of this target other than the calling thread
  /// (which is out of the queue while it runs).
  pub fn stop_other_scripts(&mut self, target: TargetId) {
    for slot in self.runtime.queue.iter_mut() {
      if matches!(slot, Some(t) if t.target == target) {
        *slot = None;
      }
    }
  }

  /// Removes a clone and everything it was doing.
  pub fn delete_clone(&mut self, target: TargetId) {
    if !matches!(self.sprite(target), Some(s) if s.is_clone) {
      return;
    }
    for slot in self.runtime.queue.iter_mut() {
      if matches!(slot, Some(t) if t.target == target) {
        *slot = None;
      }
    }
    self.audio.stop_sounds_for(target);
    self.remove_sprite(target);
  }
}
