use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{Expr, GlideDest, Ins, Program, RotationStyleOp, TargetId, TimeUnit, VisualKind};
use crate::costume;
use crate::list::ListIndex;
use crate::pen::PenOp;
use crate::project::Project;
use crate::runtime::{Event, Frame, RuntimeError, Scratch, Thread};
use crate::sprite::{RotationStyle, Say};
use crate::value::{self, Value};

/// What an instruction tells the dispatch loop to do next.
enum Flow {
  Next,
  /// Jump within the code array.
  Jump(usize),
  /// Transfer to a fragment in the same turn (warp loops, call/return).
  Tail(usize),
  /// Requeue at a fragment and end this turn.
  Yield(usize),
  /// End this turn without requeuing.
  Die,
}

/// Runs one thread for one scheduler turn: chains fragments until a yield
/// or the end of the script. Returns the thread when it requeued itself.
pub fn run_thread(p: &mut Project, mut th: Thread) -> Result<Option<Thread>, RuntimeError> {
  let program = match p.program_of(th.target) {
    Some(program) => program,
    // The target was deleted out from under the thread (a dead clone).
    None => return Ok(None),
  };
  th.recompute_warp();
  let mut pc = program.entry_pc(th.fragment);
  loop {
    let ins = program
      .code
      .get(pc)
      .ok_or_else(|| RuntimeError::new(format!("fragment ran past end of code at pc {pc}")))?;
    match exec_ins(p, &program, &mut th, ins)? {
      Flow::Next => pc += 1,
      Flow::Jump(target) => pc = target,
      Flow::Tail(label) => pc = program.entry_pc(label),
      Flow::Yield(label) => {
        th.fragment = label;
        return Ok(Some(th));
      }
      Flow::Die => return Ok(None),
    }
  }
}

fn ev(p: &Project, th: &Thread, e: &Expr) -> Result<Value, RuntimeError> {
  eval(p, th.target, &th.frame().args, e)
}

fn evn(p: &Project, th: &Thread, e: &Expr) -> Result<f64, RuntimeError> {
  Ok(ev(p, th, e)?.to_number_raw())
}

fn evs(p: &Project, th: &Thread, e: &Expr) -> Result<String, RuntimeError> {
  Ok(ev(p, th, e)?.to_string())
}

fn evb(p: &Project, th: &Thread, e: &Expr) -> Result<bool, RuntimeError> {
  Ok(ev(p, th, e)?.to_bool())
}

fn exec_ins(
  p: &mut Project,
  program: &Program,
  th: &mut Thread,
  ins: &Ins,
) -> Result<Flow, RuntimeError> {
  let t = th.target;
  Ok(match ins {
    Ins::Jump(target) => Flow::Jump(*target),
    Ins::JumpUnless(cond, target) => {
      if evb(p, th, cond)? {
        Flow::Next
      } else {
        Flow::Jump(*target)
      }
    }
    Ins::JumpIf(cond, target) => {
      if evb(p, th, cond)? {
        Flow::Jump(*target)
      } else {
        Flow::Next
      }
    }
    Ins::Queue(label) => {
      if th.warp > 0 {
        Flow::Tail(*label)
      } else {
        Flow::Yield(*label)
      }
    }
    Ins::ForceQueue(label) => Flow::Yield(*label),
    Ins::Save => {
      th.frame_mut().stack.push(Scratch::default());
      Flow::Next
    }
    Ins::Restore => {
      let stack = &mut th.frame_mut().stack;
      if stack.len() > 1 {
        stack.pop();
      }
      Flow::Next
    }
    Ins::Call { proc, ret, args } => {
      let procedure = &program.procedures[*proc];
      let mut values = Vec::with_capacity(args.len());
      for arg in args {
        values.push(ev(p, th, arg)?);
      }
      let frame = Frame {
        args: values,
        stack: vec![Scratch::default()],
        ret: *ret,
        proc_fragment: Some(procedure.fragment),
        warp: procedure.warp,
      };
      if procedure.warp || th.warp > 0 {
        th.calls.push(frame);
        th.warp += 1;
        Flow::Tail(procedure.fragment)
      } else {
        // Bounded-lookback re-entrancy guard: a recursive call defers the
        // whole thread to the next turn instead of growing the chain
        // synchronously.
        let recursive = th
          .calls
          .iter()
          .rev()
          .take(5)
          .any(|f| f.proc_fragment == Some(procedure.fragment));
        th.calls.push(frame);
        if recursive {
          Flow::Yield(procedure.fragment)
        } else {
          Flow::Tail(procedure.fragment)
        }
      }
    }
    Ins::EndCall => end_call(th),
    Ins::Retire => Flow::Die,

    Ins::WaitInit { secs } => {
      let duration = evn(p, th, secs)?;
      let r = th.scratch_mut();
      r.start = p.runtime.now;
      r.duration = duration;
      Flow::Next
    }
    Ins::WaitTick { resume } => {
      let r = th.scratch();
      if p.runtime.now - r.start < r.duration * 1000. {
        Flow::Yield(*resume)
      } else {
        Flow::Next
      }
    }
    Ins::GlideInit { secs, dest } => {
      let duration = evn(p, th, secs)?;
      let to = match dest {
        GlideDest::Xy(x, y) => Some((evn(p, th, x)?, evn(p, th, y)?)),
        GlideDest::Object(e) => {
          let name = evs(p, th, e)?;
          get_position(p, &name)
        }
      };
      let (x, y) = match p.sprite(t) {
        Some(s) => (s.state.x, s.state.y),
        None => (0., 0.),
      };
      let r = th.scratch_mut();
      r.start = p.runtime.now;
      r.duration = duration;
      r.base_x = x;
      r.base_y = y;
      match to {
        Some((tx, ty)) => {
          r.delta_x = tx - x;
          r.delta_y = ty - y;
        }
        None => {
          // Unknown destination: glide nowhere, finish immediately.
          r.duration = 0.;
          r.delta_x = 0.;
          r.delta_y = 0.;
        }
      }
      Flow::Next
    }
    Ins::GlideTick { resume } => {
      let r = th.scratch().clone();
      let mut f = if r.duration > 0. {
        (p.runtime.now - r.start) / (r.duration * 1000.)
      } else {
        1.
      };
      if !f.is_finite() || f > 1. {
        f = 1.;
      }
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, r.base_x + f * r.delta_x, r.base_y + f * r.delta_y);
      }
      if f < 1. {
        Flow::Yield(*resume)
      } else {
        Flow::Next
      }
    }
    Ins::RepeatInit { times } => {
      let count = evn(p, th, times)?;
      th.scratch_mut().count = count;
      Flow::Next
    }
    Ins::RepeatTest { exit } => {
      let r = th.scratch_mut();
      if r.count >= 0.5 {
        r.count -= 1.;
        Flow::Next
      } else {
        Flow::Jump(*exit)
      }
    }

    Ins::Broadcast { msg, store } => {
      let name = evs(p, th, msg)?;
      let spawned = p.trigger(&Event::Broadcast(name));
      let restarted_self = spawned.contains(&th.script_ref());
      if *store {
        th.scratch_mut().threads = spawned;
      }
      if restarted_self {
        // Our own script was retriggered from the top; this incarnation
        // is done.
        Flow::Die
      } else {
        Flow::Next
      }
    }
    Ins::WaitThreads { resume } => {
      if p.runtime.any_running(&th.scratch().threads) {
        Flow::Yield(*resume)
      } else {
        Flow::Next
      }
    }
    Ins::TriggerBackdrop { store } => {
      let name = p.stage.backdrop_name();
      let spawned = p.trigger(&Event::BackdropChanged(name));
      let restarted_self = spawned.contains(&th.script_ref());
      if *store {
        th.scratch_mut().threads = spawned;
      }
      if restarted_self {
        Flow::Die
      } else {
        Flow::Next
      }
    }

    Ins::MoveSteps(steps) => {
      let steps = evn(p, th, steps)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.forward(pen, steps);
      }
      Flow::Next
    }
    Ins::GotoXy(x, y) => {
      let x = evn(p, th, x)?;
      let y = evn(p, th, y)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, x, y);
      }
      Flow::Next
    }
    Ins::GotoObject(e) => {
      let name = evs(p, th, e)?;
      if let Some((x, y)) = get_position(p, &name) {
        if let Some((state, pen)) = p.sprite_and_pen(t) {
          state.move_to(pen, x, y);
        }
      }
      Flow::Next
    }
    Ins::TurnRight(deg) => {
      let deg = evn(p, th, deg)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.set_direction(state.direction + deg);
      }
      Flow::Next
    }
    Ins::TurnLeft(deg) => {
      let deg = evn(p, th, deg)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.set_direction(state.direction - deg);
      }
      Flow::Next
    }
    Ins::PointDirection(dir) => {
      let dir = evn(p, th, dir)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.set_direction(dir);
      }
      Flow::Next
    }
    Ins::PointTowards(e) => {
      let name = evs(p, th, e)?;
      if let Some((tx, ty)) = get_position(p, &name) {
        if let Some(state) = p.sprite_state_mut(t) {
          let dir = (tx - state.x).atan2(ty - state.y).to_degrees();
          state.set_direction(dir);
        }
      }
      Flow::Next
    }
    Ins::ChangeX(dx) => {
      let dx = evn(p, th, dx)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, state.x + dx, state.y);
      }
      Flow::Next
    }
    Ins::SetX(x) => {
      let x = evn(p, th, x)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, x, state.y);
      }
      Flow::Next
    }
    Ins::ChangeY(dy) => {
      let dy = evn(p, th, dy)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, state.x, state.y + dy);
      }
      Flow::Next
    }
    Ins::SetY(y) => {
      let y = evn(p, th, y)?;
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.move_to(pen, state.x, y);
      }
      Flow::Next
    }
    Ins::IfOnEdgeBounce => {
      let halves = p
        .sprite(t)
        .and_then(|s| p.renderer.bounds(s))
        .map(|b| ((b.right - b.left) / 2., (b.top - b.bottom) / 2.))
        .unwrap_or((0., 0.));
      let (w, h) = (p.config.stage_width as f64, p.config.stage_height as f64);
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.bounce_off_edge(pen, halves.0, halves.1, w, h);
      }
      Flow::Next
    }
    Ins::SetRotationStyle(style) => {
      if let Some(state) = p.sprite_state_mut(t) {
        state.rotation_style = match style {
          RotationStyleOp::AllAround => RotationStyle::AllAround,
          RotationStyleOp::LeftRight => RotationStyle::LeftRight,
          RotationStyleOp::DontRotate => RotationStyle::DontRotate,
        };
      }
      Flow::Next
    }

    Ins::Say { msg, think } => {
      let text = evs(p, th, msg)?;
      let id = p.runtime.next_say_id();
      if let Some(state) = p.sprite_state_mut(t) {
        state.say = if text.is_empty() {
          None
        } else {
          Some(Say {
            text,
            thinking: *think,
            id,
          })
        };
      }
      Flow::Next
    }
    Ins::SayForInit { msg, think, secs } => {
      let text = evs(p, th, msg)?;
      let duration = evn(p, th, secs)?;
      let id = p.runtime.next_say_id();
      if let Some(state) = p.sprite_state_mut(t) {
        state.say = if text.is_empty() {
          None
        } else {
          Some(Say {
            text,
            thinking: *think,
            id,
          })
        };
      }
      let r = th.scratch_mut();
      r.id = id;
      r.start = p.runtime.now;
      r.duration = duration;
      Flow::Next
    }
    Ins::SayClear => {
      let id = th.scratch().id;
      if let Some(state) = p.sprite_state_mut(t) {
        if state.say.as_ref().map(|s| s.id) == Some(id) {
          state.say = None;
        }
      }
      Flow::Next
    }
    Ins::SwitchCostume(e) => {
      let v = ev(p, th, e)?;
      if let Some(sprite) = p.sprite_mut(t) {
        costume::set_costume(
          &sprite.data.costumes,
          &sprite.data.costume_index,
          &mut sprite.state.current_costume,
          &v,
          false,
        );
      }
      Flow::Next
    }
    Ins::NextCostume => {
      if let Some(sprite) = p.sprite_mut(t) {
        costume::next_costume(&sprite.data.costumes, &mut sprite.state.current_costume);
      }
      Flow::Next
    }
    Ins::SwitchBackdrop(e) => {
      let v = ev(p, th, e)?;
      costume::set_costume(
        &p.stage.costumes,
        &p.stage.costume_index,
        &mut p.stage.current_costume,
        &v,
        true,
      );
      Flow::Next
    }
    Ins::NextBackdrop => {
      costume::next_costume(&p.stage.costumes, &mut p.stage.current_costume);
      Flow::Next
    }
    Ins::ChangeSize(n) => {
      let n = evn(p, th, n)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.size = (state.size + n).max(0.);
      }
      Flow::Next
    }
    Ins::SetSize(n) => {
      let n = evn(p, th, n)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.size = n.max(0.);
      }
      Flow::Next
    }
    Ins::ChangeEffect(filter, n) => {
      let n = evn(p, th, n)?;
      p.target_filters_mut(t).change(*filter, n);
      Flow::Next
    }
    Ins::SetEffect(filter, n) => {
      let n = evn(p, th, n)?;
      p.target_filters_mut(t).set(*filter, n);
      Flow::Next
    }
    Ins::ClearEffects => {
      p.target_filters_mut(t).reset();
      Flow::Next
    }
    Ins::Show => {
      if let Some(state) = p.sprite_state_mut(t) {
        state.visible = true;
      }
      Flow::Next
    }
    Ins::Hide => {
      if let Some(state) = p.sprite_state_mut(t) {
        state.visible = false;
      }
      Flow::Next
    }
    Ins::GoToFront => {
      if let Some(pos) = p.layers.iter().position(|id| *id == t) {
        let id = p.layers.remove(pos);
        p.layers.push(id);
      }
      Flow::Next
    }
    Ins::GoToBack => {
      if let Some(pos) = p.layers.iter().position(|id| *id == t) {
        let id = p.layers.remove(pos);
        p.layers.insert(0, id);
      }
      Flow::Next
    }
    Ins::GoLayers { forward, n } => {
      let n = evn(p, th, n)?.max(0.) as usize;
      if let Some(pos) = p.layers.iter().position(|id| *id == t) {
        let id = p.layers.remove(pos);
        let new_pos = if *forward {
          (pos + n).min(p.layers.len())
        } else {
          pos.saturating_sub(n)
        };
        p.layers.insert(new_pos, id);
      }
      Flow::Next
    }

    Ins::PlaySound { sound } => {
      let name = ev(p, th, sound)?;
      if let Some(sound) = p.find_sound(t, &name) {
        let volume = p.target_volume(t);
        p.audio.play_sound(t, &sound, volume)?;
      }
      Flow::Next
    }
    Ins::PlaySoundInit { sound, skip } => {
      let name = ev(p, th, sound)?;
      match p.find_sound(t, &name) {
        Some(sound) => {
          let volume = p.target_volume(t);
          p.audio.play_sound(t, &sound, volume)?;
          let r = th.scratch_mut();
          r.start = p.runtime.now;
          r.duration = sound.duration_secs;
          Flow::Next
        }
        None => Flow::Jump(*skip),
      }
    }
    Ins::StopAllSounds => {
      p.audio.stop_all();
      Flow::Next
    }
    Ins::ChangeVolume(n) => {
      let n = evn(p, th, n)?;
      let volume = p.target_volume(t);
      p.set_target_volume(t, (volume + n).clamp(0., 100.));
      Flow::Next
    }
    Ins::SetVolume(n) => {
      let n = evn(p, th, n)?;
      p.set_target_volume(t, n.clamp(0., 100.));
      Flow::Next
    }
    Ins::SetTempo(n) => {
      p.stage.tempo = evn(p, th, n)?;
      Flow::Next
    }
    Ins::ChangeTempo(n) => {
      p.stage.tempo += evn(p, th, n)?;
      Flow::Next
    }
    Ins::PlayNoteInit { note, beats } => {
      let key = evn(p, th, note)?;
      let beats = evn(p, th, beats)?;
      let secs = beats * 60. / p.stage.tempo;
      let volume = p.target_volume(t);
      p.audio.play_note(key, secs, volume)?;
      let r = th.scratch_mut();
      r.start = p.runtime.now;
      r.duration = secs;
      Flow::Next
    }
    Ins::RestInit { beats } => {
      let beats = evn(p, th, beats)?;
      let secs = beats * 60. / p.stage.tempo;
      let r = th.scratch_mut();
      r.start = p.runtime.now;
      r.duration = secs;
      Flow::Next
    }

    Ins::StopAll => {
      p.stop_all();
      Flow::Die
    }
    Ins::StopOtherScripts => {
      p.stop_other_scripts(t);
      Flow::Next
    }
    Ins::StopDynamic(e) => {
      let option = evs(p, th, e)?;
      match option.as_str() {
        "all" => {
          p.stop_all();
          Flow::Die
        }
        "this script" => end_call(th),
        "other scripts in sprite" | "other scripts in stage" => {
          p.stop_other_scripts(t);
          Flow::Next
        }
        _ => Flow::Next,
      }
    }
    Ins::CreateClone(e) => {
      let name = evs(p, th, e)?;
      let origin = if name == "_myself_" {
        Some(t)
      } else {
        p.sprites
          .iter()
          .find(|s| !s.is_clone && s.data.name == name)
          .map(|s| s.id)
      };
      if let Some(origin) = origin {
        if let Some(clone_id) = p.spawn_clone(origin) {
          p.trigger_for(clone_id, &Event::Cloned);
        }
      }
      Flow::Next
    }
    Ins::DeleteThisClone => {
      if matches!(p.sprite(t), Some(s) if s.is_clone) {
        p.delete_clone(t);
        Flow::Die
      } else {
        Flow::Next
      }
    }
    Ins::CounterIncr => {
      p.stage.counter += 1.;
      Flow::Next
    }
    Ins::CounterClear => {
      p.stage.counter = 0.;
      Flow::Next
    }

    Ins::PromptReserve => {
      th.scratch_mut().id = p.stage.next_prompt_id;
      p.stage.next_prompt_id += 1;
      Flow::Next
    }
    Ins::PromptQueueTurn { resume } => {
      if p.stage.prompt_id < th.scratch().id {
        Flow::Yield(*resume)
      } else {
        Flow::Next
      }
    }
    Ins::PromptAsk { question } => {
      let q = evs(p, th, question)?;
      p.stage.question = Some(q);
      Flow::Next
    }
    Ins::PromptWait { resume } => {
      if p.stage.prompt_id == th.scratch().id {
        Flow::Yield(*resume)
      } else {
        Flow::Next
      }
    }
    Ins::SetDragMode(draggable) => {
      if let Some(state) = p.sprite_state_mut(t) {
        state.draggable = *draggable;
      }
      Flow::Next
    }
    Ins::ResetTimer => {
      p.runtime.timer_start = p.runtime.now;
      Flow::Next
    }

    Ins::SetVar(var, e) => {
      let v = ev(p, th, e)?;
      p.set_var(t, var, v);
      Flow::Next
    }
    Ins::ChangeVar(var, e) => {
      let delta = evn(p, th, e)?;
      let old = p.var_value(t, var).to_number();
      let mut next = old + delta;
      if next.is_nan() {
        next = 0.;
      }
      p.set_var(t, var, Value::Number(next));
      Flow::Next
    }
    Ins::SetWatcherVisible { name, visible } => {
      p.stage.watcher_visibility.insert(name.clone(), *visible);
      Flow::Next
    }
    Ins::ListAdd(list, e) => {
      let v = ev(p, th, e)?;
      if let Some(list) = p.list_mut(t, list) {
        list.push(v);
      }
      Flow::Next
    }
    Ins::ListDelete(list, index) => {
      let index = ListIndex::from_value(&ev(p, th, index)?);
      if let Some(list) = p.list_mut(t, list) {
        list.delete(&index);
      }
      Flow::Next
    }
    Ins::ListDeleteAll(list) => {
      if let Some(list) = p.list_mut(t, list) {
        list.delete_all();
      }
      Flow::Next
    }
    Ins::ListInsert { list, index, item } => {
      let index = ListIndex::from_value(&ev(p, th, index)?);
      let item = ev(p, th, item)?;
      if let Some(list) = p.list_mut(t, list) {
        list.insert(&index, item);
      }
      Flow::Next
    }
    Ins::ListReplace { list, index, item } => {
      let index = ListIndex::from_value(&ev(p, th, index)?);
      let item = ev(p, th, item)?;
      if let Some(list) = p.list_mut(t, list) {
        list.set(&index, item);
      }
      Flow::Next
    }

    Ins::PenClear => {
      p.pen_ops.clear();
      Flow::Next
    }
    Ins::PenStamp => {
      if let Some(sprite) = p.sprite(t) {
        if let Some(costume) = sprite.current_costume() {
          let op = PenOp::Stamp {
            md5ext: costume.md5ext.clone(),
            x: sprite.state.x,
            y: sprite.state.y,
            scale: sprite.state.size / 100. / costume.bitmap_resolution,
            direction: sprite.state.direction,
          };
          p.pen_ops.push(op);
        }
      }
      Flow::Next
    }
    Ins::PenDown => {
      if let Some((state, pen)) = p.sprite_and_pen(t) {
        state.pen.down = true;
        state.dot_pen(pen);
      }
      Flow::Next
    }
    Ins::PenUp => {
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.down = false;
      }
      Flow::Next
    }
    Ins::SetPenColor(e) => {
      let rgb = evn(p, th, e)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.set_color_number(rgb);
      }
      Flow::Next
    }
    Ins::SetPenParam { param, value } => {
      let param = evs(p, th, param)?;
      let value = evn(p, th, value)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.set_param(&param, value);
      }
      Flow::Next
    }
    Ins::ChangePenParam { param, value } => {
      let param = evs(p, th, param)?;
      let value = evn(p, th, value)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.change_param(&param, value);
      }
      Flow::Next
    }
    Ins::SetPenSize(e) => {
      let size = evn(p, th, e)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.size = size.max(1.);
      }
      Flow::Next
    }
    Ins::ChangePenSize(e) => {
      let delta = evn(p, th, e)?;
      if let Some(state) = p.sprite_state_mut(t) {
        state.pen.size = (state.pen.size + delta).max(1.);
      }
      Flow::Next
    }

    Ins::Visual(kind) => {
      let counts = match kind {
        VisualKind::Always => true,
        VisualKind::Visible => p.target_visible(t),
        VisualKind::Drawing => {
          p.target_visible(t)
            || p
              .sprite(t)
              .map(|s| s.state.pen.down)
              .unwrap_or(false)
        }
      };
      if counts {
        p.runtime.visual = true;
      }
      Flow::Next
    }
    Ins::NoOp => Flow::Next,
  })
}

/// Pop a procedure frame and resume after the call site; at the top level
/// the thread simply ends.
fn end_call(th: &mut Thread) -> Flow {
  if th.calls.len() > 1 {
    let frame = th.calls.pop().expect("call stack checked non-empty");
    if th.warp > 0 {
      th.warp -= 1;
    }
    Flow::Tail(frame.ret)
  } else {
    Flow::Die
  }
}

/// Evaluates a compiled expression. Expressions never yield and only read
/// project state; list "random" indexing is the one impure touch.
pub fn eval(
  p: &Project,
  t: TargetId,
  args: &[Value],
  e: &Expr,
) -> Result<Value, RuntimeError> {
  let num = |x: Result<Value, RuntimeError>| -> Result<f64, RuntimeError> {
    Ok(x?.to_number_raw())
  };
  // Arithmetic collapses NaN to 0 after the operation, like the original's
  // `(a + b || 0)`.
  let arith = |r: f64| -> Value {
    if r.is_nan() {
      Value::Number(0.)
    } else {
      Value::Number(r)
    }
  };
  Ok(match e {
    Expr::Num(n) => Value::Number(*n),
    Expr::Str(s) => Value::String(s.clone()),
    Expr::Bool(b) => Value::Bool(*b),
    Expr::Var(var) => p.var_value(t, var),
    Expr::ListContents(list) => Value::String(
      p.list(t, list)
        .map(|l| l.contents())
        .unwrap_or_default(),
    ),
    Expr::Arg(i) => args.get(*i).cloned().unwrap_or_default(),
    Expr::AsNum(e) => Value::Number(eval(p, t, args, e)?.to_number_raw()),
    Expr::AsStr(e) => Value::String(eval(p, t, args, e)?.to_string()),
    Expr::AsBool(e) => Value::Bool(eval(p, t, args, e)?.to_bool()),
    Expr::Add(a, b) => arith(num(eval(p, t, args, a))? + num(eval(p, t, args, b))?),
    Expr::Sub(a, b) => arith(num(eval(p, t, args, a))? - num(eval(p, t, args, b))?),
    Expr::Mul(a, b) => arith(num(eval(p, t, args, a))? * num(eval(p, t, args, b))?),
    Expr::Div(a, b) => arith(num(eval(p, t, args, a))? / num(eval(p, t, args, b))?),
    Expr::Mod(a, b) => Value::Number(value::modulo(
      num(eval(p, t, args, a))?,
      num(eval(p, t, args, b))?,
    )),
    Expr::Round(e) => Value::Number(value::round_half_up(num(eval(p, t, args, e))?)),
    Expr::Random(a, b) => Value::Number(value::random_in_range(
      &eval(p, t, args, a)?,
      &eval(p, t, args, b)?,
    )),
    Expr::Gt(a, b) => Value::Bool(
      value::compare(&eval(p, t, args, a)?, &eval(p, t, args, b)?).is_gt(),
    ),
    Expr::Lt(a, b) => Value::Bool(
      value::compare(&eval(p, t, args, a)?, &eval(p, t, args, b)?).is_lt(),
    ),
    Expr::Eq(a, b) => Value::Bool(value::equal(&eval(p, t, args, a)?, &eval(p, t, args, b)?)),
    Expr::And(a, b) => {
      Value::Bool(eval(p, t, args, a)?.to_bool() && eval(p, t, args, b)?.to_bool())
    }
    Expr::Or(a, b) => {
      Value::Bool(eval(p, t, args, a)?.to_bool() || eval(p, t, args, b)?.to_bool())
    }
    Expr::Not(e) => Value::Bool(!eval(p, t, args, e)?.to_bool()),
    Expr::Join(a, b) => Value::String(format!(
      "{}{}",
      eval(p, t, args, a)?,
      eval(p, t, args, b)?
    )),
    Expr::LetterOf(letter, s) => {
      let i = num(eval(p, t, args, letter))? as i64;
      let s = eval(p, t, args, s)?.to_string();
      Value::String(if i >= 1 {
        s.chars()
          .nth(i as usize - 1)
          .map(|c| c.to_string())
          .unwrap_or_default()
      } else {
        String::new()
      })
    }
    Expr::StrLen(e) => Value::Number(eval(p, t, args, e)?.to_string().chars().count() as f64),
    Expr::Contains(a, b) => {
      let a = eval(p, t, args, a)?.to_string().to_lowercase();
      let b = eval(p, t, args, b)?.to_string().to_lowercase();
      Value::Bool(a.contains(&b))
    }
    Expr::MathOp(f, e) => Value::Number(f.apply(num(eval(p, t, args, e))?)),
    Expr::XPos => Value::Number(
      p.sprite(t)
        .map(|s| value::limit_precision(s.state.x))
        .unwrap_or(0.),
    ),
    Expr::YPos => Value::Number(
      p.sprite(t)
        .map(|s| value::limit_precision(s.state.y))
        .unwrap_or(0.),
    ),
    Expr::Direction => Value::Number(p.sprite(t).map(|s| s.state.direction).unwrap_or(90.)),
    Expr::CostumeNumber => match p.sprite(t) {
      Some(s) => Value::Number(s.state.current_costume as f64 + 1.),
      None => Value::Number(p.stage.current_costume as f64 + 1.),
    },
    Expr::CostumeName => match p.sprite(t) {
      Some(s) => Value::String(
        s.current_costume()
          .map(|c| c.name.clone())
          .unwrap_or_default(),
      ),
      None => Value::String(p.stage.backdrop_name()),
    },
    Expr::BackdropNumber => Value::Number(p.stage.current_costume as f64 + 1.),
    Expr::BackdropName => Value::String(p.stage.backdrop_name()),
    Expr::Size => Value::Number(p.sprite(t).map(|s| s.state.size).unwrap_or(100.)),
    Expr::Volume => Value::Number(p.target_volume(t)),
    Expr::Tempo => Value::Number(p.stage.tempo),
    Expr::Counter => Value::Number(p.stage.counter),
    Expr::Timer => Value::Number(p.runtime.timer_secs()),
    Expr::Answer => Value::String(p.stage.answer.clone()),
    Expr::Username => Value::String(p.stage.username.clone()),
    Expr::MouseX => Value::Number(p.stage.mouse_x),
    Expr::MouseY => Value::Number(p.stage.mouse_y),
    Expr::MouseDown => Value::Bool(p.stage.mouse_down),
    Expr::DaysSince2000 => Value::Number(days_since_2000()),
    Expr::Loudness => Value::Number(-1.),
    Expr::KeyPressed(e) => {
      let name = eval(p, t, args, e)?.to_string();
      Value::Bool(match crate::input::key_code(&name) {
        crate::input::KeySpec::Any => p.stage.any_key_down(),
        crate::input::KeySpec::Code(code) => p.stage.key_down(code),
      })
    }
    Expr::Touching(e) => {
      let name = eval(p, t, args, e)?.to_string();
      Value::Bool(touching(p, t, &name)?)
    }
    Expr::TouchingColor(e) => {
      let color = num(eval(p, t, args, e))? as i64 as u32 & 0xffffff;
      match p.sprite(t) {
        Some(s) => Value::Bool(p.renderer.touches_color(s, color)?),
        None => Value::Bool(false),
      }
    }
    Expr::ColorTouchingColor(own, other) => {
      let own = num(eval(p, t, args, own))? as i64 as u32 & 0xffffff;
      let other = num(eval(p, t, args, other))? as i64 as u32 & 0xffffff;
      match p.sprite(t) {
        Some(s) => Value::Bool(p.renderer.color_touches_color(s, own, other)?),
        None => Value::Bool(false),
      }
    }
    Expr::DistanceTo(e) => {
      let name = eval(p, t, args, e)?.to_string();
      let from = p.sprite(t).map(|s| (s.state.x, s.state.y)).unwrap_or((0., 0.));
      Value::Number(match get_position(p, &name) {
        Some((x, y)) => ((x - from.0).powi(2) + (y - from.1).powi(2)).sqrt(),
        None => 10000.,
      })
    }
    Expr::Attribute(attr, object) => {
      let object = eval(p, t, args, object)?.to_string();
      attribute(p, attr, &object)
    }
    Expr::Current(unit) => Value::Number(current_time_part(*unit)),
    Expr::ItemOfList(list, index) => {
      let index = ListIndex::from_value(&eval(p, t, args, index)?);
      p.list(t, list).map(|l| l.item(&index)).unwrap_or_default()
    }
    Expr::ItemNumOfList(list, item) => {
      let item = eval(p, t, args, item)?;
      Value::Number(p.list(t, list).map(|l| l.index_of(&item)).unwrap_or(0.))
    }
    Expr::ListLength(list) => {
      Value::Number(p.list(t, list).map(|l| l.len() as f64).unwrap_or(0.))
    }
    Expr::ListContains(list, item) => {
      let item = eval(p, t, args, item)?;
      Value::Bool(p.list(t, list).map(|l| l.contains(&item)).unwrap_or(false))
    }
  })
}

/// Position of a named point of interest: the mouse, a random spot, or a
/// sprite.
pub fn get_position(p: &Project, name: &str) -> Option<(f64, f64)> {
  match name {
    "_mouse_" => Some((p.stage.mouse_x, p.stage.mouse_y)),
    "_random_" => {
      let w = p.config.stage_width as f64;
      let h = p.config.stage_height as f64;
      Some((
        value::random_fraction() * w - w / 2.,
        value::random_fraction() * h - h / 2.,
      ))
    }
    _ => p
      .sprites
      .iter()
      .find(|s| s.data.name == name)
      .map(|s| (s.state.x, s.state.y)),
  }
}

fn touching(p: &Project, t: TargetId, name: &str) -> Result<bool, RuntimeError> {
  let sprite = match p.sprite(t) {
    Some(s) => s,
    None => return Ok(false),
  };
  match name {
    "_mouse_" => p
      .renderer
      .touches_point(sprite, p.stage.mouse_x, p.stage.mouse_y),
    "_edge_" => {
      let bounds = match p.renderer.bounds(sprite) {
        Some(b) => b,
        None => return Ok(false),
      };
      let hw = p.config.stage_width as f64 / 2.;
      let hh = p.config.stage_height as f64 / 2.;
      Ok(bounds.left < -hw || bounds.right > hw || bounds.bottom < -hh || bounds.top > hh)
    }
    _ => {
      for other in &p.sprites {
        if other.id != t && other.data.name == name && p.renderer.intersects(sprite, other)? {
          return Ok(true);
        }
      }
      Ok(false)
    }
  }
}

/// `[attribute] of [object]`: built-in attributes first, then the other
/// target's own variables by name.
fn attribute(p: &Project, attr: &str, object: &str) -> Value {
  if object == "_stage_" || object == "Stage" {
    match attr {
      "background #" | "backdrop #" => {
        return Value::Number(p.stage.current_costume as f64 + 1.)
      }
      "backdrop name" => return Value::String(p.stage.backdrop_name()),
      "volume" => return Value::Number(p.stage.volume),
      _ => {}
    }
    if let Some(i) = p.globals.var_names.get(attr) {
      return p.globals.vars[*i].clone();
    }
    return Value::Number(0.);
  }
  let sprite = match p.sprites.iter().find(|s| s.data.name == object) {
    Some(s) => s,
    None => return Value::Number(0.),
  };
  match attr {
    "x position" => Value::Number(sprite.state.x),
    "y position" => Value::Number(sprite.state.y),
    "direction" => Value::Number(sprite.state.direction),
    "costume #" => Value::Number(sprite.state.current_costume as f64 + 1.),
    "costume name" => Value::String(
      sprite
        .current_costume()
        .map(|c| c.name.clone())
        .unwrap_or_default(),
    ),
    "size" => Value::Number(sprite.state.size),
    "volume" => Value::Number(sprite.state.volume),
    _ => match sprite.data.var_names.get(attr) {
      Some(i) => sprite.state.vars[*i].clone(),
      None => Value::Number(0.),
    },
  }
}

const EPOCH_2000_SECS: f64 = 946_684_800.;

fn unix_now_secs() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or(0.)
}

fn days_since_2000() -> f64 {
  (unix_now_secs() - EPOCH_2000_SECS) / 86400.
}

/// Civil calendar fields from the unix clock (UTC).
fn current_time_part(unit: TimeUnit) -> f64 {
  let secs = unix_now_secs();
  let days = (secs / 86400.).floor() as i64;
  let day_secs = secs - days as f64 * 86400.;
  match unit {
    TimeUnit::Hour => (day_secs / 3600.).floor(),
    TimeUnit::Minute => ((day_secs % 3600.) / 60.).floor(),
    TimeUnit::Second => (day_secs % 60.).floor(),
    TimeUnit::DayOfWeek => ((days + 4).rem_euclid(7) + 1) as f64,
    unit => {
      let (year, month, day) = civil_from_days(days);
      match unit {
        TimeUnit::Year => year as f64,
        TimeUnit::Month => month as f64,
        _ => day as f64,
      }
    }
  }
}

/// Days-from-unix-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
  let z = z + 719_468;
  let era = z.div_euclid(146_097);
  let doe = z.rem_euclid(146_097);
  let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
  let y = yoe + era * 400;
  let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
  let mp = (5 * doy + 2) / 153;
  let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
  let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
  (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn civil_date_conversion() {
    assert_eq!(civil_from_days(0), (1970, 1, 1));
    assert_eq!(civil_from_days(11_017), (2000, 3, 1));
    assert_eq!(civil_from_days(19_723), (2024, 1, 1));
  }
}
