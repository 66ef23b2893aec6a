use std::collections::HashMap;

use log::{debug, warn};

use crate::block::{
  EdgeKind, EdgeTrigger, Expr, Filter, GlideDest, Ins, Label, ListRef, Procedure, Program,
  RotationStyleOp, Scope, TimeUnit, VarRef, VisualKind,
};
use crate::input::{key_code, KeySpec};
use crate::list::List;
use crate::sb3;
use crate::value::{MathFn, Value};

/// Variable/list declarations of one storage tier, with name resolution
/// and compile-time creation of names no one declared.
#[derive(Debug, Default)]
pub struct ScopeTable {
  pub var_names: HashMap<String, usize>,
  pub var_order: Vec<String>,
  pub var_values: Vec<Value>,
  pub var_cloud: Vec<bool>,
  pub list_names: HashMap<String, usize>,
  pub list_values: Vec<List>,
}

impl ScopeTable {
  pub fn add_var(&mut self, name: &str, value: Value, cloud: bool) -> usize {
    let index = self.var_values.len();
    self.var_names.insert(name.to_string(), index);
    self.var_order.push(name.to_string());
    self.var_values.push(value);
    self.var_cloud.push(cloud);
    index
  }

  pub fn add_list(&mut self, name: &str, values: Vec<Value>) -> usize {
    let index = self.list_values.len();
    self.list_names.insert(name.to_string(), index);
    self.list_values.push(List::new(values));
    index
  }
}

/// Result type hint of a compiled expression; drives the coercion wrapper
/// inserted at the consumption site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
  Num,
  Str,
  Bool,
  Any,
}

/// Compiles one target's block graph into a `Program`: flat code, fragment
/// table, listener registrations, procedure table.
pub fn compile_target(
  blocks: &HashMap<String, sb3::Block>,
  is_stage: bool,
  globals: &mut ScopeTable,
  locals: Option<&mut ScopeTable>,
) -> Program {
  let mut compiler = Compiler {
    blocks,
    is_stage,
    globals,
    locals,
    program: Program::default(),
    params: Vec::new(),
  };
  compiler.register_procedures();
  // Deterministic script order.
  let mut top_level: Vec<&String> = blocks
    .iter()
    .filter(|(_, b)| b.top_level)
    .map(|(id, _)| id)
    .collect();
  top_level.sort();
  for id in top_level {
    compiler.compile_script(id);
  }
  compiler.program
}

struct Compiler<'a> {
  blocks: &'a HashMap<String, sb3::Block>,
  is_stage: bool,
  globals: &'a mut ScopeTable,
  locals: Option<&'a mut ScopeTable>,
  program: Program,
  /// Parameter names of the procedure being compiled, for argument
  /// reporters.
  params: Vec<String>,
}

impl<'a> Compiler<'a> {
  /// Procedure signatures are collected before any script compiles so
  /// call sites can resolve regardless of script order; entry fragments
  /// are patched in when the definitions compile.
  fn register_procedures(&mut self) {
    let mut ids: Vec<&String> = self
      .blocks
      .iter()
      .filter(|(_, b)| b.top_level && b.opcode == "procedures_definition")
      .map(|(id, _)| id)
      .collect();
    ids.sort();
    for id in ids {
      let block = &self.blocks[id];
      let mutation = match self.prototype_mutation(block) {
        Some(m) => m,
        None => {
          warn!("procedure definition without a prototype");
          continue;
        }
      };
      let name = match &mutation.proccode {
        Some(name) => name.clone(),
        None => continue,
      };
      let procedure = Procedure {
        fragment: 0,
        warp: mutation.warp_flag(),
        params: mutation.argument_names(),
      };
      let index = self.program.procedures.len();
      self.program.procedures.push(procedure);
      self.program.procedure_index.insert(name, index);
    }
  }

  fn prototype_mutation(&self, definition: &sb3::Block) -> Option<&'a sb3::Mutation> {
    match definition.inputs.get("custom_block") {
      Some(sb3::Input::Block(id)) => self.blocks.get(id)?.mutation.as_ref(),
      _ => None,
    }
  }

  fn compile_script(&mut self, id: &str) {
    let hat = &self.blocks[id];
    let is_definition = hat.opcode == "procedures_definition";
    if hat.next.is_none() && !is_definition {
      // Empty listeners do nothing; skip them entirely.
      return;
    }
    if !self.is_hat(&hat.opcode) {
      if !hat.next.is_none() {
        debug!("dangling top level block: {}", hat.opcode);
      }
      return;
    }

    let entry = self.label();
    if is_definition {
      let params = self
        .prototype_mutation(hat)
        .map(|m| m.argument_names())
        .unwrap_or_default();
      self.params = params;
    }
    if let Some(next) = hat.next.clone() {
      self.compile_chain(&next);
    }
    if is_definition {
      self.emit(Ins::EndCall);
      self.params = Vec::new();
    } else {
      self.emit(Ins::Retire);
    }
    self.register_hat(hat, entry);
  }

  fn is_hat(&self, opcode: &str) -> bool {
    matches!(
      opcode,
      "event_whenflagclicked"
        | "event_whenkeypressed"
        | "event_whenthisspriteclicked"
        | "event_whenstageclicked"
        | "event_whenbackdropswitchesto"
        | "event_whenbroadcastreceived"
        | "event_whengreaterthan"
        | "control_start_as_clone"
        | "procedures_definition"
    )
  }

  fn register_hat(&mut self, hat: &sb3::Block, entry: Label) {
    match hat.opcode.as_str() {
      "event_whenflagclicked" => self.program.listeners.green_flag.push(entry),
      "event_whenthisspriteclicked" | "event_whenstageclicked" => {
        self.program.listeners.clicked.push(entry)
      }
      "control_start_as_clone" => self.program.listeners.cloned.push(entry),
      "event_whenkeypressed" => {
        let key = field_str(hat, "KEY_OPTION");
        match key_code(&key) {
          KeySpec::Any => self.program.listeners.any_key.push(entry),
          KeySpec::Code(code) => self
            .program
            .listeners
            .key_pressed
            .entry(code)
            .or_default()
            .push(entry),
        }
      }
      "event_whenbackdropswitchesto" => {
        let backdrop = field_str(hat, "BACKDROP").to_lowercase();
        self
          .program
          .listeners
          .backdrop_changed
          .entry(backdrop)
          .or_default()
          .push(entry);
      }
      "event_whenbroadcastreceived" => {
        let name = field_str(hat, "BROADCAST_OPTION").to_lowercase();
        self
          .program
          .listeners
          .broadcast
          .entry(name)
          .or_default()
          .push(entry);
      }
      "event_whengreaterthan" => {
        let kind = match field_str(hat, "WHENGREATERTHANMENU").to_lowercase().as_str() {
          "timer" => EdgeKind::Timer,
          _ => EdgeKind::Loudness,
        };
        let threshold = self.input(hat, "VALUE", Ty::Num);
        self.program.listeners.edge_triggers.push(EdgeTrigger {
          kind,
          threshold,
          fragment: entry,
        });
      }
      "procedures_definition" => {
        if let Some(name) = self
          .prototype_mutation(hat)
          .and_then(|m| m.proccode.clone())
        {
          if let Some(index) = self.program.procedure_index.get(&name) {
            self.program.procedures[*index].fragment = entry;
          }
        }
      }
      _ => {}
    }
  }

  fn compile_chain(&mut self, id: &str) {
    let mut current = Some(id.to_string());
    while let Some(id) = current {
      let block = match self.blocks.get(&id) {
        Some(b) => b,
        None => return,
      };
      self.compile_statement(block);
      current = block.next.clone();
    }
  }

  fn emit(&mut self, ins: Ins) -> usize {
    self.program.code.push(ins);
    self.program.code.len() - 1
  }

  /// Creates a resume point at the current end of code.
  fn label(&mut self) -> Label {
    self.program.fragments.push(self.program.code.len());
    self.program.fragments.len() - 1
  }

  /// Points a previously emitted forward jump at the current end of code.
  fn patch_here(&mut self, pc: usize) {
    let target = self.program.code.len();
    match &mut self.program.code[pc] {
      Ins::Jump(t) | Ins::JumpUnless(_, t) | Ins::JumpIf(_, t) => *t = target,
      Ins::RepeatTest { exit } => *exit = target,
      Ins::PlaySoundInit { skip, .. } => *skip = target,
      other => warn!("patch target is not a jump: {other:?}"),
    }
  }

  /// The `wait()` shape: force at least one yield, then requeue at the
  /// same tick until the scratch record's deadline passes. The scratch
  /// record must already hold start/duration.
  fn wait_pattern(&mut self) {
    let fq = self.emit(Ins::ForceQueue(0));
    let resume = self.label();
    if let Ins::ForceQueue(t) = &mut self.program.code[fq] {
      *t = resume;
    }
    self.emit(Ins::WaitTick { resume });
  }

  fn substack(&mut self, block: &sb3::Block, name: &str) {
    if let Some(sb3::Input::Block(id)) = block.inputs.get(name) {
      let id = id.clone();
      self.compile_chain(&id);
    }
  }

  fn compile_statement(&mut self, block: &sb3::Block) {
    match block.opcode.as_str() {
      // Motion
      "motion_movesteps" => {
        let steps = self.input(block, "STEPS", Ty::Num);
        self.emit(Ins::MoveSteps(steps));
        self.visual(VisualKind::Drawing);
      }
      "motion_turnright" => {
        let degrees = self.input(block, "DEGREES", Ty::Num);
        self.emit(Ins::TurnRight(degrees));
        self.visual(VisualKind::Visible);
      }
      "motion_turnleft" => {
        let degrees = self.input(block, "DEGREES", Ty::Num);
        self.emit(Ins::TurnLeft(degrees));
        self.visual(VisualKind::Visible);
      }
      "motion_goto" => {
        let to = self.input(block, "TO", Ty::Any);
        self.emit(Ins::GotoObject(to));
        self.visual(VisualKind::Drawing);
      }
      "motion_gotoxy" => {
        let x = self.input(block, "X", Ty::Num);
        let y = self.input(block, "Y", Ty::Num);
        self.emit(Ins::GotoXy(x, y));
        self.visual(VisualKind::Drawing);
      }
      "motion_glideto" => {
        let secs = self.input(block, "SECS", Ty::Num);
        let to = self.input(block, "TO", Ty::Any);
        self.visual(VisualKind::Drawing);
        self.emit(Ins::Save);
        self.emit(Ins::GlideInit {
          secs,
          dest: GlideDest::Object(to),
        });
        let resume = self.label();
        self.emit(Ins::GlideTick { resume });
        self.emit(Ins::Restore);
      }
      "motion_glidesecstoxy" => {
        let secs = self.input(block, "SECS", Ty::Num);
        let x = self.input(block, "X", Ty::Num);
        let y = self.input(block, "Y", Ty::Num);
        self.visual(VisualKind::Drawing);
        self.emit(Ins::Save);
        self.emit(Ins::GlideInit {
          secs,
          dest: GlideDest::Xy(x, y),
        });
        let resume = self.label();
        self.emit(Ins::GlideTick { resume });
        self.emit(Ins::Restore);
      }
      "motion_pointindirection" => {
        let direction = self.input(block, "DIRECTION", Ty::Num);
        self.visual(VisualKind::Visible);
        self.emit(Ins::PointDirection(direction));
      }
      "motion_pointtowards" => {
        let towards = self.input(block, "TOWARDS", Ty::Any);
        self.emit(Ins::PointTowards(towards));
        self.visual(VisualKind::Visible);
      }
      "motion_changexby" => {
        let dx = self.input(block, "DX", Ty::Num);
        self.emit(Ins::ChangeX(dx));
        self.visual(VisualKind::Drawing);
      }
      "motion_setx" => {
        let x = self.input(block, "X", Ty::Num);
        self.emit(Ins::SetX(x));
        self.visual(VisualKind::Drawing);
      }
      "motion_changeyby" => {
        let dy = self.input(block, "DY", Ty::Num);
        self.emit(Ins::ChangeY(dy));
        self.visual(VisualKind::Drawing);
      }
      "motion_sety" => {
        let y = self.input(block, "Y", Ty::Num);
        self.emit(Ins::SetY(y));
        self.visual(VisualKind::Drawing);
      }
      "motion_ifonedgebounce" => {
        self.emit(Ins::IfOnEdgeBounce);
      }
      "motion_setrotationstyle" => {
        let style = match field_str(block, "STYLE").as_str() {
          "left-right" => RotationStyleOp::LeftRight,
          "don't rotate" => RotationStyleOp::DontRotate,
          _ => RotationStyleOp::AllAround,
        };
        self.emit(Ins::SetRotationStyle(style));
        self.visual(VisualKind::Visible);
      }

      // Looks
      "looks_sayforsecs" | "looks_thinkforsecs" => {
        let think = block.opcode == "looks_thinkforsecs";
        let msg = self.input(block, "MESSAGE", Ty::Any);
        let secs = self.input(block, "SECS", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::SayForInit { msg, think, secs });
        let resume = self.label();
        self.emit(Ins::WaitTick { resume });
        self.emit(Ins::SayClear);
        self.emit(Ins::Restore);
        self.visual(VisualKind::Visible);
      }
      "looks_say" | "looks_think" => {
        let think = block.opcode == "looks_think";
        let msg = self.input(block, "MESSAGE", Ty::Any);
        self.emit(Ins::Say { msg, think });
        self.visual(VisualKind::Visible);
      }
      "looks_switchcostumeto" => {
        let costume = self.input(block, "COSTUME", Ty::Any);
        self.emit(Ins::SwitchCostume(costume));
        self.visual(VisualKind::Visible);
      }
      "looks_nextcostume" => {
        self.emit(Ins::NextCostume);
        self.visual(VisualKind::Visible);
      }
      "looks_switchbackdropto" => {
        let backdrop = self.input(block, "BACKDROP", Ty::Any);
        self.emit(Ins::SwitchBackdrop(backdrop));
        self.visual(VisualKind::Always);
        self.emit(Ins::TriggerBackdrop { store: false });
      }
      "looks_switchbackdroptoandwait" => {
        let backdrop = self.input(block, "BACKDROP", Ty::Any);
        self.emit(Ins::SwitchBackdrop(backdrop));
        self.visual(VisualKind::Always);
        self.emit(Ins::Save);
        self.emit(Ins::TriggerBackdrop { store: true });
        let resume = self.label();
        self.emit(Ins::WaitThreads { resume });
        self.emit(Ins::Restore);
      }
      "looks_nextbackdrop" => {
        self.emit(Ins::NextBackdrop);
        self.visual(VisualKind::Always);
        self.emit(Ins::TriggerBackdrop { store: false });
      }
      "looks_changesizeby" => {
        let change = self.input(block, "CHANGE", Ty::Num);
        self.emit(Ins::ChangeSize(change));
        self.visual(VisualKind::Visible);
      }
      "looks_setsizeto" => {
        let size = self.input(block, "SIZE", Ty::Num);
        self.emit(Ins::SetSize(size));
        self.visual(VisualKind::Visible);
      }
      "looks_changeeffectby" => {
        let effect = field_str(block, "EFFECT").to_lowercase();
        let change = self.input(block, "CHANGE", Ty::Num);
        match Filter::from_name(&effect) {
          Some(filter) => {
            self.emit(Ins::ChangeEffect(filter, change));
            self.visual(VisualKind::Visible);
          }
          None => warn!("unknown graphic effect: {effect}"),
        }
      }
      "looks_seteffectto" => {
        let effect = field_str(block, "EFFECT").to_lowercase();
        let value = self.input(block, "VALUE", Ty::Num);
        match Filter::from_name(&effect) {
          Some(filter) => {
            self.emit(Ins::SetEffect(filter, value));
            self.visual(VisualKind::Visible);
          }
          None => warn!("unknown graphic effect: {effect}"),
        }
      }
      "looks_cleargraphiceffects" => {
        self.emit(Ins::ClearEffects);
        self.visual(VisualKind::Visible);
      }
      "looks_show" => {
        self.emit(Ins::Show);
        self.visual(VisualKind::Always);
      }
      "looks_hide" => {
        self.visual(VisualKind::Visible);
        self.emit(Ins::Hide);
      }
      "looks_gotofrontback" => {
        if field_str(block, "FRONT_BACK") == "front" {
          self.emit(Ins::GoToFront);
        } else {
          self.emit(Ins::GoToBack);
        }
      }
      "looks_goforwardbackwardlayers" => {
        let forward = field_str(block, "FORWARD_BACKWARD") == "forward";
        let n = self.input(block, "NUM", Ty::Num);
        self.emit(Ins::GoLayers { forward, n });
      }

      // Sound / music
      "sound_play" => {
        let sound = self.input(block, "SOUND_MENU", Ty::Any);
        self.emit(Ins::PlaySound { sound });
      }
      "sound_playuntildone" => {
        let sound = self.input(block, "SOUND_MENU", Ty::Any);
        self.emit(Ins::Save);
        let init = self.emit(Ins::PlaySoundInit { sound, skip: 0 });
        self.wait_pattern();
        self.patch_here(init);
        self.emit(Ins::Restore);
      }
      "sound_stopallsounds" => {
        self.emit(Ins::StopAllSounds);
      }
      "sound_changevolumeby" => {
        let volume = self.input(block, "VOLUME", Ty::Num);
        self.emit(Ins::ChangeVolume(volume));
      }
      "sound_setvolumeto" => {
        let volume = self.input(block, "VOLUME", Ty::Num);
        self.emit(Ins::SetVolume(volume));
      }
      "music_setTempo" => {
        let tempo = self.input(block, "TEMPO", Ty::Num);
        self.emit(Ins::SetTempo(tempo));
      }
      "music_changeTempo" => {
        let tempo = self.input(block, "TEMPO", Ty::Num);
        self.emit(Ins::ChangeTempo(tempo));
      }
      "music_playNoteForBeats" => {
        let note = self.input(block, "NOTE", Ty::Num);
        let beats = self.input(block, "BEATS", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::PlayNoteInit { note, beats });
        self.wait_pattern();
        self.emit(Ins::Restore);
      }
      "music_playDrumForBeats" => {
        let note = self.input(block, "DRUM", Ty::Num);
        let beats = self.input(block, "BEATS", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::PlayNoteInit { note, beats });
        self.wait_pattern();
        self.emit(Ins::Restore);
      }
      "music_restForBeats" => {
        let beats = self.input(block, "BEATS", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::RestInit { beats });
        self.wait_pattern();
        self.emit(Ins::Restore);
      }

      // Events
      "event_broadcast" => {
        let msg = self.input(block, "BROADCAST_INPUT", Ty::Any);
        self.emit(Ins::Broadcast { msg, store: false });
      }
      "event_broadcastandwait" => {
        let msg = self.input(block, "BROADCAST_INPUT", Ty::Any);
        self.emit(Ins::Save);
        self.emit(Ins::Broadcast { msg, store: true });
        let resume = self.label();
        self.emit(Ins::WaitThreads { resume });
        self.emit(Ins::Restore);
      }

      // Control
      "control_wait" => {
        let secs = self.input(block, "DURATION", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::WaitInit { secs });
        self.wait_pattern();
        self.emit(Ins::Restore);
      }
      "control_repeat" => {
        let times = self.input(block, "TIMES", Ty::Num);
        self.emit(Ins::Save);
        self.emit(Ins::RepeatInit { times });
        let top = self.label();
        let test = self.emit(Ins::RepeatTest { exit: 0 });
        self.substack(block, "SUBSTACK");
        self.emit(Ins::Queue(top));
        self.patch_here(test);
        self.emit(Ins::Restore);
      }
      "control_forever" => {
        let top = self.label();
        self.substack(block, "SUBSTACK");
        self.emit(Ins::ForceQueue(top));
      }
      "control_if" => {
        let condition = self.input(block, "CONDITION", Ty::Bool);
        let skip = self.emit(Ins::JumpUnless(condition, 0));
        self.substack(block, "SUBSTACK");
        self.patch_here(skip);
      }
      "control_if_else" => {
        let condition = self.input(block, "CONDITION", Ty::Bool);
        let to_else = self.emit(Ins::JumpUnless(condition, 0));
        self.substack(block, "SUBSTACK");
        let to_end = self.emit(Ins::Jump(0));
        self.patch_here(to_else);
        self.substack(block, "SUBSTACK2");
        self.patch_here(to_end);
      }
      "control_wait_until" => {
        let condition = self.input(block, "CONDITION", Ty::Bool);
        let top = self.label();
        let done = self.emit(Ins::JumpIf(condition, 0));
        self.emit(Ins::Queue(top));
        self.patch_here(done);
      }
      "control_repeat_until" => {
        let condition = self.input(block, "CONDITION", Ty::Bool);
        let top = self.label();
        let done = self.emit(Ins::JumpIf(condition, 0));
        self.substack(block, "SUBSTACK");
        self.emit(Ins::Queue(top));
        self.patch_here(done);
      }
      "control_while" => {
        let condition = self.input(block, "CONDITION", Ty::Bool);
        let top = self.label();
        let done = self.emit(Ins::JumpUnless(condition, 0));
        self.substack(block, "SUBSTACK");
        self.emit(Ins::Queue(top));
        self.patch_here(done);
      }
      "control_all_at_once" => {
        self.substack(block, "SUBSTACK");
      }
      "control_stop" => {
        match field_str(block, "STOP_OPTION").as_str() {
          "all" => {
            self.emit(Ins::StopAll);
          }
          "this script" => {
            self.emit(Ins::EndCall);
          }
          "other scripts in sprite" | "other scripts in stage" => {
            self.emit(Ins::StopOtherScripts);
          }
          other => {
            let option = Expr::Str(other.to_string());
            self.emit(Ins::StopDynamic(option));
          }
        }
      }
      "control_create_clone_of" => {
        let target = self.input(block, "CLONE_OPTION", Ty::Any);
        self.emit(Ins::CreateClone(target));
      }
      "control_delete_this_clone" => {
        self.emit(Ins::DeleteThisClone);
      }
      "control_incr_counter" => {
        self.emit(Ins::CounterIncr);
      }
      "control_clear_counter" => {
        self.emit(Ins::CounterClear);
      }

      // Sensing
      "sensing_askandwait" => {
        let question = self.input(block, "QUESTION", Ty::Str);
        self.emit(Ins::PromptReserve);
        let turn = self.label();
        self.emit(Ins::PromptQueueTurn { resume: turn });
        self.emit(Ins::PromptAsk { question });
        let answered = self.label();
        self.emit(Ins::PromptWait { resume: answered });
        self.visual(VisualKind::Always);
      }
      "sensing_setdragmode" => {
        self.emit(Ins::SetDragMode(field_str(block, "DRAG_MODE") == "draggable"));
      }
      "sensing_resettimer" => {
        self.emit(Ins::ResetTimer);
      }

      // Data
      "data_setvariableto" => {
        let var = self.resolve_var(&field_str(block, "VARIABLE"));
        let value = self.input(block, "VALUE", Ty::Any);
        self.emit(Ins::SetVar(var, value));
      }
      "data_changevariableby" => {
        let var = self.resolve_var(&field_str(block, "VARIABLE"));
        let value = self.input(block, "VALUE", Ty::Num);
        self.emit(Ins::ChangeVar(var, value));
      }
      "data_showvariable" | "data_hidevariable" => {
        let name = field_str(block, "VARIABLE");
        self.emit(Ins::SetWatcherVisible {
          name,
          visible: block.opcode == "data_showvariable",
        });
      }
      "data_showlist" | "data_hidelist" => {
        let name = field_str(block, "LIST");
        self.emit(Ins::SetWatcherVisible {
          name,
          visible: block.opcode == "data_showlist",
        });
      }
      "data_addtolist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        let item = self.input(block, "ITEM", Ty::Any);
        self.emit(Ins::ListAdd(list, item));
      }
      "data_deleteoflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        let index = self.input(block, "INDEX", Ty::Any);
        self.emit(Ins::ListDelete(list, index));
      }
      "data_deletealloflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        self.emit(Ins::ListDeleteAll(list));
      }
      "data_insertatlist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        let index = self.input(block, "INDEX", Ty::Any);
        let item = self.input(block, "ITEM", Ty::Any);
        self.emit(Ins::ListInsert { list, index, item });
      }
      "data_replaceitemoflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        let index = self.input(block, "INDEX", Ty::Any);
        let item = self.input(block, "ITEM", Ty::Any);
        self.emit(Ins::ListReplace { list, index, item });
      }

      // Procedures
      "procedures_call" => {
        let mutation = match &block.mutation {
          Some(m) => m,
          None => {
            warn!("procedure call without mutation");
            return;
          }
        };
        let name = mutation.proccode.clone().unwrap_or_default();
        let proc = match self.program.procedure_index.get(&name) {
          Some(i) => *i,
          None => {
            warn!("call to unknown procedure: {name}");
            return;
          }
        };
        let mut args = Vec::new();
        for input_id in mutation.argument_ids() {
          args.push(self.input(block, &input_id, Ty::Any));
        }
        let call = self.emit(Ins::Call { proc, ret: 0, args });
        let ret = self.label();
        if let Ins::Call { ret: slot, .. } = &mut self.program.code[call] {
          *slot = ret;
        }
      }

      // Pen
      "pen_clear" => {
        self.emit(Ins::PenClear);
        self.visual(VisualKind::Always);
      }
      "pen_stamp" => {
        self.emit(Ins::PenStamp);
        self.visual(VisualKind::Always);
      }
      "pen_penDown" => {
        self.emit(Ins::PenDown);
        self.visual(VisualKind::Always);
      }
      "pen_penUp" => {
        self.emit(Ins::PenUp);
      }
      "pen_setPenColorToColor" => {
        let color = self.input(block, "COLOR", Ty::Num);
        self.emit(Ins::SetPenColor(color));
      }
      "pen_setPenHueToNumber" => {
        let hue = self.input(block, "HUE", Ty::Num);
        self.emit(Ins::SetPenParam {
          param: Expr::Str("color".to_string()),
          value: hue,
        });
      }
      "pen_changePenHueBy" => {
        let hue = self.input(block, "HUE", Ty::Num);
        self.emit(Ins::ChangePenParam {
          param: Expr::Str("color".to_string()),
          value: hue,
        });
      }
      "pen_setPenShadeToNumber" => {
        let shade = self.input(block, "SHADE", Ty::Num);
        self.emit(Ins::SetPenParam {
          param: Expr::Str("brightness".to_string()),
          value: shade,
        });
      }
      "pen_changePenShadeBy" => {
        let shade = self.input(block, "SHADE", Ty::Num);
        self.emit(Ins::ChangePenParam {
          param: Expr::Str("brightness".to_string()),
          value: shade,
        });
      }
      "pen_setPenColorParamTo" => {
        let param = self.input(block, "COLOR_PARAM", Ty::Str);
        let value = self.input(block, "VALUE", Ty::Num);
        self.emit(Ins::SetPenParam { param, value });
      }
      "pen_changePenColorParamBy" => {
        let param = self.input(block, "COLOR_PARAM", Ty::Str);
        let value = self.input(block, "VALUE", Ty::Num);
        self.emit(Ins::ChangePenParam { param, value });
      }
      "pen_setPenSizeTo" => {
        let size = self.input(block, "SIZE", Ty::Num);
        self.emit(Ins::SetPenSize(size));
      }
      "pen_changePenSizeBy" => {
        let size = self.input(block, "SIZE", Ty::Num);
        self.emit(Ins::ChangePenSize(size));
      }

      // Legacy no-ops
      "motion_scroll_right" | "motion_scroll_up" | "motion_align_scene"
      | "looks_changestretchby" | "looks_setstretchto" | "looks_hideallsprites" => {}

      other => {
        warn!("unknown statement: {other}");
        self.emit(Ins::NoOp);
      }
    }
  }

  fn visual(&mut self, kind: VisualKind) {
    self.emit(Ins::Visual(kind));
  }

  /// Compiles a named input slot to an expression of the wanted type;
  /// missing sockets become type-appropriate defaults.
  fn input(&mut self, block: &sb3::Block, name: &str, want: Ty) -> Expr {
    let input = block.inputs.get(name);
    self.compile_input(input, want)
  }

  fn compile_input(&mut self, input: Option<&sb3::Input>, want: Ty) -> Expr {
    match input {
      None | Some(sb3::Input::Empty) => fallback(want),
      Some(sb3::Input::Literal(v)) => literal(v, want),
      Some(sb3::Input::Broadcast { name, .. }) => {
        as_type(Expr::Str(name.clone()), Ty::Str, want)
      }
      Some(sb3::Input::Variable { name, .. }) => {
        let name = name.clone();
        let var = self.resolve_var(&name);
        as_type(Expr::Var(var), Ty::Any, want)
      }
      Some(sb3::Input::List { name, .. }) => {
        let name = name.clone();
        let list = self.resolve_list(&name);
        as_type(Expr::ListContents(list), Ty::Str, want)
      }
      Some(sb3::Input::Block(id)) => {
        let id = id.clone();
        let (expr, ty) = self.compile_reporter(&id);
        as_type(expr, ty, want)
      }
    }
  }

  /// Compiles a reporter block to an inline expression with its static
  /// result type.
  fn compile_reporter(&mut self, id: &str) -> (Expr, Ty) {
    let block = match self.blocks.get(id) {
      Some(b) => b,
      None => return (fallback(Ty::Any), Ty::Any),
    };
    macro_rules! num_in {
      ($name:expr) => {
        Box::new(self.input(block, $name, Ty::Num))
      };
    }
    macro_rules! str_in {
      ($name:expr) => {
        Box::new(self.input(block, $name, Ty::Str))
      };
    }
    macro_rules! any_in {
      ($name:expr) => {
        Box::new(self.input(block, $name, Ty::Any))
      };
    }
    match block.opcode.as_str() {
      // Menus compile to their field as a string literal.
      "motion_goto_menu" | "motion_glideto_menu" => {
        (Expr::Str(field_str(block, "TO")), Ty::Str)
      }
      "motion_pointtowards_menu" => (Expr::Str(field_str(block, "TOWARDS")), Ty::Str),
      "sound_sounds_menu" => (Expr::Str(field_str(block, "SOUND_MENU")), Ty::Str),
      "control_create_clone_of_menu" => {
        (Expr::Str(field_str(block, "CLONE_OPTION")), Ty::Str)
      }
      "sensing_touchingobjectmenu" => {
        (Expr::Str(field_str(block, "TOUCHINGOBJECTMENU")), Ty::Str)
      }
      "sensing_distancetomenu" => (Expr::Str(field_str(block, "DISTANCETOMENU")), Ty::Str),
      "sensing_keyoptions" => (Expr::Str(field_str(block, "KEY_OPTION")), Ty::Str),
      "sensing_of_object_menu" => (Expr::Str(field_str(block, "OBJECT")), Ty::Str),
      "looks_costume" => (Expr::Str(field_str(block, "COSTUME")), Ty::Str),
      "looks_backdrops" => (Expr::Str(field_str(block, "BACKDROP")), Ty::Str),
      "pen_menu_colorParam" => (Expr::Str(field_str(block, "colorParam")), Ty::Str),
      "matrix" => (Expr::Str(field_str(block, "MATRIX")), Ty::Str),

      // Motion
      "motion_xposition" => (Expr::XPos, Ty::Num),
      "motion_yposition" => (Expr::YPos, Ty::Num),
      "motion_direction" => (Expr::Direction, Ty::Num),

      // Looks
      "looks_costumenumbername" => {
        if field_str(block, "NUMBER_NAME") == "number" {
          (Expr::CostumeNumber, Ty::Num)
        } else {
          (Expr::CostumeName, Ty::Str)
        }
      }
      "looks_backdropnumbername" => {
        if field_str(block, "NUMBER_NAME") == "number" {
          (Expr::BackdropNumber, Ty::Num)
        } else {
          (Expr::BackdropName, Ty::Str)
        }
      }
      "looks_size" => (Expr::Size, Ty::Num),

      // Sound
      "sound_volume" => (Expr::Volume, Ty::Num),
      "music_getTempo" => (Expr::Tempo, Ty::Num),

      // Control
      "control_get_counter" => (Expr::Counter, Ty::Num),

      // Sensing
      "sensing_touchingobject" => {
        (Expr::Touching(any_in!("TOUCHINGOBJECTMENU")), Ty::Bool)
      }
      "sensing_touchingcolor" => (Expr::TouchingColor(num_in!("COLOR")), Ty::Bool),
      "sensing_coloristouchingcolor" => (
        Expr::ColorTouchingColor(num_in!("COLOR"), num_in!("COLOR2")),
        Ty::Bool,
      ),
      "sensing_distanceto" => (Expr::DistanceTo(any_in!("DISTANCETOMENU")), Ty::Num),
      "sensing_answer" => (Expr::Answer, Ty::Str),
      "sensing_keypressed" => (Expr::KeyPressed(any_in!("KEY_OPTION")), Ty::Bool),
      "sensing_mousedown" => (Expr::MouseDown, Ty::Bool),
      "sensing_mousex" => (Expr::MouseX, Ty::Num),
      "sensing_mousey" => (Expr::MouseY, Ty::Num),
      "sensing_loudness" => (Expr::Loudness, Ty::Num),
      "sensing_loud" => (Expr::Bool(false), Ty::Bool),
      "sensing_timer" => (Expr::Timer, Ty::Num),
      "sensing_of" => {
        let property = field_str(block, "PROPERTY");
        (Expr::Attribute(property, str_in!("OBJECT")), Ty::Any)
      }
      "sensing_current" => {
        let unit = match field_str(block, "CURRENTMENU").to_lowercase().as_str() {
          "year" => Some(TimeUnit::Year),
          "month" => Some(TimeUnit::Month),
          "date" => Some(TimeUnit::Date),
          "dayofweek" => Some(TimeUnit::DayOfWeek),
          "hour" => Some(TimeUnit::Hour),
          "minute" => Some(TimeUnit::Minute),
          "second" => Some(TimeUnit::Second),
          _ => None,
        };
        match unit {
          Some(unit) => (Expr::Current(unit), Ty::Num),
          None => (Expr::Num(0.), Ty::Num),
        }
      }
      "sensing_dayssince2000" => (Expr::DaysSince2000, Ty::Num),
      "sensing_username" => (Expr::Username, Ty::Str),

      // Operators
      "operator_add" => (Expr::Add(num_in!("NUM1"), num_in!("NUM2")), Ty::Num),
      "operator_subtract" => (Expr::Sub(num_in!("NUM1"), num_in!("NUM2")), Ty::Num),
      "operator_multiply" => (Expr::Mul(num_in!("NUM1"), num_in!("NUM2")), Ty::Num),
      "operator_divide" => (Expr::Div(num_in!("NUM1"), num_in!("NUM2")), Ty::Num),
      "operator_random" => (Expr::Random(any_in!("FROM"), any_in!("TO")), Ty::Num),
      "operator_gt" => (Expr::Gt(any_in!("OPERAND1"), any_in!("OPERAND2")), Ty::Bool),
      "operator_lt" => (Expr::Lt(any_in!("OPERAND1"), any_in!("OPERAND2")), Ty::Bool),
      "operator_equals" => (Expr::Eq(any_in!("OPERAND1"), any_in!("OPERAND2")), Ty::Bool),
      "operator_and" => (Expr::And(any_in!("OPERAND1"), any_in!("OPERAND2")), Ty::Bool),
      "operator_or" => (Expr::Or(any_in!("OPERAND1"), any_in!("OPERAND2")), Ty::Bool),
      "operator_not" => (Expr::Not(any_in!("OPERAND")), Ty::Bool),
      "operator_join" => (Expr::Join(str_in!("STRING1"), str_in!("STRING2")), Ty::Str),
      "operator_letter_of" => (
        Expr::LetterOf(num_in!("LETTER"), str_in!("STRING")),
        Ty::Str,
      ),
      "operator_length" => (Expr::StrLen(str_in!("STRING")), Ty::Num),
      "operator_contains" => (
        Expr::Contains(str_in!("STRING1"), str_in!("STRING2")),
        Ty::Bool,
      ),
      "operator_mod" => (Expr::Mod(any_in!("NUM1"), any_in!("NUM2")), Ty::Num),
      "operator_round" => (Expr::Round(num_in!("NUM")), Ty::Num),
      "operator_mathop" => {
        let op = field_str(block, "OPERATOR");
        match MathFn::from_name(&op) {
          Some(f) => (Expr::MathOp(f, num_in!("NUM")), Ty::Num),
          None => (Expr::Num(0.), Ty::Num),
        }
      }

      // Data
      "data_itemoflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        (Expr::ItemOfList(list, any_in!("INDEX")), Ty::Any)
      }
      "data_itemnumoflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        (Expr::ItemNumOfList(list, any_in!("ITEM")), Ty::Num)
      }
      "data_lengthoflist" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        (Expr::ListLength(list), Ty::Num)
      }
      "data_listcontainsitem" => {
        let list = self.resolve_list(&field_str(block, "LIST"));
        (Expr::ListContains(list, any_in!("ITEM")), Ty::Bool)
      }

      // Procedure arguments
      "argument_reporter_string_number" => {
        let name = field_str(block, "VALUE");
        match self.params.iter().position(|p| *p == name) {
          Some(i) => (Expr::Arg(i), Ty::Any),
          None => (Expr::Str(String::new()), Ty::Str),
        }
      }
      "argument_reporter_boolean" => {
        let name = field_str(block, "VALUE");
        match self.params.iter().position(|p| *p == name) {
          Some(i) => (Expr::AsBool(Box::new(Expr::Arg(i))), Ty::Bool),
          None => (Expr::Bool(false), Ty::Bool),
        }
      }

      // Legacy no-ops
      "sensing_userid" | "motion_xscroll" | "motion_yscroll" => (Expr::Num(0.), Ty::Num),

      other => {
        warn!("unknown expression: {other}");
        (fallback(Ty::Any), Ty::Any)
      }
    }
  }

  /// Name resolution with stage precedence: a stage-declared name always
  /// wins; otherwise the sprite's own storage is used, created on demand.
  fn resolve_var(&mut self, name: &str) -> VarRef {
    if let Some(i) = self.globals.var_names.get(name) {
      return VarRef {
        scope: Scope::Global,
        index: *i,
        cloud: self.globals.var_cloud[*i],
      };
    }
    if let Some(locals) = self.locals.as_mut() {
      let index = match locals.var_names.get(name) {
        Some(i) => *i,
        None => locals.add_var(name, Value::Number(0.), false),
      };
      VarRef {
        scope: Scope::Local,
        index,
        cloud: false,
      }
    } else {
      let index = self.globals.add_var(name, Value::Number(0.), false);
      VarRef {
        scope: Scope::Global,
        index,
        cloud: false,
      }
    }
  }

  fn resolve_list(&mut self, name: &str) -> ListRef {
    if let Some(i) = self.globals.list_names.get(name) {
      return ListRef {
        scope: Scope::Global,
        index: *i,
      };
    }
    if let Some(locals) = self.locals.as_mut() {
      let index = match locals.list_names.get(name) {
        Some(i) => *i,
        None => locals.add_list(name, Vec::new()),
      };
      ListRef {
        scope: Scope::Local,
        index,
      }
    } else {
      let index = self.globals.add_list(name, Vec::new());
      ListRef {
        scope: Scope::Global,
        index,
      }
    }
  }
}

fn field_str(block: &sb3::Block, name: &str) -> String {
  match block.fields.get(name) {
    Some(f) => f.as_str(),
    None => String::new(),
  }
}

fn fallback(want: Ty) -> Expr {
  match want {
    Ty::Num => Expr::Num(0.),
    Ty::Bool => Expr::Bool(false),
    _ => Expr::Str(String::new()),
  }
}

/// Literal inputs fold into typed constants where the hint allows.
fn literal(v: &Value, want: Ty) -> Expr {
  match want {
    Ty::Num => {
      if let Value::String(s) = v {
        if let Some(hex) = s.strip_prefix('#') {
          if let Ok(rgb) = u32::from_str_radix(hex, 16) {
            return Expr::Num(rgb as f64);
          }
        }
      }
      let n = v.to_number_raw();
      if n.is_nan() {
        as_type(raw_literal(v), Ty::Str, Ty::Num)
      } else {
        Expr::Num(n)
      }
    }
    Ty::Str => Expr::Str(v.to_string()),
    Ty::Bool => as_type(raw_literal(v), Ty::Any, Ty::Bool),
    Ty::Any => raw_literal(v),
  }
}

fn raw_literal(v: &Value) -> Expr {
  match v {
    Value::Number(n) => Expr::Num(*n),
    Value::String(s) => Expr::Str(s.clone()),
    Value::Bool(b) => Expr::Bool(*b),
  }
}

/// Inserts a coercion wrapper when the produced type doesn't match the
/// requested one.
fn as_type(expr: Expr, ty: Ty, want: Ty) -> Expr {
  if want == Ty::Any || ty == want {
    return expr;
  }
  match want {
    Ty::Num => Expr::AsNum(Box::new(expr)),
    Ty::Str => Expr::AsStr(Box::new(expr)),
    Ty::Bool => Expr::AsBool(Box::new(expr)),
    Ty::Any => expr,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn compile(blocks_json: &str) -> Program {
    let blocks: HashMap<String, sb3::Block> = serde_json::from_str(blocks_json).unwrap();
    let mut globals = ScopeTable::default();
    let mut locals = ScopeTable::default();
    compile_target(&blocks, false, &mut globals, Some(&mut locals))
  }

  #[test]
  fn script_without_yields_is_one_fragment() {
    let program = compile(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "motion_movesteps", "next": null, "parent": "a", "inputs": {"STEPS": [1, [4, "10"]]}, "fields": {}}
      }"#,
    );
    assert_eq!(program.fragments.len(), 1);
    assert_eq!(program.listeners.green_flag.len(), 1);
  }

  #[test]
  fn each_yield_point_adds_a_fragment() {
    // Two waits -> entry + 2 resume labels.
    let program = compile(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "control_wait", "next": "c", "parent": "a", "inputs": {"DURATION": [1, [5, "1"]]}, "fields": {}},
        "c": {"opcode": "control_wait", "next": null, "parent": "b", "inputs": {"DURATION": [1, [5, "1"]]}, "fields": {}}
      }"#,
    );
    assert_eq!(program.fragments.len(), 3);
  }

  #[test]
  fn loops_get_a_resume_label() {
    let program = compile(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "control_repeat", "next": null, "parent": "a", "inputs": {"TIMES": [1, [6, "3"]], "SUBSTACK": [2, "c"]}, "fields": {}},
        "c": {"opcode": "motion_movesteps", "next": null, "parent": "b", "inputs": {"STEPS": [1, [4, "10"]]}, "fields": {}}
      }"#,
    );
    assert_eq!(program.fragments.len(), 2);
    // The loop closes with a warp-aware queue back to its own label.
    assert!(program
      .code
      .iter()
      .any(|ins| matches!(ins, Ins::Queue(l) if *l == 1)));
  }

  #[test]
  fn unknown_blocks_compile_to_noops() {
    let program = compile(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "some_fake_extension_block", "next": "c", "parent": "a", "inputs": {}, "fields": {}},
        "c": {"opcode": "motion_movesteps", "next": null, "parent": "b", "inputs": {"STEPS": [1, [4, "10"]]}, "fields": {}}
      }"#,
    );
    // Still one fragment, still ends with Retire, still contains the move.
    assert_eq!(program.fragments.len(), 1);
    assert!(program.code.iter().any(|i| matches!(i, Ins::NoOp)));
    assert!(program.code.iter().any(|i| matches!(i, Ins::MoveSteps(_))));
  }

  #[test]
  fn missing_inputs_fall_back_to_defaults() {
    let program = compile(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "motion_movesteps", "next": null, "parent": "a", "inputs": {}, "fields": {}}
      }"#,
    );
    assert!(program
      .code
      .iter()
      .any(|i| matches!(i, Ins::MoveSteps(Expr::Num(n)) if *n == 0.)));
  }

  #[test]
  fn procedure_definition_and_call() {
    let program = compile(
      r#"{
        "def": {"opcode": "procedures_definition", "next": "body", "parent": null, "inputs": {"custom_block": [1, "proto"]}, "fields": {}, "topLevel": true},
        "proto": {"opcode": "procedures_prototype", "next": null, "parent": "def", "inputs": {}, "fields": {}, "mutation": {"proccode": "jump %s", "argumentids": "[\"argid\"]", "argumentnames": "[\"height\"]", "warp": "true"}},
        "body": {"opcode": "motion_movesteps", "next": null, "parent": "def", "inputs": {"STEPS": [1, [4, "1"]]}, "fields": {}},
        "hat": {"opcode": "event_whenflagclicked", "next": "call", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "call": {"opcode": "procedures_call", "next": null, "parent": "hat", "inputs": {"argid": [1, [4, "7"]]}, "fields": {}, "mutation": {"proccode": "jump %s", "argumentids": "[\"argid\"]"}}
      }"#,
    );
    assert_eq!(program.procedures.len(), 1);
    assert!(program.procedures[0].warp);
    assert_eq!(program.procedures[0].params, vec!["height".to_string()]);
    let call = program
      .code
      .iter()
      .find_map(|i| match i {
        Ins::Call { proc, ret, args } => Some((*proc, *ret, args.len())),
        _ => None,
      })
      .expect("call instruction emitted");
    assert_eq!(call.0, 0);
    assert_eq!(call.2, 1);
    // The return label exists in the fragment table.
    assert!(call.1 < program.fragments.len());
  }

  #[test]
  fn stage_precedence_in_variable_resolution() {
    let blocks: HashMap<String, sb3::Block> = serde_json::from_str(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "data_setvariableto", "next": null, "parent": "a", "inputs": {"VALUE": [1, [10, "5"]]}, "fields": {"VARIABLE": ["score", "varid"]}}
      }"#,
    )
    .unwrap();
    let mut globals = ScopeTable::default();
    globals.add_var("score", Value::Number(0.), false);
    let mut locals = ScopeTable::default();
    locals.add_var("score", Value::Number(0.), false);
    let program = compile_target(&blocks, false, &mut globals, Some(&mut locals));
    let var = program
      .code
      .iter()
      .find_map(|i| match i {
        Ins::SetVar(var, _) => Some(*var),
        _ => None,
      })
      .unwrap();
    assert_eq!(var.scope, Scope::Global);
  }

  #[test]
  fn undeclared_variable_is_created_locally() {
    let blocks: HashMap<String, sb3::Block> = serde_json::from_str(
      r#"{
        "a": {"opcode": "event_whenflagclicked", "next": "b", "parent": null, "inputs": {}, "fields": {}, "topLevel": true},
        "b": {"opcode": "data_changevariableby", "next": null, "parent": "a", "inputs": {"VALUE": [1, [4, "1"]]}, "fields": {"VARIABLE": ["fresh", "id"]}}
      }"#,
    )
    .unwrap();
    let mut globals = ScopeTable::default();
    let mut locals = ScopeTable::default();
    compile_target(&blocks, false, &mut globals, Some(&mut locals));
    assert!(locals.var_names.contains_key("fresh"));
    assert!(globals.var_names.is_empty());
  }
}
