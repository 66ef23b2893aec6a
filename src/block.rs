use std::collections::HashMap;

use crate::value::MathFn;

/// A fragment id: an index into `Program::fragments`, which in turn points
/// at the entry pc of a resumable slice of the code array. Execution that
/// resumes at a fragment falls through later fragment boundaries; labels
/// are resume points, not barriers.
pub type Label = usize;

/// Stable identity of a running target. The stage is id 0; sprites and
/// clones get fresh ids for their whole lifetime, so a queued thread whose
/// id no longer resolves belongs to a deleted clone and is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl TargetId {
  pub const STAGE: TargetId = TargetId(0);
}

/// Identifies one top-level script instance: the target it runs on and its
/// entry fragment. Used for thread dedup and broadcast-and-wait polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptRef {
  pub target: TargetId,
  pub fragment: Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  Global,
  Local,
}

#[derive(Debug, Clone, Copy)]
pub struct VarRef {
  pub scope: Scope,
  pub index: usize,
  pub cloud: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ListRef {
  pub scope: Scope,
  pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
  Color,
  Fisheye,
  Whirl,
  Pixelate,
  Mosaic,
  Brightness,
  Ghost,
}

impl Filter {
  pub fn from_name(name: &str) -> Option<Filter> {
    Some(match name {
      "color" => Filter::Color,
      "fisheye" => Filter::Fisheye,
      "whirl" => Filter::Whirl,
      "pixelate" => Filter::Pixelate,
      "mosaic" => Filter::Mosaic,
      "brightness" => Filter::Brightness,
      "ghost" => Filter::Ghost,
      _ => return None,
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
  Year,
  Month,
  Date,
  DayOfWeek,
  Hour,
  Minute,
  Second,
}

/// How a statement affects what is on screen. The compiler classifies each
/// mutation statically; the scheduler uses the flag to decide whether the
/// turbo inner loop may keep draining work before rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualKind {
  /// Counts only if the sprite is visible or its pen is down.
  Drawing,
  /// Counts only if the sprite is visible.
  Visible,
  /// Always counts (stage-level changes).
  Always,
}

/// A compiled expression, evaluated inline; never a yield point.
#[derive(Debug, Clone)]
pub enum Expr {
  Num(f64),
  Str(String),
  Bool(bool),
  Var(VarRef),
  ListContents(ListRef),
  /// Procedure argument by declaration position.
  Arg(usize),
  /// Coercions inserted at compile time from static type hints.
  AsNum(Box<Expr>),
  AsStr(Box<Expr>),
  AsBool(Box<Expr>),
  Add(Box<Expr>, Box<Expr>),
  Sub(Box<Expr>, Box<Expr>),
  Mul(Box<Expr>, Box<Expr>),
  Div(Box<Expr>, Box<Expr>),
  Mod(Box<Expr>, Box<Expr>),
  Round(Box<Expr>),
  Random(Box<Expr>, Box<Expr>),
  Gt(Box<Expr>, Box<Expr>),
  Lt(Box<Expr>, Box<Expr>),
  Eq(Box<Expr>, Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
  Not(Box<Expr>),
  Join(Box<Expr>, Box<Expr>),
  LetterOf(Box<Expr>, Box<Expr>),
  StrLen(Box<Expr>),
  Contains(Box<Expr>, Box<Expr>),
  MathOp(MathFn, Box<Expr>),
  XPos,
  YPos,
  Direction,
  CostumeNumber,
  CostumeName,
  BackdropNumber,
  BackdropName,
  Size,
  Volume,
  Tempo,
  Counter,
  Timer,
  Answer,
  Username,
  MouseX,
  MouseY,
  MouseDown,
  DaysSince2000,
  /// No microphone: always -1.
  Loudness,
  KeyPressed(Box<Expr>),
  Touching(Box<Expr>),
  TouchingColor(Box<Expr>),
  ColorTouchingColor(Box<Expr>, Box<Expr>),
  DistanceTo(Box<Expr>),
  Attribute(String, Box<Expr>),
  Current(TimeUnit),
  ItemOfList(ListRef, Box<Expr>),
  ItemNumOfList(ListRef, Box<Expr>),
  ListLength(ListRef),
  ListContains(ListRef, Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum GlideDest {
  Xy(Expr, Expr),
  Object(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStyleOp {
  AllAround,
  LeftRight,
  DontRotate,
}

/// One flat instruction of a compiled script. The compiler lowers each
/// block into one or more of these; yields only ever happen at the
/// explicit Queue/ForceQueue ops and the tick ops that wrap them.
#[derive(Debug, Clone)]
pub enum Ins {
  /// Absolute jump within the code array (if/else plumbing).
  Jump(usize),
  JumpUnless(Expr, usize),
  JumpIf(Expr, usize),
  /// Yield and resume at the fragment, unless inside warp, in which case
  /// control transfers immediately in the same scheduler turn.
  Queue(Label),
  /// Always yield; resume at the fragment next turn.
  ForceQueue(Label),
  /// Push / pop the per-yield-span scratch record.
  Save,
  Restore,
  /// Invoke a procedure: evaluate args in declaration order, push a frame
  /// returning at `ret`.
  Call {
    proc: usize,
    ret: Label,
    args: Vec<Expr>,
  },
  /// Return from a procedure frame; at the top level, retire the thread.
  EndCall,
  /// End of a top-level script body.
  Retire,

  // Timed waits. Init records the step-snapshot time and a duration in
  // the scratch record; Tick requeues itself while unexpired.
  WaitInit {
    secs: Expr,
  },
  WaitTick {
    resume: Label,
  },
  GlideInit {
    secs: Expr,
    dest: GlideDest,
  },
  GlideTick {
    resume: Label,
  },
  RepeatInit {
    times: Expr,
  },
  /// Decrements the loop counter or jumps past the loop body.
  RepeatTest {
    exit: usize,
  },

  // Events.
  Broadcast {
    msg: Expr,
    store: bool,
  },
  /// Requeue while any of the scratch record's spawned scripts still run.
  WaitThreads {
    resume: Label,
  },
  TriggerBackdrop {
    store: bool,
  },

  // Motion.
  MoveSteps(Expr),
  GotoXy(Expr, Expr),
  GotoObject(Expr),
  TurnRight(Expr),
  TurnLeft(Expr),
  PointDirection(Expr),
  PointTowards(Expr),
  ChangeX(Expr),
  SetX(Expr),
  ChangeY(Expr),
  SetY(Expr),
  IfOnEdgeBounce,
  SetRotationStyle(RotationStyleOp),

  // Looks.
  Say {
    msg: Expr,
    think: bool,
  },
  SayForInit {
    msg: Expr,
    think: bool,
    secs: Expr,
  },
  /// Clears the bubble if it is still the one this block opened.
  SayClear,
  SwitchCostume(Expr),
  NextCostume,
  SwitchBackdrop(Expr),
  NextBackdrop,
  ChangeSize(Expr),
  SetSize(Expr),
  ChangeEffect(Filter, Expr),
  SetEffect(Filter, Expr),
  ClearEffects,
  Show,
  Hide,
  GoToFront,
  GoToBack,
  GoLayers {
    forward: bool,
    n: Expr,
  },

  // Sound / music.
  PlaySound {
    sound: Expr,
  },
  /// Plays and stores the sound duration in the scratch record, or jumps
  /// to `skip` when the sound is unknown.
  PlaySoundInit {
    sound: Expr,
    skip: usize,
  },
  StopAllSounds,
  ChangeVolume(Expr),
  SetVolume(Expr),
  SetTempo(Expr),
  ChangeTempo(Expr),
  /// Starts a note and stores the beat duration in the scratch record.
  PlayNoteInit {
    note: Expr,
    beats: Expr,
  },
  RestInit {
    beats: Expr,
  },

  // Control.
  StopAll,
  StopOtherScripts,
  /// `stop [menu]` with a non-constant option, dispatched at runtime.
  StopDynamic(Expr),
  CreateClone(Expr),
  DeleteThisClone,
  CounterIncr,
  CounterClear,

  // Sensing.
  PromptReserve,
  PromptQueueTurn {
    resume: Label,
  },
  PromptAsk {
    question: Expr,
  },
  PromptWait {
    resume: Label,
  },
  SetDragMode(bool),
  ResetTimer,

  // Data.
  SetVar(VarRef, Expr),
  ChangeVar(VarRef, Expr),
  SetWatcherVisible {
    name: String,
    visible: bool,
  },
  ListAdd(ListRef, Expr),
  ListDelete(ListRef, Expr),
  ListDeleteAll(ListRef),
  ListInsert {
    list: ListRef,
    index: Expr,
    item: Expr,
  },
  ListReplace {
    list: ListRef,
    index: Expr,
    item: Expr,
  },

  // Pen.
  PenClear,
  PenStamp,
  PenDown,
  PenUp,
  SetPenColor(Expr),
  SetPenParam {
    param: Expr,
    value: Expr,
  },
  ChangePenParam {
    param: Expr,
    value: Expr,
  },
  SetPenSize(Expr),
  ChangePenSize(Expr),

  /// Raise the visual-mutation flag per the static classification.
  Visual(VisualKind),
  NoOp,
}

/// A user-defined procedure: entry fragment, warp flag, formal parameters
/// in declaration order.
#[derive(Debug, Clone)]
pub struct Procedure {
  pub fragment: Label,
  pub warp: bool,
  pub params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
  Loudness,
  Timer,
}

/// An edge-triggered `when [loudness/timer] > value` hat.
#[derive(Debug, Clone)]
pub struct EdgeTrigger {
  pub kind: EdgeKind,
  pub threshold: Expr,
  pub fragment: Label,
}

/// Event name -> entry fragments. Key and broadcast tables are keyed the
/// way dispatch looks them up (key code, lowercased name).
#[derive(Debug, Clone, Default)]
pub struct Listeners {
  pub green_flag: Vec<Label>,
  pub clicked: Vec<Label>,
  pub cloned: Vec<Label>,
  pub key_pressed: HashMap<u8, Vec<Label>>,
  pub any_key: Vec<Label>,
  pub backdrop_changed: HashMap<String, Vec<Label>>,
  pub broadcast: HashMap<String, Vec<Label>>,
  pub edge_triggers: Vec<EdgeTrigger>,
}

/// The compiled program of one target: every script's code concatenated,
/// with the fragment table mapping resume labels to entry pcs.
#[derive(Debug, Clone, Default)]
pub struct Program {
  pub code: Vec<Ins>,
  pub fragments: Vec<usize>,
  pub listeners: Listeners,
  pub procedures: Vec<Procedure>,
  pub procedure_index: HashMap<String, usize>,
}

impl Program {
  pub fn entry_pc(&self, fragment: Label) -> usize {
    self.fragments[fragment]
  }
}
