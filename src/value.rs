use std::cmp::Ordering;
use std::fmt;

/// A Scratch value. Numbers and strings are interchangeable by convention;
/// every operation coerces its operands itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Number(f64),
  String(String),
  Bool(bool),
}

impl Default for Value {
  fn default() -> Self {
    Value::Number(0.)
  }
}

impl From<f64> for Value {
  fn from(n: f64) -> Self {
    Value::Number(n)
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Number(n) => write!(f, "{}", number_to_string(*n)),
      Value::String(s) => write!(f, "{s}"),
      Value::Bool(b) => write!(f, "{b}"),
    }
  }
}

impl Value {
  /// Numeric form, NaN for strings that don't parse.
  pub fn to_number_raw(&self) -> f64 {
    match self {
      Value::Number(n) => *n,
      Value::Bool(b) => {
        if *b {
          1.
        } else {
          0.
        }
      }
      Value::String(s) => parse_number(s),
    }
  }

  /// Numeric form with NaN collapsed to 0, the usual arithmetic input.
  pub fn to_number(&self) -> f64 {
    let n = self.to_number_raw();
    if n.is_nan() {
      0.
    } else {
      n
    }
  }

  pub fn to_bool(&self) -> bool {
    match self {
      Value::Bool(b) => *b,
      Value::Number(n) => *n != 0.,
      Value::String(s) => {
        // "", "0" and "false" are the only falsy strings.
        !(s.is_empty() || s == "0" || s == "false")
      }
    }
  }

  /// True when the value would take the numeric path in compare().
  fn looks_numeric(&self) -> bool {
    match self {
      Value::Number(_) => true,
      Value::Bool(_) => false,
      Value::String(s) => s.bytes().any(|b| b.is_ascii_digit()),
    }
  }

  /// Integral bounds pick the integer branch of pick random; a string
  /// with a decimal point forces the float branch.
  pub fn is_integral(&self) -> bool {
    match self {
      Value::Number(n) => n.fract() == 0.,
      Value::Bool(_) => true,
      Value::String(s) => !s.contains('.') && parse_number(s).fract() == 0.,
    }
  }
}

/// Lenient numeric parse matching the host language's unary plus: empty or
/// whitespace-only is 0, hex literals are accepted, anything else is NaN.
fn parse_number(s: &str) -> f64 {
  let t = s.trim();
  if t.is_empty() {
    return 0.;
  }
  if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
    return match i64::from_str_radix(hex, 16) {
      Ok(v) => v as f64,
      Err(_) => f64::NAN,
    };
  }
  t.parse::<f64>().unwrap_or(f64::NAN)
}

/// Numbers print the way Scratch shows them: no trailing ".0", named
/// infinities.
pub fn number_to_string(n: f64) -> String {
  if n.is_nan() {
    "NaN".to_string()
  } else if n == f64::INFINITY {
    "Infinity".to_string()
  } else if n == f64::NEG_INFINITY {
    "-Infinity".to_string()
  } else {
    format!("{n}")
  }
}

/// The comparison law: when both operands look numeric and parse cleanly,
/// compare numerically, otherwise compare lowercased string forms.
pub fn compare(x: &Value, y: &Value) -> Ordering {
  if x.looks_numeric() && y.looks_numeric() {
    let nx = x.to_number_raw();
    let ny = y.to_number_raw();
    if !nx.is_nan() && !ny.is_nan() {
      return nx.partial_cmp(&ny).unwrap_or(Ordering::Equal);
    }
  }
  let xs = x.to_string().to_lowercase();
  let ys = y.to_string().to_lowercase();
  xs.cmp(&ys)
}

/// Equality follows the same dual rule as compare(), except that booleans
/// also take the numeric path.
pub fn equal(x: &Value, y: &Value) -> bool {
  let numericish =
    |v: &Value| matches!(v, Value::Number(_) | Value::Bool(_)) || v.looks_numeric();
  if numericish(x) && numericish(y) {
    let nx = x.to_number_raw();
    let ny = y.to_number_raw();
    if !nx.is_nan() && !ny.is_nan() {
      return nx == ny;
    }
  }
  x.to_string().to_lowercase() == y.to_string().to_lowercase()
}

/// Modulo whose result takes the sign of the divisor.
pub fn modulo(x: f64, y: f64) -> f64 {
  let mut r = x % y;
  if r / y < 0. {
    r += y;
  }
  r
}

/// Pick random: integer result when both bounds are integral and neither
/// was written with a decimal point.
pub fn random_in_range(from: &Value, to: &Value) -> f64 {
  let x = from.to_number();
  let y = to.to_number();
  let (low, high) = if x <= y { (x, y) } else { (y, x) };
  if low == high {
    return low;
  }
  if from.is_integral() && to.is_integral() {
    let span = (high - low) as i64 + 1;
    low + unsafe { libc::rand() as i64 % span } as f64
  } else {
    low + random_fraction() * (high - low)
  }
}

pub fn random_fraction() -> f64 {
  unsafe { libc::rand() as f64 / i32::MAX as f64 }
}

/// Rounds halves up, like the original host's Math.round.
pub fn round_half_up(n: f64) -> f64 {
  if n.is_nan() {
    return 0.;
  }
  (n + 0.5).floor()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
  Abs,
  Floor,
  Ceiling,
  Sqrt,
  Sin,
  Cos,
  Tan,
  Asin,
  Acos,
  Atan,
  Ln,
  Log,
  EPow,
  TenPow,
}

impl MathFn {
  pub fn from_name(name: &str) -> Option<MathFn> {
    Some(match name {
      "abs" => MathFn::Abs,
      "floor" => MathFn::Floor,
      "ceiling" => MathFn::Ceiling,
      "sqrt" => MathFn::Sqrt,
      "sin" => MathFn::Sin,
      "cos" => MathFn::Cos,
      "tan" => MathFn::Tan,
      "asin" => MathFn::Asin,
      "acos" => MathFn::Acos,
      "atan" => MathFn::Atan,
      "ln" => MathFn::Ln,
      "log" => MathFn::Log,
      "e ^" => MathFn::EPow,
      "10 ^" => MathFn::TenPow,
      _ => return None,
    })
  }

  pub fn apply(self, x: f64) -> f64 {
    match self {
      MathFn::Abs => x.abs(),
      MathFn::Floor => x.floor(),
      MathFn::Ceiling => x.ceil(),
      MathFn::Sqrt => x.sqrt(),
      MathFn::Sin => truncate_float(degrees_to_radians(x).sin()),
      MathFn::Cos => truncate_float(degrees_to_radians(x).cos()),
      MathFn::Tan => {
        let angle = x % 360.;
        if angle == -270. || angle == 90. {
          f64::INFINITY
        } else if angle == -90. || angle == 270. {
          f64::NEG_INFINITY
        } else {
          truncate_float(degrees_to_radians(angle).tan())
        }
      }
      MathFn::Asin => radians_to_degrees(x.asin()),
      MathFn::Acos => radians_to_degrees(x.acos()),
      MathFn::Atan => radians_to_degrees(x.atan()),
      MathFn::Ln => x.ln(),
      MathFn::Log => x.log10(),
      MathFn::EPow => x.exp(),
      MathFn::TenPow => 10f64.powf(x),
    }
  }
}

pub fn degrees_to_radians(degrees: f64) -> f64 {
  degrees * std::f64::consts::PI / 180.
}

pub fn radians_to_degrees(radians: f64) -> f64 {
  radians * 180. / std::f64::consts::PI
}

/// Trig results carry float noise (sin 180° != 0); clip to ten decimals the
/// way the original does.
fn truncate_float(value: f64) -> f64 {
  format!("{value:.10}").parse().unwrap_or(value)
}

/// Display rounding for reported coordinates.
pub fn limit_precision(value: f64) -> f64 {
  let rounded = value.round();
  if (value - rounded).abs() < 1e-9 {
    rounded
  } else {
    value
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn num(n: f64) -> Value {
    Value::Number(n)
  }

  fn s(v: &str) -> Value {
    Value::String(v.to_string())
  }

  #[test]
  fn compare_numeric_when_both_look_numeric() {
    assert_eq!(compare(&s("10"), &s("9")), Ordering::Greater);
    assert_eq!(compare(&num(2.), &s("10")), Ordering::Less);
    assert_eq!(compare(&s("1e2"), &num(100.)), Ordering::Equal);
  }

  #[test]
  fn compare_lexicographic_when_not_numeric() {
    // "9a" contains a digit but does not parse, so both fall back to
    // string comparison, where "10" < "9a".
    assert_eq!(compare(&s("10"), &s("9a")), Ordering::Less);
    assert_eq!(compare(&s("apple"), &s("BANANA")), Ordering::Less);
    assert_eq!(compare(&s("Hello"), &s("hello")), Ordering::Equal);
  }

  #[test]
  fn equal_follows_dual_rule() {
    assert!(equal(&s("1"), &num(1.)));
    assert!(equal(&Value::Bool(true), &num(1.)));
    assert!(equal(&s("ABC"), &s("abc")));
    assert!(!equal(&s("1.0.0"), &num(1.)));
  }

  #[test]
  fn bool_coercion() {
    assert!(!s("").to_bool());
    assert!(!s("0").to_bool());
    assert!(!s("false").to_bool());
    assert!(s("no").to_bool());
    assert!(!num(0.).to_bool());
    assert!(num(-1.).to_bool());
  }

  #[test]
  fn modulo_takes_sign_of_divisor() {
    assert_eq!(modulo(-1., 4.), 3.);
    assert_eq!(modulo(1., -4.), -3.);
    assert_eq!(modulo(5., 3.), 2.);
    assert_eq!(modulo(-5., -3.), -2.);
  }

  #[test]
  fn number_parsing_is_lenient() {
    assert_eq!(s("  12 ").to_number(), 12.);
    assert_eq!(s("").to_number(), 0.);
    assert_eq!(s("0x10").to_number(), 16.);
    assert_eq!(s("garbage").to_number(), 0.);
    assert!(s("garbage").to_number_raw().is_nan());
  }

  #[test]
  fn number_display_has_no_trailing_zero() {
    assert_eq!(number_to_string(3.), "3");
    assert_eq!(number_to_string(3.5), "3.5");
    assert_eq!(number_to_string(f64::INFINITY), "Infinity");
  }

  #[test]
  fn random_integer_range_stays_in_bounds() {
    for _ in 0..100 {
      let r = random_in_range(&num(1.), &num(6.));
      assert!((1. ..=6.).contains(&r));
      assert_eq!(r.fract(), 0.);
    }
  }

  #[test]
  fn random_float_when_decimal_point_present() {
    for _ in 0..100 {
      let r = random_in_range(&s("0.5"), &s("1.5"));
      assert!((0.5..=1.5).contains(&r));
    }
  }

  #[test]
  fn rounding_matches_host() {
    assert_eq!(round_half_up(2.5), 3.);
    assert_eq!(round_half_up(-2.5), -2.);
    assert_eq!(round_half_up(2.4), 2.);
  }

  #[test]
  fn math_fns() {
    assert_eq!(MathFn::Sin.apply(180.), 0.);
    assert_eq!(MathFn::TenPow.apply(2.), 100.);
    assert_eq!(MathFn::Tan.apply(90.), f64::INFINITY);
  }
}
