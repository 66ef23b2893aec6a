/// Key-name handling shared by the compiler (hat registration, `key []
/// pressed?`) and the host event loop.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
  Any,
  Code(u8),
}

/// Converts the name of a key to its code.
pub fn key_code(name: &str) -> KeySpec {
  match name.to_lowercase().as_str() {
    "space" => KeySpec::Code(32),
    "left arrow" => KeySpec::Code(37),
    "up arrow" => KeySpec::Code(38),
    "right arrow" => KeySpec::Code(39),
    "down arrow" => KeySpec::Code(40),
    "enter" => KeySpec::Code(13),
    "any" => KeySpec::Any,
    _ => {
      let c = name
        .to_uppercase()
        .chars()
        .next()
        .map(|c| c as u32)
        .unwrap_or(0);
      KeySpec::Code(if c < 128 { c as u8 } else { 0 })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn named_keys() {
    assert_eq!(key_code("space"), KeySpec::Code(32));
    assert_eq!(key_code("Left Arrow"), KeySpec::Code(37));
    assert_eq!(key_code("any"), KeySpec::Any);
  }

  #[test]
  fn letter_keys_uppercase() {
    assert_eq!(key_code("a"), KeySpec::Code(65));
    assert_eq!(key_code("Z"), KeySpec::Code(90));
    assert_eq!(key_code("3"), KeySpec::Code(51));
  }
}
