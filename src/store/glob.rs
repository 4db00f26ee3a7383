/// Glob matching with `KEYS` semantics: `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes
pub fn glob_match(pattern: &str, text: &str) -> bool {
  let pattern: Vec<char> = pattern.chars().collect();
  let text: Vec<char> = text.chars().collect();
  match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
  let Some((&p, rest)) = pattern.split_first() else {
    return text.is_empty();
  };

  match p {
    '*' => {
      // Collapse consecutive stars
      let rest = skip_stars(rest);
      if rest.is_empty() {
        return true;
      }
      (0..=text.len()).any(|i| match_from(rest, &text[i..]))
    }
    '?' => !text.is_empty() && match_from(rest, &text[1..]),
    '[' => {
      let Some((&c, text_rest)) = text.split_first() else {
        return false;
      };
      match match_class(rest, c) {
        Some((true, after)) => match_from(after, text_rest),
        Some((false, _)) => false,
        // Unterminated class: treat '[' literally
        None => c == '[' && match_from(rest, text_rest),
      }
    }
    '\\' if !rest.is_empty() => {
      !text.is_empty() && text[0] == rest[0] && match_from(&rest[1..], &text[1..])
    }
    c => !text.is_empty() && text[0] == c && match_from(rest, &text[1..]),
  }
}

fn skip_stars(pattern: &[char]) -> &[char] {
  let n = pattern.iter().take_while(|&&c| c == '*').count();
  &pattern[n..]
}

/// Match `c` against the class body following `[`; returns the verdict and the pattern after `]`
fn match_class(body: &[char], c: char) -> Option<(bool, &[char])> {
  let (negate, mut i) = match body.first() {
    Some('^') => (true, 1),
    _ => (false, 0),
  };
  let mut matched = false;

  while i < body.len() {
    match body[i] {
      ']' => return Some((matched != negate, &body[i + 1..])),
      '\\' if i + 1 < body.len() => {
        matched |= body[i + 1] == c;
        i += 2;
      }
      lo if i + 2 < body.len() && body[i + 1] == '-' && body[i + 2] != ']' => {
        let hi = body[i + 2];
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        matched |= lo <= c && c <= hi;
        i += 3;
      }
      other => {
        matched |= other == c;
        i += 1;
      }
    }
  }

  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_match() {
    assert!(glob_match("*", "anything"));
    assert!(glob_match("foo*", "foobar"));
    assert!(glob_match("*bar", "foobar"));
    assert!(glob_match("foo*bar", "fooXXXbar"));
    assert!(glob_match("f?o", "foo"));
    assert!(!glob_match("f?o", "fooo"));
    assert!(glob_match("user:*", "user:123"));
    assert!(!glob_match("user:*", "order:123"));
  }

  #[test]
  fn test_glob_classes_and_escapes() {
    assert!(glob_match("h[ae]llo", "hello"));
    assert!(glob_match("h[ae]llo", "hallo"));
    assert!(!glob_match("h[ae]llo", "hillo"));
    assert!(glob_match("h[^e]llo", "hallo"));
    assert!(!glob_match("h[^e]llo", "hello"));
    assert!(glob_match("h[a-c]llo", "hbllo"));
    assert!(!glob_match("h[a-c]llo", "hdllo"));
    assert!(glob_match("price\\*", "price*"));
    assert!(!glob_match("price\\*", "prices"));
  }
}
