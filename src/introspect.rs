//! Source code introspection.
//!
//! Locates the definition of a named function in a Rust source file so that an endpoint can
//! return the code of the operation behind it.

/// Return the definition of function `name` in `source`, including its doc comments and
/// attributes.
///
/// Returns `None` unless exactly one definition matches.
pub fn extract_function<'a>(source: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("fn {}", name);
    let bytes = source.as_bytes();
    let mut matches = source
        .match_indices(&needle)
        .map(|(index, _)| index)
        .filter(|&index| index == 0 || !is_ident_byte(bytes[index - 1]))
        .filter(|&index| matches!(bytes.get(index + needle.len()), Some(b'(') | Some(b'<')));
    let at = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    let start = item_start(source, line_start(source, at));
    let end = body_end(source, at)?;
    Some(&source[start..end])
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn line_start(source: &str, index: usize) -> usize {
    source[..index].rfind('\n').map_or(0, |newline| newline + 1)
}

/// Extend `start` upwards over doc comments and attributes.
fn item_start(source: &str, mut start: usize) -> usize {
    while start > 0 {
        let previous = line_start(source, start - 1);
        let line = source[previous..start].trim();
        if line.starts_with("///") || line.starts_with("#[") {
            start = previous;
        } else {
            break;
        }
    }
    start
}

/// Index just past the closing brace of the function body starting after `from`.
///
/// String and character literals and comments are skipped.
fn body_end(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            // Declaration without a body
            b';' if depth == 0 => return None,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = source[i..].find('\n').map_or(bytes.len(), |newline| i + newline);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map(|close| i + 2 + close + 2)?;
                continue;
            }
            b'"' => {
                i = skip_string(bytes, i)?;
                continue;
            }
            b'\'' => {
                i = skip_char(bytes, i);
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index just past the string literal opening at `open`.
fn skip_string(bytes: &[u8], open: usize) -> Option<usize> {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Index just past a character literal at `open`, or just past `open` for a lifetime.
fn skip_char(bytes: &[u8], open: usize) -> usize {
    match (bytes.get(open + 1), bytes.get(open + 2), bytes.get(open + 3)) {
        (Some(b'\\'), _, _) => bytes[open + 2..]
            .iter()
            .position(|&b| b == b'\'')
            .map_or(bytes.len(), |close| open + 2 + close + 1),
        (Some(_), Some(b'\''), _) => open + 3,
        _ => open + 1,
    }
}
