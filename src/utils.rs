/// Escapes control and non-ASCII characters in client-supplied text so a
/// hostile peer cannot forge log lines or smuggle terminal sequences.
pub fn escape_for_log(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push(' '),
            '\x01'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii() => result.push(c),
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Shortens long client lines for logging, keeping the head.
pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... ({} bytes)", escape_for_log(&input[..cut]), input.len()),
        None => escape_for_log(input),
    }
}
