/// Escapes control characters so a raw protocol line can be logged without
/// letting a client smuggle newlines or terminal escapes into the log.
pub fn sanitize_log_line(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\r' | '\n' => {}
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}
