/// Longest sanitized title, in characters.
pub const MAX_TITLE_LEN: usize = 100;

/// Whitespace as far as titles go: Unicode `Zs`, the line and paragraph
/// separators, `\t` through `\r` and the BOM. Unlike [`char::is_whitespace`]
/// it excludes U+0085.
fn is_title_whitespace(c: char) -> bool {
    matches!(
        c,
        '\t' | '\n' | '\u{b}' | '\u{c}' | '\r' | ' ' | '\u{a0}' | '\u{1680}'
            | '\u{2000}'..='\u{200a}'
            | '\u{2028}' | '\u{2029}' | '\u{202f}' | '\u{205f}' | '\u{3000}' | '\u{feff}'
    )
}

/// Turns an arbitrary video title into a token that is safe inside a
/// `Content-Disposition` filename: only ASCII word characters and `-`
/// survive, whitespace runs become a single `-`.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len().min(MAX_TITLE_LEN));
    let mut in_whitespace = false;
    for c in title.chars() {
        if is_title_whitespace(c) {
            in_whitespace = true;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            continue;
        }
        if in_whitespace {
            out.push('-');
            in_whitespace = false;
        }
        out.push(c);
    }
    if in_whitespace {
        out.push('-');
    }
    // Everything left is ASCII, so byte length equals char count.
    out.truncate(MAX_TITLE_LEN);
    out
}
