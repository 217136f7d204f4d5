//! Stateless capture rendering for non-interactive consumers (session
//! summaries, overview tooltips). This is deliberately not a terminal
//! emulator: it strips escape sequences and applies cheap carriage-return
//! rewrite semantics, nothing more.

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Keep escape sequences instead of stripping them.
    pub include_ansi: bool,
    /// Collapse the result into a single line, space-separated.
    pub join_lines: bool,
    /// First line index to include.
    pub start: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_ansi: false,
            join_lines: false,
            start: 0,
        }
    }
}

pub fn render(snapshot: &str, options: &RenderOptions) -> String {
    let text = if options.include_ansi {
        snapshot.to_string()
    } else {
        strip_ansi(snapshot)
    };

    let lines = text
        .replace("\r\n", "\n")
        .split('\n')
        .map(apply_carriage_returns)
        .collect::<Vec<_>>();

    let selected = lines.into_iter().skip(options.start);
    if options.join_lines {
        selected
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        selected.collect::<Vec<_>>().join("\n")
    }
}

/// A bare `\r` rewrites the line from column zero; keep what the final write
/// left visible.
fn apply_carriage_returns(line: &str) -> String {
    match line.rfind('\r') {
        Some(pos) => line[pos + 1..].to_string(),
        None => line.to_string(),
    }
}

/// Removes CSI/OSC escape sequences and non-printing control bytes, keeping
/// newlines and tabs.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    // CSI: parameter/intermediate bytes, then one final byte
                    // in 0x40..=0x7e.
                    for ch in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&ch) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // OSC: terminated by BEL or ESC \.
                    while let Some(ch) = chars.next() {
                        if ch == '\u{07}' {
                            break;
                        }
                        if ch == '\u{1b}' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if ch == '\n' || ch == '\r' || ch == '\t' || !ch.is_control() {
            out.push(ch);
        }
    }
    out
}
