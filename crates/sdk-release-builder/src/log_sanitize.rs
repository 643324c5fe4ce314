const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Skip {
    None,
    /// Just saw ESC; the next char decides the sequence class.
    EscIntro,
    /// Inside a CSI sequence; ends at the first final byte.
    Csi,
    /// Inside an OSC or string sequence; ends at BEL or ESC-backslash.
    Stringy { esc_seen: bool },
}

/// Strip terminal escape sequences, control characters, and bidi override
/// characters from a line of subprocess output before it reaches the console
/// or a log file. Overlong lines are truncated with a marker.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut skip = Skip::None;
    let mut kept = 0usize;

    for c in input.chars() {
        match skip {
            Skip::EscIntro => {
                skip = match c {
                    '[' => Skip::Csi,
                    ']' | 'P' | 'X' | '^' | '_' => Skip::Stringy { esc_seen: false },
                    _ => Skip::None,
                };
                continue;
            }
            Skip::Csi => {
                if ('@'..='~').contains(&c) {
                    skip = Skip::None;
                }
                continue;
            }
            Skip::Stringy { esc_seen } => {
                if c == '\x07' || (esc_seen && c == '\\') {
                    skip = Skip::None;
                } else {
                    skip = Skip::Stringy { esc_seen: c == '\x1b' };
                }
                continue;
            }
            Skip::None => {}
        }

        match c {
            '\x1b' => skip = Skip::EscIntro,
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }

        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c,
        '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
