// Child process output (zfs send -v progress, ssh banners, sudo prompts) goes
// straight into the session log and the mailed report, so it is reduced to
// single printable lines first.

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    Csi,
    // OSC/DCS style strings end with BEL or ESC '\'.
    Str,
    StrEsc,
}

pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut state = Escape::None;
    let mut kept = 0usize;

    for c in input.chars() {
        state = match state {
            Escape::Start => match c {
                '[' => Escape::Csi,
                ']' | 'P' | 'X' | '^' | '_' => Escape::Str,
                _ => Escape::None,
            },
            Escape::Csi if ('@'..='~').contains(&c) => Escape::None,
            Escape::Csi => Escape::Csi,
            Escape::Str if c == '\x07' => Escape::None,
            Escape::Str if c == '\x1b' => Escape::StrEsc,
            Escape::Str => Escape::Str,
            Escape::StrEsc if c == '\\' => Escape::None,
            Escape::StrEsc => Escape::Str,
            Escape::None => {
                if c == '\x1b' {
                    Escape::Start
                } else {
                    if c == '\t' {
                        out.push(' ');
                        kept += 1;
                    } else if !c.is_control() && !is_bidi_control(c) {
                        out.push(c);
                        kept += 1;
                    }
                    Escape::None
                }
            }
        };

        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }

    out.trim_end().to_string()
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
