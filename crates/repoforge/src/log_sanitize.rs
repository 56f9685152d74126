/// Subprocess output is echoed to the operator's terminal verbatim, so
/// escape sequences injected by a build script or package hook must not
/// reach it. Chunks are sanitized, not lines: newlines survive.
pub fn sanitize_chunk(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut esc: Option<Esc> = None;

    for c in input.chars() {
        if let Some(mode) = esc {
            esc = match mode {
                Esc::Start => match c {
                    '[' => Some(Esc::Csi),
                    ']' => Some(Esc::Osc),
                    _ => None,
                },
                Esc::Csi => {
                    if ('@'..='~').contains(&c) {
                        None
                    } else {
                        Some(Esc::Csi)
                    }
                }
                Esc::Osc => {
                    if c == '\x07' || c == '\x1b' {
                        None
                    } else {
                        Some(Esc::Osc)
                    }
                }
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Esc::Start),
            '\n' => out.push('\n'),
            '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

#[derive(Clone, Copy)]
enum Esc {
    Start,
    Csi,
    Osc,
}
