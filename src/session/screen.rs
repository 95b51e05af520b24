//! GNU screen command builders and `screen -ls` parsing

/// One session reported by `screen -ls`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenListing {
    pub pid: Option<u32>,
    pub name: String,
    pub attached: bool,
}

/// Derive a multiplexer-safe session name from a session id
pub fn session_name(prefix: &str, id: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    if prefix.is_empty() {
        sanitize(id)
    } else {
        format!("{}-{}", sanitize(prefix), sanitize(id))
    }
}

pub fn version() -> Vec<String> {
    argv(&["screen", "-v"])
}

pub fn list() -> Vec<String> {
    argv(&["screen", "-ls"])
}

/// Start a detached session running `shell`
pub fn create(name: &str, shell: &str, scrollback: usize) -> Vec<String> {
    vec![
        "screen".to_string(),
        "-h".to_string(),
        scrollback.to_string(),
        "-dmS".to_string(),
        name.to_string(),
        shell.to_string(),
    ]
}

/// Attach, detaching any other client first
pub fn attach(name: &str) -> Vec<String> {
    argv(&["screen", "-D", "-r", name])
}

/// Inject input into window 0 of a session
pub fn stuff(name: &str, input: &str) -> Vec<String> {
    argv(&["screen", "-S", name, "-p", "0", "-X", "stuff", &escape_stuff(input)])
}

pub fn quit(name: &str) -> Vec<String> {
    argv(&["screen", "-S", name, "-X", "quit"])
}

pub fn hardcopy(name: &str, path: &str) -> Vec<String> {
    argv(&["screen", "-S", name, "-p", "0", "-X", "hardcopy", "-h", path])
}

pub fn resize(name: &str, cols: u16, rows: u16) -> [Vec<String>; 2] {
    [
        argv(&["screen", "-S", name, "-X", "width", "-w", &cols.to_string()]),
        argv(&["screen", "-S", name, "-X", "height", "-w", &rows.to_string()]),
    ]
}

/// `stuff` treats `\` and `^` as escapes
pub fn escape_stuff(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '\\' || c == '^' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Parse `screen -ls` output.
///
/// Lines look like `\t12345.cs-abc\t(10/19/26 10:00:00)\t(Detached)`. The exit
/// status of `screen -ls` is not meaningful, only the text is.
pub fn parse_list(output: &str) -> Vec<ScreenListing> {
    output
        .lines()
        .filter_map(|line| {
            if !line.starts_with('\t') && !line.starts_with(' ') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let id = fields.next()?;
            let (pid, name) = match id.split_once('.') {
                Some((pid, name)) => (pid.parse::<u32>().ok(), name),
                None => (None, id),
            };
            if name.is_empty() {
                return None;
            }
            let lower = line.to_ascii_lowercase();
            let attached = lower.contains("attached)") && !lower.contains("(detached)");
            Some(ScreenListing {
                pid,
                name: name.to_string(),
                attached,
            })
        })
        .collect()
}

/// Last `lines` lines of a hardcopy, without the trailing blank padding
pub fn tail_lines(content: &str, lines: usize) -> String {
    let all: Vec<&str> = content.trim_end_matches(['\n', '\r', ' ']).lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
