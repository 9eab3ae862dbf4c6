//! Shell command construction for remote execution.
//!
//! Every command sent to a sandbox is assembled here. Untrusted values
//! (repo names, branch names, paths, env payloads, secrets) only ever enter
//! a script through [`quote`], through [`Script::assign`], or as heredoc
//! bodies with a quoted delimiter. Verbatim fragments must be `&'static str`
//! so they cannot carry runtime data.

/// Marker substituted for secret values in captured output.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Single-quotes `value` for POSIX shells.
///
/// Embedded single quotes become `'\''`. Newlines and every other byte are
/// literal inside single quotes, so the result is safe for any input that
/// does not contain NUL.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Replaces every occurrence of `secret` in `text` with [`REDACTION_MARKER`].
///
/// Overlapping occurrences are covered as one run. If the marker could
/// recombine with neighbouring text into the secret, a marker built from a
/// character absent from the secret is used instead.
pub fn mask_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() || !text.contains(secret) {
        return text.to_string();
    }

    let masked = mask_runs(text, secret, REDACTION_MARKER);
    if !masked.contains(secret) {
        return masked;
    }

    match ['*', '#', '~', '%', '^']
        .into_iter()
        .find(|c| !secret.contains(*c))
    {
        Some(c) => mask_runs(text, secret, &c.to_string().repeat(8)),
        None => REDACTION_MARKER.to_string(),
    }
}

fn mask_runs(text: &str, secret: &str, marker: &str) -> String {
    let mut covered: Vec<(usize, usize)> = Vec::new();
    let mut from = 0;
    while let Some(pos) = text[from..].find(secret) {
        let start = from + pos;
        let end = start + secret.len();
        match covered.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => covered.push((start, end)),
        }
        // Step one char so overlapping matches are found.
        from = start
            + text[start..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
        if from >= text.len() {
            break;
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in covered {
        out.push_str(&text[cursor..start]);
        out.push_str(marker);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// A single command: a fixed program plus literal or quoted arguments.
#[derive(Debug, Clone)]
pub struct Cmd {
    parts: Vec<String>,
}

impl Cmd {
    /// Starts a command with a fixed program name.
    pub fn new(program: &'static str) -> Self {
        Self {
            parts: vec![program.to_string()],
        }
    }

    /// Appends a trusted literal (a flag, `--`, a `"$var"` reference).
    pub fn arg(mut self, literal: &'static str) -> Self {
        self.parts.push(literal.to_string());
        self
    }

    /// Appends an untrusted value, quoted.
    pub fn value(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(quote(value.as_ref()));
        self
    }

    /// Appends `--flag=<quoted value>`.
    pub fn option(mut self, flag: &'static str, value: impl AsRef<str>) -> Self {
        self.parts.push(format!("{}={}", flag, quote(value.as_ref())));
        self
    }

    /// Renders the command as one shell line.
    pub fn render(&self) -> String {
        self.parts.join(" ")
    }
}

/// A multi-line shell script assembled from safe parts.
#[derive(Debug, Clone, Default)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a script that aborts on the first failing command.
    pub fn strict() -> Self {
        Self::new().raw("set -eu")
    }

    /// Appends a fixed line verbatim.
    pub fn raw(mut self, line: &'static str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    /// Appends a rendered command.
    pub fn cmd(mut self, cmd: Cmd) -> Self {
        self.lines.push(cmd.render());
        self
    }

    /// Binds a shell variable to an untrusted value.
    ///
    /// Later fixed lines refer to it as `"$name"`.
    pub fn assign(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        self.lines.push(format!("{}={}", name, quote(value.as_ref())));
        self
    }

    /// Writes `content` to `path` byte for byte using a quoted heredoc.
    ///
    /// The body is never expanded by the shell.
    pub fn write_file(mut self, path: &str, content: &str) -> Self {
        self.lines.push(heredoc_write(path, content));
        self
    }

    /// Appends another script's lines.
    pub fn extend(mut self, other: Script) -> Self {
        self.lines.extend(other.lines);
        self
    }

    /// Renders the script as newline-separated text.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Builds a heredoc command that writes `content` to `path` exactly.
///
/// The delimiter is a random token checked against every content line.
/// Content without a trailing newline is cut to its byte length with
/// `head -c` so the heredoc's own newline does not leak into the file.
pub fn heredoc_write(path: &str, content: &str) -> String {
    let delimiter = loop {
        let candidate = format!("DEVBOX_EOF_{}", uuid::Uuid::new_v4().simple());
        if !content.lines().any(|l| l == candidate) {
            break candidate;
        }
    };

    let sink = if content.is_empty() || content.ends_with('\n') {
        format!("cat > {}", quote(path))
    } else {
        format!("head -c {} > {}", content.len(), quote(path))
    };

    let mut body = content.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    if content.is_empty() {
        body.clear();
    }

    format!("{} <<'{}'\n{}{}", sink, delimiter, body, delimiter)
}
