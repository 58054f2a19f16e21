//! Indentation-aware text builder shared by the generators.

const INDENT: &str = "    ";

#[derive(Debug, Default)]
pub struct CodeWriter {
    buf: String,
    depth: usize,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard banner for generated files.
    pub fn banner(&mut self, prefix: &str, lines: &[&str]) {
        for line in lines {
            self.line(&format!("{prefix} {line}"));
        }
        self.blank();
    }

    pub fn line(&mut self, text: &str) {
        if text.is_empty() {
            self.buf.push('\n');
            return;
        }
        for _ in 0..self.depth {
            self.buf.push_str(INDENT);
        }
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    pub fn blank(&mut self) {
        self.buf.push('\n');
    }

    /// Write `head`, then `{` on its own line, and indent.
    pub fn open(&mut self, head: &str) {
        self.line(head);
        self.line("{");
        self.depth += 1;
    }

    pub fn close(&mut self) {
        self.close_with("");
    }

    /// Dedent and write `}` followed by `suffix` (e.g. `;`).
    pub fn close_with(&mut self, suffix: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(&format!("}}{suffix}"));
    }

    /// Append text produced by another writer at the current depth.
    pub fn append(&mut self, other: &CodeWriter) {
        for line in other.buf.lines() {
            self.line(line);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> String {
        self.buf
    }
}
