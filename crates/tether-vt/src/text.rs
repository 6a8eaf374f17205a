use vte::{Parser, Perform};

/// Collects printable characters and line structure, dropping every
/// control and escape sequence.
#[derive(Default)]
struct PlainText {
    out: String,
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.out.push('\n'),
            b'\t' => self.out.push('\t'),
            _ => {}
        }
    }
}

/// Strip SGR, cursor movement, OSC and every other escape sequence from
/// captured pane content, keeping only the visible text and newlines.
pub fn strip_escapes(content: &str) -> String {
    let mut parser: Parser = Parser::new();
    let mut text = PlainText::default();
    parser.advance(&mut text, content.as_bytes());
    text.out
}

/// Returns the last line that contains anything besides whitespace.
pub fn last_non_blank_line(text: &str) -> Option<&str> {
    text.lines().rev().find(|line| !line.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sgr_and_cursor_sequences() {
        let raw = "\x1b[1;32mready\x1b[0m\r\n\x1b[2K\x1b[10;4Hdone";
        assert_eq!(strip_escapes(raw), "ready\ndone");
    }

    #[test]
    fn test_strip_osc_title() {
        let raw = "\x1b]0;claude\x07hello";
        assert_eq!(strip_escapes(raw), "hello");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip_escapes("a\tb\nc"), "a\tb\nc");
    }

    #[test]
    fn test_last_non_blank_line() {
        assert_eq!(last_non_blank_line("one\ntwo\n   \n\n"), Some("two"));
        assert_eq!(last_non_blank_line("  \n"), None);
        assert_eq!(last_non_blank_line(""), None);
    }
}
