use crate::scheduler::LineSource;
use ropey::Rope;
use std::borrow::Cow;

/// What an edit did to the line structure, in the shape the highlighter's
/// `on_edit` wants: the first changed line and how many line breaks the
/// edit removed and added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditNotice {
    pub first_line: usize,
    pub lines_removed: usize,
    pub lines_inserted: usize,
}

/// Minimal rope-backed text buffer standing in for the host editor's
/// buffer. The engine itself never touches it directly; it only sees the
/// [`LineSource`] view and the [`EditNotice`]s it hands out.
pub struct Buffer {
    rope: Rope,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer { rope: Rope::new() }
    }

    pub fn from_string(s: String) -> Self {
        // CRLF -> LF so line handling stays uniform
        let s = s.replace("\r\n", "\n");
        Buffer {
            rope: Rope::from_str(&s),
        }
    }

    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn len_lines(&self) -> usize {
        self.rope.len_lines()
    }

    /// Line content without the trailing newline.
    pub fn line(&self, index: usize) -> String {
        if index >= self.rope.len_lines() {
            return String::new();
        }
        let line = self.rope.line(index);
        let mut s = line.to_string();
        if s.ends_with('\n') {
            s.pop();
        }
        s
    }

    /// Insert text at a char position, reporting the line-level shape of
    /// the edit.
    pub fn insert(&mut self, char_pos: usize, text: &str) -> EditNotice {
        let char_pos = char_pos.min(self.rope.len_chars());
        let first_line = self.rope.char_to_line(char_pos);
        self.rope.insert(char_pos, text);
        EditNotice {
            first_line,
            lines_removed: 0,
            lines_inserted: text.matches('\n').count(),
        }
    }

    /// Delete a char range, reporting the line-level shape of the edit.
    pub fn delete(&mut self, start: usize, end: usize) -> EditNotice {
        let end = end.min(self.rope.len_chars());
        let start = start.min(end);
        let first_line = self.rope.char_to_line(start);
        let removed = self.rope.slice(start..end).to_string();
        self.rope.remove(start..end);
        EditNotice {
            first_line,
            lines_removed: removed.matches('\n').count(),
            lines_inserted: 0,
        }
    }

    pub fn to_string(&self) -> String {
        self.rope.to_string()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl LineSource for Buffer {
    fn len_lines(&self) -> usize {
        self.rope.len_lines()
    }

    fn line(&self, index: usize) -> Option<Cow<'_, str>> {
        if index >= self.rope.len_lines() {
            return None;
        }
        Some(Cow::Owned(Buffer::line(self, index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_have_no_trailing_newline() {
        let buf = Buffer::from_string("one\ntwo\n".to_string());
        assert_eq!(buf.line(0), "one");
        assert_eq!(buf.line(1), "two");
        // ropey counts the position after a trailing newline as a line
        assert_eq!(buf.len_lines(), 3);
    }

    #[test]
    fn crlf_is_normalized() {
        let buf = Buffer::from_string("a\r\nb".to_string());
        assert_eq!(buf.to_string(), "a\nb");
    }

    #[test]
    fn insert_reports_new_lines() {
        let mut buf = Buffer::from_string("ab\ncd".to_string());
        let notice = buf.insert(1, "x");
        assert_eq!(
            notice,
            EditNotice { first_line: 0, lines_removed: 0, lines_inserted: 0 }
        );
        let notice = buf.insert(2, "\n\n");
        assert_eq!(
            notice,
            EditNotice { first_line: 0, lines_removed: 0, lines_inserted: 2 }
        );
        assert_eq!(buf.to_string(), "ax\n\nb\ncd");
    }

    #[test]
    fn delete_reports_merged_lines() {
        let mut buf = Buffer::from_string("ab\ncd\nef".to_string());
        // delete "\ncd\n" starting at the newline after "ab"
        let notice = buf.delete(2, 6);
        assert_eq!(
            notice,
            EditNotice { first_line: 0, lines_removed: 2, lines_inserted: 0 }
        );
        assert_eq!(buf.to_string(), "abef");
    }
}
