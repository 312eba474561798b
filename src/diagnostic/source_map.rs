/// Byte offset to line/column lookup over one source text.
pub struct SourceMap<'src> {
    source: &'src str,
    line_starts: Vec<usize>,
}

impl<'src> SourceMap<'src> {
    pub fn new(source: &'src str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.bytes().enumerate().filter(|&(_, b)| b == b'\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { source, line_starts }
    }

    /// Returns (line, col), both 1-based. Columns count bytes.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        (line + 1, offset.saturating_sub(self.line_starts[line]) + 1)
    }

    /// Text of a 1-based line without its line terminator.
    pub fn line_text(&self, line: usize) -> &'src str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self.line_starts.get(line).copied().unwrap_or(self.source.len());
        self.source.get(start..end).unwrap_or("").trim_end_matches(['\n', '\r'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_on_one_line() {
        let map = SourceMap::new("local x = 1");
        assert_eq!(map.lookup(0), (1, 1));
        assert_eq!(map.lookup(6), (1, 7));
        assert_eq!(map.lookup(11), (1, 12));
    }

    #[test]
    fn lookup_across_lines() {
        let map = SourceMap::new("x = 1\nwhile x do\nend");
        assert_eq!(map.lookup(5), (1, 6)); // the newline belongs to line 1
        assert_eq!(map.lookup(6), (2, 1));
        assert_eq!(map.lookup(17), (3, 1));
    }

    #[test]
    fn line_text_strips_terminators() {
        let map = SourceMap::new("first\r\nsecond\nthird\n");
        assert_eq!(map.line_text(1), "first");
        assert_eq!(map.line_text(2), "second");
        assert_eq!(map.line_text(3), "third");
        assert_eq!(map.line_text(4), "");
        assert_eq!(map.line_text(0), "");
        assert_eq!(map.line_text(99), "");
    }

    #[test]
    fn empty_source() {
        let map = SourceMap::new("");
        assert_eq!(map.lookup(0), (1, 1));
        assert_eq!(map.line_text(1), "");
    }
}
