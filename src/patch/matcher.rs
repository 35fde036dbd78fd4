/// Locates runs of lines inside a file buffer.
pub(crate) struct ContextMatcher<'a> {
    lines: &'a [String],
}

impl<'a> ContextMatcher<'a> {
    pub(crate) fn new(lines: &'a [String]) -> Self {
        Self { lines }
    }

    /// First index at or after `start` where `pattern` occurs, falling back to
    /// a search of the whole buffer. Exact matches win over matches that only
    /// agree after trimming trailing whitespace.
    pub(crate) fn seek(&self, pattern: &[String], start: usize) -> Option<usize> {
        if pattern.len() > self.lines.len() {
            return None;
        }
        let max_start = self.lines.len() - pattern.len();
        let start = start.min(max_start);

        let exact = |idx: usize| self.lines[idx..idx + pattern.len()] == *pattern;
        let loose = |idx: usize| {
            self.lines[idx..idx + pattern.len()]
                .iter()
                .zip(pattern)
                .all(|(line, expected)| line.trim_end() == expected.trim_end())
        };

        (start..=max_start)
            .find(|&idx| exact(idx))
            .or_else(|| (0..start).find(|&idx| exact(idx)))
            .or_else(|| (start..=max_start).find(|&idx| loose(idx)))
            .or_else(|| (0..start).find(|&idx| loose(idx)))
    }

    /// First line at or after `start` containing the location hint.
    pub(crate) fn seek_hint(&self, hint: &str, start: usize) -> Option<usize> {
        let hint = hint.trim();
        (start..self.lines.len()).find(|&idx| self.lines[idx].contains(hint))
    }
}
