use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use super::{FileChange, Hunk, Patch};
use crate::domain::ParseError;

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const ADD_HEADER: &str = "*** Add File:";
const UPDATE_HEADER: &str = "*** Update File:";
const DELETE_HEADER: &str = "*** Delete File:";
const SECTION_PREFIX: &str = "*** ";
const HUNK_PREFIX: &str = "@@";

/// Parse patch text into an ordered list of file changes.
pub fn parse(text: &str) -> Result<Patch, ParseError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut parser = Parser {
        lines: &lines,
        pos: 0,
    };
    let mut changes = Vec::new();
    let mut seen = HashSet::new();
    let mut blocks = 0usize;

    loop {
        parser.skip_blank();
        let Some(line) = parser.peek() else {
            break;
        };
        if line.trim_end() != BEGIN_MARKER {
            return Err(ParseError::new(
                parser.line_no(),
                format!("expected '{BEGIN_MARKER}', found '{line}'"),
            ));
        }
        parser.advance();
        blocks += 1;

        loop {
            parser.skip_blank();
            let Some(line) = parser.peek() else {
                return Err(ParseError::new(
                    lines.len(),
                    format!("missing '{END_MARKER}'"),
                ));
            };
            if line.trim_end() == END_MARKER {
                parser.advance();
                break;
            }

            let header_line = parser.line_no();
            let change = parser.section()?;
            if !seen.insert(normalize(change.path())) {
                return Err(ParseError::new(
                    header_line,
                    format!("'{}' is targeted by more than one section", change.path()),
                ));
            }
            changes.push(change);
        }
    }

    if blocks == 0 {
        return Err(ParseError::new(1, format!("missing '{BEGIN_MARKER}'")));
    }
    if changes.is_empty() {
        return Err(ParseError::new(1, "patch contains no file sections"));
    }

    Ok(Patch { changes })
}

struct Parser<'a> {
    lines: &'a [&'a str],
    pos: usize,
}

#[derive(Clone, Copy)]
enum HunkLine<'a> {
    Context(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

struct RawHunk<'a> {
    line_no: usize,
    hint: Option<String>,
    lines: Vec<HunkLine<'a>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn line_no(&self) -> usize {
        self.pos + 1
    }

    fn skip_blank(&mut self) {
        while self.peek().is_some_and(|line| line.trim().is_empty()) {
            self.advance();
        }
    }

    /// Consume lines up to the next `*** ` line.
    fn body(&mut self) -> Vec<(usize, &'a str)> {
        let mut body = Vec::new();
        while let Some(line) = self.peek() {
            if line.starts_with(SECTION_PREFIX) {
                break;
            }
            body.push((self.line_no(), line));
            self.advance();
        }
        body
    }

    fn section(&mut self) -> Result<FileChange, ParseError> {
        let line_no = self.line_no();
        let header = self.peek().unwrap_or_default().trim_end();
        self.advance();

        if let Some(rest) = header.strip_prefix(ADD_HEADER) {
            let path = header_path(line_no, rest)?;
            let body = self.body();
            let mut content = body
                .iter()
                .map(|(_, line)| *line)
                .collect::<Vec<_>>()
                .join("\n");
            if !body.is_empty() {
                content.push('\n');
            }
            Ok(FileChange::AddFile { path, content })
        } else if let Some(rest) = header.strip_prefix(DELETE_HEADER) {
            let path = header_path(line_no, rest)?;
            if let Some((line, _)) = self.body().into_iter().find(|(_, line)| !line.trim().is_empty()) {
                return Err(ParseError::new(
                    line,
                    format!("unexpected content in Delete File section for '{path}'"),
                ));
            }
            Ok(FileChange::DeleteFile { path })
        } else if let Some(rest) = header.strip_prefix(UPDATE_HEADER) {
            let path = header_path(line_no, rest)?;
            let hunks = parse_hunks(line_no, &path, self.body())?;
            Ok(FileChange::UpdateFile { path, hunks })
        } else {
            Err(ParseError::new(
                line_no,
                format!("unknown section '{header}'"),
            ))
        }
    }
}

fn header_path(line_no: usize, rest: &str) -> Result<String, ParseError> {
    let path = rest.trim();
    if path.is_empty() {
        return Err(ParseError::new(line_no, "section header is missing a path"));
    }
    Ok(path.to_string())
}

fn parse_hunks(
    header_line: usize,
    path: &str,
    mut body: Vec<(usize, &str)>,
) -> Result<Vec<Hunk>, ParseError> {
    while body.last().is_some_and(|(_, line)| line.is_empty()) {
        body.pop();
    }

    let mut raw_hunks: Vec<RawHunk<'_>> = Vec::new();
    for (line_no, line) in body {
        if let Some(rest) = line.strip_prefix(HUNK_PREFIX) {
            raw_hunks.push(RawHunk {
                line_no,
                hint: parse_hint(rest),
                lines: Vec::new(),
            });
            continue;
        }

        let parsed = match line.chars().next() {
            None => HunkLine::Context(""),
            Some(' ') => HunkLine::Context(&line[1..]),
            Some('-') => HunkLine::Removed(&line[1..]),
            Some('+') => HunkLine::Added(&line[1..]),
            Some(_) => {
                return Err(ParseError::new(
                    line_no,
                    format!("invalid hunk line '{line}': expected a ' ', '-' or '+' prefix"),
                ));
            }
        };

        match raw_hunks.last_mut() {
            Some(raw) => raw.lines.push(parsed),
            // Blank lines ahead of the first `@@` are separators, not context.
            None if line.is_empty() => {}
            None => raw_hunks.push(RawHunk {
                line_no,
                hint: None,
                lines: vec![parsed],
            }),
        }
    }

    if raw_hunks.is_empty() {
        return Err(ParseError::new(
            header_line,
            format!("Update File section for '{path}' has no hunks"),
        ));
    }

    let mut hunks = Vec::new();
    for raw in raw_hunks {
        hunks.extend(split_hunk(raw)?);
    }
    Ok(hunks)
}

/// Split a hunk body at context runs that separate groups of changes.
fn split_hunk(raw: RawHunk<'_>) -> Result<Vec<Hunk>, ParseError> {
    let mut hunks = Vec::new();
    let mut current = Hunk {
        hint: raw.hint,
        ..Hunk::default()
    };

    for line in raw.lines {
        let has_changes = !current.removed.is_empty() || !current.added.is_empty();
        match line {
            HunkLine::Context(text) if has_changes => current.context_after.push(text.to_string()),
            HunkLine::Context(text) => current.context_before.push(text.to_string()),
            HunkLine::Removed(text) | HunkLine::Added(text) => {
                if !current.context_after.is_empty() {
                    let shared = current.context_after.clone();
                    hunks.push(current);
                    current = Hunk {
                        context_before: shared,
                        ..Hunk::default()
                    };
                }
                if matches!(line, HunkLine::Removed(_)) {
                    current.removed.push(text.to_string());
                } else {
                    current.added.push(text.to_string());
                }
            }
        }
    }

    if current.removed.is_empty() && current.added.is_empty() {
        return Err(ParseError::new(raw.line_no, "hunk contains no changes"));
    }
    hunks.push(current);
    Ok(hunks)
}

/// `@@ fn main()` carries a hint; `@@ -1,3 +1,4 @@` only carries the text
/// after its closing `@@`.
fn parse_hint(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let hint = match rest.strip_prefix('-') {
        Some(range) => range.split_once(HUNK_PREFIX).map_or("", |(_, after)| after.trim()),
        None => rest,
    };
    if hint.is_empty() {
        None
    } else {
        Some(hint.to_string())
    }
}

/// Lexical form used to detect two sections aimed at the same file.
fn normalize(path: &str) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|line| line.to_string()).collect()
    }

    #[test]
    fn parse_add_file() {
        let patch = parse("*** Begin Patch\n*** Add File: a/b.txt\nhello\n*** End Patch")
            .expect("parse patch");

        assert_eq!(
            patch.changes,
            vec![FileChange::AddFile {
                path: "a/b.txt".to_string(),
                content: "hello\n".to_string(),
            }]
        );
    }

    #[test]
    fn parse_add_file_with_empty_body() {
        let patch = parse("*** Begin Patch\n*** Add File: empty.txt\n*** End Patch\n")
            .expect("parse patch");

        assert_eq!(
            patch.changes,
            vec![FileChange::AddFile {
                path: "empty.txt".to_string(),
                content: String::new(),
            }]
        );
    }

    #[test]
    fn parse_mixed_sections_in_order() {
        let text = "\n*** Begin Patch\n\
                    *** Update File: src/lib.rs\n\
                    @@ fn main()\n \
                    let x = 1;\n\
                    -let y = 2;\n\
                    +let y = 3;\n \
                    println!();\n\
                    *** Delete File: old.txt\n\
                    *** Add File: new.txt\n\
                    line one\n\
                    line two\n\
                    *** End Patch\n\n";

        let patch = parse(text).expect("parse patch");
        assert_eq!(patch.changes.len(), 3);
        assert_eq!(
            patch.changes[0],
            FileChange::UpdateFile {
                path: "src/lib.rs".to_string(),
                hunks: vec![Hunk {
                    hint: Some("fn main()".to_string()),
                    context_before: lines(&["let x = 1;"]),
                    removed: lines(&["let y = 2;"]),
                    added: lines(&["let y = 3;"]),
                    context_after: lines(&["println!();"]),
                }],
            }
        );
        assert_eq!(
            patch.changes[1],
            FileChange::DeleteFile {
                path: "old.txt".to_string()
            }
        );
        assert_eq!(
            patch.changes[2],
            FileChange::AddFile {
                path: "new.txt".to_string(),
                content: "line one\nline two\n".to_string(),
            }
        );
    }

    #[test]
    fn parse_splits_change_groups_sharing_context() {
        let text = "*** Begin Patch\n\
                    *** Update File: f.txt\n\
                    @@\n \
                    a\n\
                    -b\n\
                    +B\n \
                    c\n\
                    -d\n\
                    +D\n \
                    e\n\
                    *** End Patch";

        let patch = parse(text).expect("parse patch");
        let FileChange::UpdateFile { hunks, .. } = &patch.changes[0] else {
            panic!("expected update");
        };
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].context_before, lines(&["a"]));
        assert_eq!(hunks[0].context_after, lines(&["c"]));
        assert_eq!(hunks[1].context_before, lines(&["c"]));
        assert_eq!(hunks[1].removed, lines(&["d"]));
        assert_eq!(hunks[1].added, lines(&["D"]));
        assert_eq!(hunks[1].context_after, lines(&["e"]));
    }

    #[test]
    fn parse_implicit_first_hunk_and_empty_context_line() {
        let text = "*** Begin Patch\n\
                    *** Update File: f.txt\n \
                    first\n\
                    \n\
                    -second\n\
                    *** End Patch";

        let patch = parse(text).expect("parse patch");
        let FileChange::UpdateFile { hunks, .. } = &patch.changes[0] else {
            panic!("expected update");
        };
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].hint, None);
        assert_eq!(hunks[0].context_before, lines(&["first", ""]));
        assert_eq!(hunks[0].removed, lines(&["second"]));
    }

    #[test]
    fn parse_unified_range_is_not_a_hint() {
        assert_eq!(parse_hint(" -1,3 +1,4 @@"), None);
        assert_eq!(
            parse_hint(" -10,2 +10,3 @@ impl Foo"),
            Some("impl Foo".to_string())
        );
        assert_eq!(parse_hint("  class Bar  "), Some("class Bar".to_string()));
        assert_eq!(parse_hint(""), None);
    }

    #[test]
    fn parse_accepts_consecutive_blocks() {
        let text = "*** Begin Patch\n*** Add File: a.txt\na\n*** End Patch\n\
                    *** Begin Patch\n*** Delete File: b.txt\n*** End Patch\n";

        let patch = parse(text).expect("parse patch");
        assert_eq!(patch.changes.len(), 2);
    }

    #[test]
    fn parse_rejects_missing_end_marker() {
        let err = parse("*** Begin Patch\n*** Add File: a.txt\nhello\n").expect_err("missing end");
        assert!(err.message.contains("*** End Patch"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn parse_rejects_missing_begin_marker() {
        let err = parse("*** Add File: a.txt\nhello\n*** End Patch").expect_err("missing begin");
        assert_eq!(err.line, 1);

        let err = parse("   \n").expect_err("empty text");
        assert!(err.message.contains("*** Begin Patch"));
    }

    #[test]
    fn parse_rejects_unknown_verb() {
        let err = parse("*** Begin Patch\n*** Rename File: a.txt\n*** End Patch")
            .expect_err("unknown verb");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unknown section"));
    }

    #[test]
    fn parse_rejects_duplicate_paths() {
        let text = "*** Begin Patch\n\
                    *** Add File: a.txt\nx\n\
                    *** Delete File: ./a.txt\n\
                    *** End Patch";

        let err = parse(text).expect_err("duplicate path");
        assert_eq!(err.line, 4);
        assert!(err.message.contains("more than one section"));

        let text = "*** Begin Patch\n\
                    *** Add File: a.txt\nx\n\
                    *** Delete File: d/../a.txt\n\
                    *** End Patch";
        let err = parse(text).expect_err("duplicate through parent component");
        assert_eq!(err.line, 4);
    }

    #[test]
    fn parse_accepts_distinct_paths_sharing_a_name() {
        let patch = parse(
            "*** Begin Patch\n\
             *** Add File: a/x.txt\n1\n\
             *** Add File: b/x.txt\n2\n\
             *** End Patch",
        )
        .expect("distinct paths");
        assert_eq!(patch.changes.len(), 2);
    }

    #[test]
    fn parse_skips_blank_lines_between_sections() {
        let patch = parse("*** Begin Patch\n\n*** Add File: a\nx\n*** End Patch")
            .expect("blank line after begin");
        assert_eq!(
            patch.changes,
            vec![FileChange::AddFile {
                path: "a".to_string(),
                content: "x\n".to_string(),
            }]
        );

        let patch = parse("*** Begin Patch\n*** Delete File: a\n\n\n*** End Patch\n")
            .expect("blank line before end");
        assert_eq!(patch.changes.len(), 1);
    }

    #[test]
    fn parse_rejects_update_without_hunks() {
        let err = parse("*** Begin Patch\n*** Update File: a.txt\n\n*** End Patch")
            .expect_err("empty update");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("no hunks"));
    }

    #[test]
    fn parse_rejects_hunk_without_changes() {
        let err = parse("*** Begin Patch\n*** Update File: a.txt\n@@\n same\n*** End Patch")
            .expect_err("no-op hunk");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn parse_rejects_invalid_hunk_line() {
        let err = parse("*** Begin Patch\n*** Update File: a.txt\n@@\n-old\nnew\n*** End Patch")
            .expect_err("invalid line");
        assert_eq!(err.line, 5);
        assert!(err.message.contains("invalid hunk line"));
    }

    #[test]
    fn parse_rejects_delete_with_body() {
        let err = parse("*** Begin Patch\n*** Delete File: a.txt\nstray\n*** End Patch")
            .expect_err("delete body");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn parse_rejects_empty_path() {
        let err = parse("*** Begin Patch\n*** Add File:   \n*** End Patch").expect_err("empty path");
        assert!(err.message.contains("missing a path"));
    }

    #[test]
    fn parse_rejects_patch_without_sections() {
        let err = parse("*** Begin Patch\n*** End Patch").expect_err("no sections");
        assert!(err.message.contains("no file sections"));
    }

    #[test]
    fn parse_handles_crlf_text() {
        let patch = parse("*** Begin Patch\r\n*** Add File: a.txt\r\nhi\r\n*** End Patch\r\n")
            .expect("parse patch");
        assert_eq!(
            patch.changes,
            vec![FileChange::AddFile {
                path: "a.txt".to_string(),
                content: "hi\n".to_string(),
            }]
        );
    }
}
