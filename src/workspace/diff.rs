//! Line-based unified diffs.
//!
//! `unified` renders the difference between two texts the way `diff -u`
//! does (three lines of context); `apply` applies such a diff back onto a
//! text. Hunks are matched at their stated position first and then searched
//! for forward from the end of the previous hunk, so patches written by a
//! model with slightly wrong line numbers still apply.

use std::sync::LazyLock;

use regex::Regex;

const CONTEXT: usize = 3;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The patch text is malformed
    Parse(String),
    /// A hunk's context or removed lines were not found in the target
    Mismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Keep,
    Remove,
    Add,
}

/// Render a unified diff between `old` and `new`. Returns an empty string
/// when the texts are identical.
pub fn unified(old: &str, new: &str, path: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let script = edit_script(&a, &b);
    if script.iter().all(|(edit, _)| *edit == Edit::Keep) {
        return String::new();
    }

    // Position of each script entry in the old and new texts.
    let mut positions = Vec::with_capacity(script.len());
    let (mut i, mut j) = (0usize, 0usize);
    for (edit, _) in &script {
        positions.push((i, j));
        match edit {
            Edit::Keep => {
                i += 1;
                j += 1;
            }
            Edit::Remove => i += 1,
            Edit::Add => j += 1,
        }
    }

    let mut out = format!("--- original/{path}\n+++ new/{path}\n");
    let changes: Vec<usize> = script
        .iter()
        .enumerate()
        .filter(|(_, (edit, _))| *edit != Edit::Keep)
        .map(|(idx, _)| idx)
        .collect();

    let mut c = 0;
    while c < changes.len() {
        let start = changes[c].saturating_sub(CONTEXT);
        let mut last = changes[c];
        while c + 1 < changes.len() && changes[c + 1] - last <= 2 * CONTEXT {
            c += 1;
            last = changes[c];
        }
        let end = (last + CONTEXT + 1).min(script.len());

        let hunk = &script[start..end];
        let old_count = hunk.iter().filter(|(e, _)| *e != Edit::Add).count();
        let new_count = hunk.iter().filter(|(e, _)| *e != Edit::Remove).count();
        let (old_pos, new_pos) = positions[start];
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            display_start(old_pos, old_count),
            old_count,
            display_start(new_pos, new_count),
            new_count
        ));
        for (edit, line) in hunk {
            let marker = match edit {
                Edit::Keep => ' ',
                Edit::Remove => '-',
                Edit::Add => '+',
            };
            out.push(marker);
            out.push_str(line);
            out.push('\n');
        }
        c += 1;
    }
    out
}

fn display_start(pos: usize, count: usize) -> usize {
    if count == 0 { pos } else { pos + 1 }
}

/// Shortest edit script via longest common subsequence.
fn edit_script<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<(Edit, &'a str)> {
    let (n, m) = (a.len(), b.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut script = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            script.push((Edit::Keep, a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            script.push((Edit::Remove, a[i]));
            i += 1;
        } else {
            script.push((Edit::Add, b[j]));
            j += 1;
        }
    }
    script.extend(a[i..].iter().map(|l| (Edit::Remove, *l)));
    script.extend(b[j..].iter().map(|l| (Edit::Add, *l)));
    script
}

#[derive(Debug)]
struct Hunk {
    old_start: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse(patch: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks = Vec::new();
    let mut lines = patch.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(caps) = HUNK_HEADER.captures(line) else {
            continue;
        };
        let number = |idx: usize, default: usize| -> Result<usize, PatchError> {
            caps.get(idx)
                .map(|m| {
                    m.as_str()
                        .parse::<usize>()
                        .map_err(|_| PatchError::Parse(format!("bad hunk header: {line}")))
                })
                .unwrap_or(Ok(default))
        };
        let old_start = number(1, 0)?;
        let old_count = number(2, 1)?;
        let new_count = number(4, 1)?;

        let mut hunk = Hunk {
            old_start,
            old_lines: Vec::new(),
            new_lines: Vec::new(),
        };
        while hunk.old_lines.len() < old_count || hunk.new_lines.len() < new_count {
            let Some(body) = lines.peek() else { break };
            if body.starts_with("@@") {
                break;
            }
            let body = lines.next().unwrap_or_default();
            match body.chars().next() {
                Some(' ') => {
                    hunk.old_lines.push(body[1..].to_string());
                    hunk.new_lines.push(body[1..].to_string());
                }
                Some('-') => hunk.old_lines.push(body[1..].to_string()),
                Some('+') => hunk.new_lines.push(body[1..].to_string()),
                Some('\\') => {}
                // Some generators drop the space on blank context lines.
                None => {
                    hunk.old_lines.push(String::new());
                    hunk.new_lines.push(String::new());
                }
                Some(_) => {
                    return Err(PatchError::Parse(format!("unexpected line in hunk: {body}")));
                }
            }
        }
        if hunk.old_lines.len() != old_count || hunk.new_lines.len() != new_count {
            return Err(PatchError::Parse(format!(
                "hunk at line {old_start} is truncated"
            )));
        }
        hunks.push(hunk);
    }

    if hunks.is_empty() {
        return Err(PatchError::Parse("no hunks found".into()));
    }
    Ok(hunks)
}

/// Apply a unified diff to `original`. A trailing newline on the original
/// text is preserved.
pub fn apply(original: &str, patch: &str) -> Result<String, PatchError> {
    let hunks = parse(patch)?;
    let source: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::with_capacity(source.len());
    let mut cursor = 0usize;

    for hunk in &hunks {
        let stated = if hunk.old_lines.is_empty() {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let matches_at = |pos: usize| {
            pos + hunk.old_lines.len() <= source.len()
                && hunk
                    .old_lines
                    .iter()
                    .zip(&source[pos..])
                    .all(|(want, have)| want == have)
        };

        let pos = if stated >= cursor && matches_at(stated) {
            stated
        } else {
            (cursor..=source.len())
                .find(|&p| matches_at(p))
                .ok_or_else(|| {
                    PatchError::Mismatch(format!(
                        "hunk starting at line {} does not match the file",
                        hunk.old_start
                    ))
                })?
        };

        output.extend(source[cursor..pos].iter().map(|l| l.to_string()));
        output.extend(hunk.new_lines.iter().cloned());
        cursor = pos + hunk.old_lines.len();
    }
    output.extend(source[cursor..].iter().map(|l| l.to_string()));

    let mut text = output.join("\n");
    if !output.is_empty() && (original.ends_with('\n') || original.is_empty()) {
        text.push('\n');
    }
    Ok(text)
}
