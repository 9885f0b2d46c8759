//! Minimal unified diffs and previews for permission prompts.

const CONTEXT_LINES: usize = 3;
const NEW_FILE_PREVIEW_LINES: usize = 15;
// Beyond this many changed lines per side the LCS table is not worth it;
// fall back to one whole-file replace hunk.
const MAX_LCS_LINES: usize = 1500;

/// A unified diff between two texts, labelled with `path` on both sides.
/// Returns an empty string when the texts are identical.
pub fn unified_diff(old: &str, new: &str, path: &str) -> String {
    if old == new {
        return String::new();
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let ops = diff_ops(&old_lines, &new_lines);
    let hunks = group_hunks(&ops, old_lines.len(), new_lines.len());
    if hunks.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str(&format!("--- {path}\n"));
    out.push_str(&format!("+++ {path}\n"));
    for hunk in hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk.old_start + 1,
            hunk.old_len,
            hunk.new_start + 1,
            hunk.new_len,
        ));
        for op in &ops[hunk.first_op..hunk.last_op] {
            match op {
                Op::Equal(i, _) => {
                    out.push(' ');
                    out.push_str(old_lines[*i]);
                }
                Op::Delete(i) => {
                    out.push('-');
                    out.push_str(old_lines[*i]);
                }
                Op::Insert(j) => {
                    out.push('+');
                    out.push_str(new_lines[*j]);
                }
            }
            out.push('\n');
        }
    }
    out
}

/// Preview for a brand-new file: a header plus the first few lines.
pub fn new_file_preview(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut parts = vec![format!("new file ({} lines)", lines.len())];
    for line in lines.iter().take(NEW_FILE_PREVIEW_LINES) {
        parts.push(format!("+{line}"));
    }
    if lines.len() > NEW_FILE_PREVIEW_LINES {
        parts.push(format!(
            "... ({} more lines)",
            lines.len() - NEW_FILE_PREVIEW_LINES
        ));
    }
    parts.join("\n")
}

/// Preview for a shell command: optional description, then `$ command`.
pub fn bash_preview(command: &str, description: &str) -> String {
    if description.trim().is_empty() {
        format!("$ {command}")
    } else {
        format!("{description}\n$ {command}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// (old index, new index)
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

fn diff_ops(old: &[&str], new: &[&str]) -> Vec<Op> {
    // Trim the common prefix and suffix before the quadratic part.
    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut ops = Vec::with_capacity(old.len() + new.len());
    for i in 0..prefix {
        ops.push(Op::Equal(i, i));
    }

    if old_mid.len() > MAX_LCS_LINES || new_mid.len() > MAX_LCS_LINES {
        for i in 0..old_mid.len() {
            ops.push(Op::Delete(prefix + i));
        }
        for j in 0..new_mid.len() {
            ops.push(Op::Insert(prefix + j));
        }
    } else {
        lcs_ops(old_mid, new_mid, prefix, &mut ops);
    }

    for k in 0..suffix {
        ops.push(Op::Equal(
            old.len() - suffix + k,
            new.len() - suffix + k,
        ));
    }
    ops
}

fn lcs_ops(old: &[&str], new: &[&str], offset: usize, ops: &mut Vec<Op>) {
    let n = old.len();
    let m = new.len();
    // lcs[i][j] = longest common subsequence of old[i..] and new[j..]
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(offset + i, offset + j));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            ops.push(Op::Delete(offset + i));
            i += 1;
        } else {
            ops.push(Op::Insert(offset + j));
            j += 1;
        }
    }
    while i < n {
        ops.push(Op::Delete(offset + i));
        i += 1;
    }
    while j < m {
        ops.push(Op::Insert(offset + j));
        j += 1;
    }
}

#[derive(Debug)]
struct Hunk {
    first_op: usize,
    last_op: usize,
    old_start: usize,
    old_len: usize,
    new_start: usize,
    new_len: usize,
}

fn group_hunks(ops: &[Op], _old_len: usize, _new_len: usize) -> Vec<Hunk> {
    // Indices of ops that are changes.
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_, _)))
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return Vec::new();
    }

    let mut hunks: Vec<(usize, usize)> = Vec::new();
    let mut start = changes[0].saturating_sub(CONTEXT_LINES);
    let mut end = (changes[0] + CONTEXT_LINES + 1).min(ops.len());
    for &c in &changes[1..] {
        let c_start = c.saturating_sub(CONTEXT_LINES);
        if c_start <= end {
            end = (c + CONTEXT_LINES + 1).min(ops.len());
        } else {
            hunks.push((start, end));
            start = c_start;
            end = (c + CONTEXT_LINES + 1).min(ops.len());
        }
    }
    hunks.push((start, end));

    hunks
        .into_iter()
        .map(|(first_op, last_op)| {
            let mut old_start = None;
            let mut new_start = None;
            let mut old_len = 0;
            let mut new_len = 0;
            for op in &ops[first_op..last_op] {
                match op {
                    Op::Equal(i, j) => {
                        old_start.get_or_insert(*i);
                        new_start.get_or_insert(*j);
                        old_len += 1;
                        new_len += 1;
                    }
                    Op::Delete(i) => {
                        old_start.get_or_insert(*i);
                        old_len += 1;
                    }
                    Op::Insert(j) => {
                        new_start.get_or_insert(*j);
                        new_len += 1;
                    }
                }
            }
            Hunk {
                first_op,
                last_op,
                old_start: old_start.unwrap_or(0),
                old_len,
                new_start: new_start.unwrap_or(0),
                new_len,
            }
        })
        .collect()
}
