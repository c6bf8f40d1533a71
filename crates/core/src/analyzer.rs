use std::path::Path;

use crate::diff::{diff_hunks, DiffHunk};
use crate::evolution::types::{normalize_lf, ChangeType, SemanticChange};

/// Import-line prefixes by file extension. Lines starting with one of
/// these (after leading whitespace) are treated as import statements.
fn import_prefixes(extension: &str) -> &'static [&'static str] {
    match extension {
        "py" => &["import ", "from "],
        "js" | "jsx" | "ts" | "tsx" | "mjs" => &["import "],
        "rs" => &["use "],
        "go" | "java" | "kt" => &["import "],
        _ => &[],
    }
}

/// Start of a function, class, or binding definition across the
/// supported languages.
const DEFINITION_PATTERN: &str = r"^\s*(export\s+)?(pub(\(crate\))?\s+)?(async\s+)?(def|class|function|fn|func|const|let|var)\s+\w";

/// Regex-driven, language-agnostic classifier: turns a (before, after)
/// pair for one file into an ordered list of semantic changes. For equal
/// inputs the output is byte-identical across runs.
pub struct SemanticAnalyzer {
    definition_re: regex::Regex,
}

impl SemanticAnalyzer {
    pub fn new() -> Self {
        Self {
            definition_re: regex::Regex::new(DEFINITION_PATTERN)
                .expect("static definition pattern"),
        }
    }

    pub fn analyze(&self, path: &str, old_text: &str, new_text: &str) -> Vec<SemanticChange> {
        // Undecodable content has no usable anchors; a single opaque
        // change marks the file as not auto-mergeable.
        if old_text.contains('\0') || new_text.contains('\0') {
            return vec![SemanticChange::opaque()];
        }

        let old = normalize_lf(old_text);
        let new = normalize_lf(new_text);
        if old == new {
            return Vec::new();
        }

        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let prefixes = import_prefixes(&extension);

        let mut changes = Vec::new();
        for hunk in diff_hunks(&old, &new) {
            if hunk.is_pure_addition() {
                self.classify_addition(&hunk, prefixes, &mut changes);
            } else if hunk.is_pure_removal() {
                self.classify_removal(&hunk, prefixes, &mut changes);
            } else {
                changes.push(modify_region(&old, &hunk));
            }
        }
        changes
    }

    fn classify_addition(
        &self,
        hunk: &DiffHunk,
        prefixes: &[&str],
        out: &mut Vec<SemanticChange>,
    ) {
        let mut rest: Vec<&str> = Vec::new();
        for line in &hunk.added {
            if is_import_line(line, prefixes) {
                out.push(SemanticChange::added(ChangeType::AddImport, line.clone()));
            } else {
                rest.push(line);
            }
        }
        if rest.is_empty() {
            return;
        }

        let block = rest.join("\n");
        if self.definition_re.is_match(rest[0]) {
            out.push(SemanticChange::added(ChangeType::AddFunction, block));
        } else {
            // An insertion with no old-side anchor and no recognizable
            // shape; recorded so the merger can append it.
            out.push(SemanticChange::added(ChangeType::ModifyOther, block));
        }
    }

    fn classify_removal(
        &self,
        hunk: &DiffHunk,
        prefixes: &[&str],
        out: &mut Vec<SemanticChange>,
    ) {
        let mut rest: Vec<&str> = Vec::new();
        for line in &hunk.removed {
            if is_import_line(line, prefixes) {
                out.push(SemanticChange::removed(ChangeType::RemoveImport, line.clone()));
            } else {
                rest.push(line);
            }
        }
        if rest.is_empty() {
            return;
        }
        let block = rest.join("\n");
        let change_type = if self.definition_re.is_match(rest[0]) {
            ChangeType::RemoveFunction
        } else {
            ChangeType::RemoveOther
        };
        out.push(SemanticChange::removed(change_type, block));
    }
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_import_line(line: &str, prefixes: &[&str]) -> bool {
    let trimmed = line.trim_start();
    prefixes.iter().any(|p| trimmed.starts_with(p))
}

/// Build a `modify_region` change whose `content_before` is the smallest
/// contiguous string around the hunk that occurs exactly once in the old
/// text, so literal replacement during merge lands on the right region.
fn modify_region(old: &str, hunk: &DiffHunk) -> SemanticChange {
    let old_lines: Vec<&str> = old.lines().collect();
    let hunk_end = hunk.old_start + hunk.removed.len();

    let mut before_lines: Vec<String> = hunk.removed.clone();
    let mut after_lines: Vec<String> = hunk.added.clone();
    let mut lead = hunk.old_start;
    let mut trail = hunk_end;

    loop {
        let anchor = before_lines.join("\n");
        if !anchor.is_empty() && old.matches(&anchor).count() == 1 {
            break;
        }
        // Widen symmetrically with context from the old text; the same
        // context is prepended/appended to the replacement so the
        // substitution stays an identity outside the changed lines.
        let mut widened = false;
        if lead > 0 {
            lead -= 1;
            before_lines.insert(0, old_lines[lead].to_string());
            after_lines.insert(0, old_lines[lead].to_string());
            widened = true;
        }
        if trail < old_lines.len() {
            before_lines.push(old_lines[trail].to_string());
            after_lines.push(old_lines[trail].to_string());
            trail += 1;
            widened = true;
        }
        if !widened {
            break;
        }
    }

    SemanticChange::modified(before_lines.join("\n"), after_lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(path: &str, old: &str, new: &str) -> Vec<SemanticChange> {
        SemanticAnalyzer::new().analyze(path, old, new)
    }

    #[test]
    fn equal_inputs_yield_no_changes() {
        assert!(analyze("a.py", "x = 1\n", "x = 1\n").is_empty());
    }

    #[test]
    fn detects_python_import_addition() {
        let changes = analyze("a.py", "import a\nx = 1\n", "import a\nimport b\nx = 1\n");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::AddImport);
        assert_eq!(changes[0].content_after.as_deref(), Some("import b"));
    }

    #[test]
    fn detects_from_import() {
        let changes = analyze(
            "a.py",
            "x = 1\n",
            "from os import path\nx = 1\n",
        );
        assert_eq!(changes[0].change_type, ChangeType::AddImport);
    }

    #[test]
    fn ts_use_line_is_not_an_import() {
        // `use ` is an import only for Rust files.
        let changes = analyze("a.ts", "let x = 1\n", "use strict\nlet x = 1\n");
        assert!(changes
            .iter()
            .all(|c| c.change_type != ChangeType::AddImport));
    }

    #[test]
    fn detects_function_addition() {
        let changes = analyze(
            "a.py",
            "x = 1\n",
            "x = 1\ndef helper():\n    return 2\n",
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::AddFunction);
        assert!(changes[0]
            .content_after
            .as_deref()
            .unwrap()
            .starts_with("def helper()"));
    }

    #[test]
    fn modification_emits_region_with_both_sides() {
        let changes = analyze(
            "a.py",
            "def main():\n    return 1\n",
            "def main():\n    return 2\n",
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::ModifyRegion);
        assert_eq!(changes[0].content_before.as_deref(), Some("    return 1"));
        assert_eq!(changes[0].content_after.as_deref(), Some("    return 2"));
    }

    #[test]
    fn ambiguous_region_widens_until_unique() {
        // "    return 1" appears twice; the anchor must include enough
        // context to be unique in the old text.
        let old = "def a():\n    return 1\n\ndef b():\n    return 1\n";
        let new = "def a():\n    return 1\n\ndef b():\n    return 2\n";
        let changes = analyze("a.py", old, new);
        assert_eq!(changes.len(), 1);
        let anchor = changes[0].content_before.as_deref().unwrap();
        assert_eq!(old.matches(anchor).count(), 1);
        assert!(anchor.contains("def b()"));
    }

    #[test]
    fn removal_of_import_classified() {
        let changes = analyze("a.py", "import a\nimport b\nx = 1\n", "import a\nx = 1\n");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::RemoveImport);
        assert_eq!(changes[0].content_before.as_deref(), Some("import b"));
    }

    #[test]
    fn binary_content_is_opaque() {
        let changes = analyze("blob.bin", "a\0b", "c\0d");
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_opaque());
    }

    #[test]
    fn crlf_input_produces_lf_excerpts() {
        let changes = analyze(
            "a.py",
            "def main():\r\n    return 1\r\n",
            "def main():\r\n    return 2\r\n",
        );
        assert_eq!(changes[0].content_before.as_deref(), Some("    return 1"));
        assert!(!changes[0].content_before.as_deref().unwrap().contains('\r'));
    }

    #[test]
    fn output_is_deterministic() {
        let old = "import a\ndef f():\n    return 1\n";
        let new = "import a\nimport b\ndef f():\n    return 2\ndef g():\n    pass\n";
        let first = analyze("a.py", old, new);
        let second = analyze("a.py", old, new);
        assert_eq!(first, second);
    }
}
