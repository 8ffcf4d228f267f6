use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source directories owned by this crate. Nothing else in the checkout is scanned.
const SOURCE_DIRS: &[&str] = &["serve", "model", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &[&str] = &[
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

// One hygiene rule: a line regex plus a filter deciding whether a match is a real violation.
struct Rule {
    title: &'static str,
    pattern: String,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the violating lines of a single file.
struct LineCollector {
    is_violation: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let rules = [
        Rule {
            title: "underscore-prefixed variables",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            is_violation: underscore_binding_in_code,
            advice: "Either use the variable (removing the underscore) or remove it completely.",
        },
        Rule {
            title: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            is_violation: |line| {
                comment_text(line).is_some_and(|text| FORBIDDEN_WORDS.iter().any(|w| text.contains(w)))
            },
            advice: "Comments must describe the code as it is, not its edit history.",
        },
        Rule {
            title: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            is_violation: |line| {
                !is_doc_comment(line)
                    && comment_start(line).is_some_and(|start| line[start + 2..].contains("**"))
            },
            advice: "Emphasis markers are only allowed in doc comments.",
        },
        Rule {
            title: "all-uppercase comments",
            pattern: r"(//|/\*).*".to_string(),
            is_violation: all_uppercase_comment,
            advice: "Write comments in sentence case.",
        },
        Rule {
            title: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            is_violation: |_| true,
            advice: "Either use the item or remove it completely.",
        },
    ];

    for rule in &rules {
        if let Err(e) = apply_rule(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn apply_rule(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in source_files() {
        let mut collector = LineCollector {
            is_violation: rule.is_violation,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, &path, &mut collector)?;

        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} {} in {}:\n",
                collector.violations.len(),
                rule.title,
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.advice));
            return Err(message.into());
        }
    }
    Ok(())
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Byte offset of the first comment marker that is not inside a string literal.
fn comment_start(line: &str) -> Option<usize> {
    let mut in_string = false;
    let mut previous = ' ';
    for (index, c) in line.char_indices() {
        match c {
            '"' if previous != '\\' => in_string = !in_string,
            '/' if !in_string && line[index + 1..].starts_with(['/', '*']) => return Some(index),
            _ => {}
        }
        previous = c;
    }
    None
}

fn comment_text(line: &str) -> Option<&str> {
    comment_start(line).map(|start| line[start + 2..].trim_start_matches(['/', '!', '*']).trim())
}

fn underscore_binding_in_code(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    // Underscores inside string literals are data, not bindings.
    let code: String = line
        .split('"')
        .step_by(2)
        .collect::<Vec<_>>()
        .join(" ");
    code.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| word.len() > 1 && word.starts_with('_'))
}

fn all_uppercase_comment(line: &str) -> bool {
    let Some(text) = comment_text(line) else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}
