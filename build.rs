use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the project's own Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["monitor", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: &str = "FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE";

// A lint rule: a line regex, a second-stage filter over matched lines and
// the message printed when a file violates it.
struct Rule {
    name: &'static str,
    pattern: String,
    keep: fn(&str) -> bool,
    advice: &'static str,
}

// Collects every line of one file that matches a rule.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    keep: fn(&str) -> bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, keep: fn(&str) -> bool) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            keep,
        }
    }

    fn check_and_get_error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.name,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", rule.advice));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if (self.keep)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

// Underscore-prefixed names in code, ignoring comments and string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn comment_is_all_uppercase(line: &str) -> bool {
    let trimmed = line.trim_start();
    let comment_text = if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        rest
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };

    let alpha_chars: Vec<char> = comment_text.chars().filter(|c| c.is_alphabetic()).collect();
    !alpha_chars.is_empty() && alpha_chars.iter().all(|c| c.is_uppercase())
}

fn any_line(line: &str) -> bool {
    !line.is_empty()
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "underscore-prefixed variables",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            keep: underscore_in_code,
            advice: "Underscore-prefixed variable names are not allowed in this project. \
                     Either use the variable (removing the underscore) or remove it completely.",
        },
        Rule {
            name: "forbidden comment patterns",
            pattern: format!(r"(//|/\*|///).*(?:{FORBIDDEN_WORDS})"),
            keep: any_line,
            advice: "Comments narrating edits to the code are STRICTLY FORBIDDEN in this project. \
                     Remove them completely rather than commenting them out.",
        },
        Rule {
            name: "'**' patterns in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            keep: stars_outside_doc_comment,
            advice: "The '**' pattern is not allowed in regular comments (but is allowed in doc comments).",
        },
        Rule {
            name: "comments with all uppercase alphabetic characters",
            pattern: r"(//|/\*|///).*".to_string(),
            keep: comment_is_all_uppercase,
            advice: "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN. \
                     Consider deleting the comment completely.",
        },
        Rule {
            name: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            keep: any_line,
            advice: "#[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project. \
                     Either use the code (removing the attribute) or remove it completely.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(rule: &Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in files {
        let mut collector = ViolationCollector::new(path, rule.keep);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message(rule) {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let files = source_files();
    for rule in rules() {
        // The error text is the only report cargo shows for a failing build script.
        if let Err(e) = scan(&rule, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
