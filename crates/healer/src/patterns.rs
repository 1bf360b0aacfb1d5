//! Error pattern detection and heuristics.
//!
//! Scans raw tool output (typechecker, test runner, runtime logs) for known
//! failure signatures and turns them into [`Heuristics`].

use regex::Regex;
use std::fmt::Write as _;
use std::sync::LazyLock;

use crate::types::{Heuristics, Scenario};

pub const TYPESCRIPT_ERROR: &str = "TypeScript compilation error";
pub const MISSING_MODULE_OR_NAME: &str = "Missing module or name";
pub const PROPERTY_ACCESS_ERROR: &str = "Property access error";
pub const TYPE_ASSIGNMENT_ERROR: &str = "Type assignment error";
pub const TEST_FAILURES: &str = "Test failures";
pub const ASSERTION_FAILURE: &str = "Assertion failure";
pub const IMPORT_RESOLUTION_ERROR: &str = "Import resolution error";
pub const EXPORT_NOT_FOUND: &str = "Export not found";
pub const RUNTIME_TYPE_ERROR: &str = "Runtime type error";
pub const REFERENCE_ERROR: &str = "Reference error";
pub const SYNTAX_ERROR: &str = "Syntax error";

/// Category label and the signatures that trigger it, in report order.
static ERROR_CATEGORIES: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    vec![
        (TYPESCRIPT_ERROR, vec![Regex::new(r"\berror TS\d+").unwrap()]),
        (
            MISSING_MODULE_OR_NAME,
            vec![Regex::new(r"(?i)cannot find (?:module|name)").unwrap()],
        ),
        (
            PROPERTY_ACCESS_ERROR,
            vec![Regex::new(r"does not exist on type").unwrap()],
        ),
        (
            TYPE_ASSIGNMENT_ERROR,
            vec![Regex::new(r"is not assignable to (?:type|parameter of type)").unwrap()],
        ),
        (
            TEST_FAILURES,
            vec![
                Regex::new(r"(?i)\btests?\b[^\n]*\bfail(?:ed|ing|ures?)?\b").unwrap(),
                Regex::new(r"(?i)\bfail(?:ed|ing|ures?)?\b[^\n]*\btests?\b").unwrap(),
                Regex::new(r"(?m)^\s*FAIL\s").unwrap(),
            ],
        ),
        (
            ASSERTION_FAILURE,
            vec![
                Regex::new(r"expect\([^\n]*\)[^\n]*\.(?:toBe|toEqual|toStrictEqual|toMatch|toContain)")
                    .unwrap(),
                Regex::new(r"AssertionError").unwrap(),
                Regex::new(r"(?i)assertion(?: `[^`\n]*`)? failed").unwrap(),
            ],
        ),
        (
            IMPORT_RESOLUTION_ERROR,
            vec![
                Regex::new(r"(?i)module not found").unwrap(),
                Regex::new(r"(?i)failed to resolve import").unwrap(),
                Regex::new(r"(?i)\bimport\b[^\n]*\bnot found\b").unwrap(),
                Regex::new(r"(?i)\bnot found\b[^\n]*\bimport\b").unwrap(),
            ],
        ),
        (
            EXPORT_NOT_FOUND,
            vec![
                Regex::new(r"has no exported member").unwrap(),
                Regex::new(r"(?i)does not provide an export named").unwrap(),
                Regex::new(r"(?i)export '[^'\n]+'[^\n]*was not found").unwrap(),
            ],
        ),
        (RUNTIME_TYPE_ERROR, vec![Regex::new(r"\bTypeError:").unwrap()]),
        (REFERENCE_ERROR, vec![Regex::new(r"\bReferenceError:").unwrap()]),
        (SYNTAX_ERROR, vec![Regex::new(r"\bSyntaxError:").unwrap()]),
    ]
});

/// Detect known error categories in raw output.
///
/// Checks are independent: several categories may fire for one input, but
/// each label appears at most once.
#[must_use]
pub fn detect_error_patterns(output: Option<&str>) -> Vec<String> {
    let Some(output) = output.filter(|o| !o.trim().is_empty()) else {
        return Vec::new();
    };

    ERROR_CATEGORIES
        .iter()
        .filter(|(_, signatures)| signatures.iter().any(|re| re.is_match(output)))
        .map(|(label, _)| (*label).to_string())
        .collect()
}

/// Build heuristics for a scenario from its failure output.
#[must_use]
pub fn build_heuristics(scenario: Scenario, output: Option<&str>, failure_count: u32) -> Heuristics {
    let error_patterns = detect_error_patterns(output);
    let has = |label: &str| error_patterns.iter().any(|p| p == label);

    Heuristics {
        scenario,
        failure_count,
        repeated: false,
        has_missing_imports: has(MISSING_MODULE_OR_NAME),
        has_type_errors: has(TYPESCRIPT_ERROR) || has(TYPE_ASSIGNMENT_ERROR),
        has_test_assertions: has(ASSERTION_FAILURE) || has(TEST_FAILURES),
        is_flaky: false,
        previous_attempts: 0,
        error_patterns,
    }
}

/// Render the guidance note written into task progress.
#[must_use]
pub fn render_guidance(heuristics: &Heuristics) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "## Healer guidance: {}", heuristics.scenario);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Failure count: {}", heuristics.failure_count);
    if heuristics.previous_attempts > 0 {
        let _ = writeln!(
            out,
            "- Earlier healer runs on this subtask: {}",
            heuristics.previous_attempts
        );
    }

    if heuristics.error_patterns.is_empty() {
        let _ = writeln!(out, "- No known error signatures detected in the output");
    } else {
        let _ = writeln!(
            out,
            "- Detected: {}",
            heuristics.error_patterns.join(", ")
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "### Next steps");

    if heuristics.has_missing_imports {
        let _ = writeln!(
            out,
            "- Check import paths and that referenced packages are installed"
        );
    }
    if heuristics.has_type_errors {
        let _ = writeln!(
            out,
            "- Run the typechecker and fix each reported error before new work"
        );
    }
    if heuristics.has_test_assertions {
        let _ = writeln!(
            out,
            "- Re-run the failing tests and compare expected against actual values"
        );
    }

    match heuristics.scenario {
        Scenario::InitScriptFailure => {
            let _ = writeln!(
                out,
                "- The init script failed outside typecheck/tests; check network, disk and permissions"
            );
        }
        Scenario::VerificationFailed | Scenario::RuntimeError => {
            let _ = writeln!(
                out,
                "- Uncommitted changes may have been rewound; start from the last commit"
            );
        }
        Scenario::SubtaskFailed | Scenario::StuckSubtask if heuristics.repeated => {
            let _ = writeln!(
                out,
                "- This subtask keeps failing; split it or change approach instead of retrying"
            );
        }
        _ => {}
    }

    if !heuristics.has_missing_imports
        && !heuristics.has_type_errors
        && !heuristics.has_test_assertions
    {
        let _ = writeln!(out, "- Read the full failure output before retrying");
    }

    out
}
