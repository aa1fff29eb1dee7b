use crate::call::{Call, CallDecorator, CallError, CallInput};
use crate::issue::{Issue, Outcome};

pub const SEVERITY_NONE: &str = "None";
pub const SEVERITY_LOW: &str = "Low";
pub const SEVERITY_MEDIUM: &str = "Medium";
pub const SEVERITY_HIGH: &str = "High";

/// Field receiving the severity classification.
pub const SECURITY: &str = "security";

const ASAN_ERROR_TYPES: &[(&str, &str)] = &[
    ("attempting free on address which was not malloc()-ed", "invalid-free"),
    ("attempting double-free", "double-free"),
    ("double-free on ", "double-free"),
    ("FPE", "floating-point-exception"),
];

// More general descriptions come last so they do not shadow specific ones.
const UBSAN_ERROR_TYPES: &[(&str, &str)] = &[
    ("member access within", "bad-cast"),
    ("member call on", "bad-cast"),
    ("downcast of", "bad-cast"),
    ("control flow integrity check", "bad-cast"),
    ("control flow integrity violation", "bad-cast"),
    ("division by zero", "divide-by-zero"),
    ("outside the range of representable values", "float-cast-overflow"),
    ("through pointer to incorrect function type", "incorrect-function-pointer-type"),
    ("out of bounds for type", "index-out-of-bounds"),
    ("not a valid value for type bool", "invalid-bool-value"),
    ("which is not a valid argument", "invalid-builtin-use"),
    ("misaligned address", "misaligned-address"),
    ("reached the end of a value-returning function", "no-return-value"),
    ("which is declared to never be null", "invalid-null-argument"),
    ("load of null pointer", "null-dereference READ"),
    ("binding to null pointer", "null-dereference"),
    ("access within null pointer", "null-dereference"),
    ("call on null pointer", "null-dereference"),
    ("store to null pointer", "null-dereference WRITE"),
    ("with insufficient space for an object of type", "object-size"),
    ("addition of unsigned offset", "pointer-overflow"),
    ("subtraction of unsigned offset", "pointer-overflow"),
    ("pointer index expression with base ", "pointer-overflow"),
    ("applying non-zero offset", "pointer-overflow"),
    ("applying zero offset to null pointer", "pointer-overflow"),
    (
        "null pointer returned from function declared to never return null",
        "invalid-null-return",
    ),
    ("shift", "undefined-shift"),
    ("execution reached an unreachable program point", "unreachable code"),
    ("signed integer overflow", "signed-integer-overflow"),
    ("unsigned integer overflow", "unsigned-integer-overflow"),
    (
        "variable length array bound evaluates to non-positive value",
        "non-positive-vla-bound-value",
    ),
    ("not a valid value for type", "invalid-enum-value"),
    ("integer overflow", "integer-overflow"),
    ("cannot be represented in type", "integer-overflow"),
];

const MEDIUM_ERROR_TYPES: &[&str] = &[
    "container-overflow",
    "global-buffer-overflow",
    "heap-buffer-overflow",
    "incorrect-function-pointer-type",
    "index-out-of-bounds",
    "memcpy-param-overlap",
    "non-positive-vla-bound-value",
    "object-size",
    "stack-buffer-overflow",
    "use-of-uninitialized-value",
    "unknown-crash",
];

const HIGH_ERROR_TYPES: &[&str] = &[
    "bad-cast",
    "heap-double-free",
    "double-free",
    "invalid-free",
    "heap-use-after-free",
    "use-after-poison",
];

/// Addresses in the first page are treated as null pointer dereferences.
/// Anything that does not parse as hex counts as null too.
fn is_null_dereference(address: &str) -> bool {
    let digits = address
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    let significant = digits.trim_start_matches('0');
    significant.is_empty()
        || (significant.len() <= 3 && u64::from_str_radix(significant, 16).is_ok_and(|a| a < 0x1000))
}

/// Normalizes the `error_type` of a sanitizer issue and classifies it.
pub fn analyze(issue: &mut Issue) {
    let Some(raw_type) = issue.text("error_type").map(|t| t.into_owned()) else {
        return;
    };
    if raw_type.is_empty() {
        return;
    }

    let table: &[(&str, &str)] = if issue.has("ubsan") {
        UBSAN_ERROR_TYPES
    } else {
        match issue.text("sanitizer").as_deref() {
            Some("AddressSanitizer") => ASAN_ERROR_TYPES,
            Some("UndefinedBehaviorSanitizer") => UBSAN_ERROR_TYPES,
            _ => &[],
        }
    };
    let mut error_type = table
        .iter()
        .find(|(pattern, _)| raw_type.contains(pattern))
        .map_or(raw_type.clone(), |(_, name)| name.to_string());

    if error_type == "SEGV" || error_type == "access-violation" {
        let address = issue.text("address").map(|a| a.into_owned()).unwrap_or_default();
        error_type = if is_null_dereference(&address) {
            "null-dereference".to_string()
        } else {
            "unknown-crash".to_string()
        };
    }

    let mut severity = if MEDIUM_ERROR_TYPES.contains(&error_type.as_str()) {
        SEVERITY_MEDIUM
    } else if HIGH_ERROR_TYPES.contains(&error_type.as_str()) {
        SEVERITY_HIGH
    } else {
        SEVERITY_NONE
    };
    if issue.text("mem_access").is_some_and(|m| m.contains("WRITE")) {
        severity = SEVERITY_HIGH;
    }

    issue.insert("error_type", error_type);
    issue.insert(SECURITY, severity);
}

/// Post-processes issues produced by [`super::filters::SanitizerAutomatonFilter`]:
/// maps sanitizer error descriptions to canonical error types and attaches a
/// `security` severity.
#[derive(Default)]
pub struct SanitizerAnalyzerDecorator;

impl CallDecorator for SanitizerAnalyzerDecorator {
    fn call(&mut self, inner: &mut dyn Call, input: CallInput) -> Result<Outcome, CallError> {
        match inner.call(input)? {
            Outcome::Issue(mut issue) => {
                analyze(&mut issue);
                Ok(Outcome::Issue(issue))
            }
            other => Ok(other),
        }
    }
}
