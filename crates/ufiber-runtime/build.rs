//! Generates `OUT_DIR/ufiber_merged_config.rs`
//!
//! Every tunable starts at the library default below. With the
//! `custom-config` feature, a file named by `UFIBER_CONFIG_RS` may override
//! any subset of them using the same declarations the generated file holds:
//!
//! ```text
//! pub const RING_ENTRIES: u32 = 1024;
//! pub const STACK_SIZE: usize = 256 * 1024;
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// (name, type, default, doc)
const TUNABLES: &[(&str, &str, &str, &str)] = &[
    ("NUM_PROCESSORS", "usize", "0", "Processor threads; 0 = one per available CPU"),
    ("RING_ENTRIES", "u32", "256", "io_uring submission queue depth per processor"),
    ("HOOK_ENABLED", "bool", "false", "Hook flag on processor threads at start"),
    ("STACK_SIZE", "usize", "1024 * 1024", "Fiber stack size in bytes"),
    ("LOCAL_QUEUE_CAPACITY", "usize", "256", "Local run queue length before spawns overflow"),
    ("FREE_LIST_CAPACITY", "usize", "128", "Terminated fibers cached per processor"),
    ("MAX_EVENT_WAIT_MS", "u64", "10", "Longest single reactor wait"),
    ("PARK_TIMEOUT_MS", "u64", "10", "Idle processor park timeout"),
    ("MUTEX_SPIN_COUNT", "u32", "100", "Yielding lock attempts before a futex wait"),
];

const CONFIG_ENV: &str = "UFIBER_CONFIG_RS";

fn main() {
    println!("cargo:rerun-if-env-changed={}", CONFIG_ENV);
    println!("cargo:rerun-if-changed=build.rs");

    let mut values = defaults();
    let user_path = env::var(CONFIG_ENV).ok();
    let custom = env::var_os("CARGO_FEATURE_CUSTOM_CONFIG").is_some();

    match (&user_path, custom) {
        (Some(path), true) => {
            println!("cargo:rerun-if-changed={}", path);
            match fs::read_to_string(path) {
                Ok(source) => {
                    for warning in merge_overrides(&source, &mut values) {
                        println!("cargo:warning={}", warning);
                    }
                }
                Err(e) => println!("cargo:warning=cannot read {} ({}): {}", CONFIG_ENV, path, e),
            }
        }
        (Some(_), false) => println!(
            "cargo:warning={} is ignored without the custom-config feature",
            CONFIG_ENV
        ),
        (None, true) => println!("cargo:warning=custom-config enabled but {} is not set", CONFIG_ENV),
        (None, false) => {}
    }

    let source = render(&values, user_path.filter(|_| custom).as_deref());
    let dest = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"))
        .join("ufiber_merged_config.rs");
    fs::write(&dest, source).expect("write merged config");
}

fn defaults() -> BTreeMap<&'static str, String> {
    TUNABLES
        .iter()
        .map(|&(name, _, default, _)| (name, default.to_string()))
        .collect()
}

/// `pub const NAME: TYPE = EXPR;` -> (NAME, TYPE, EXPR)
fn parse_declaration(line: &str) -> Option<(&str, &str, &str)> {
    let rest = line.trim().strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (ty, expr) = rest.split_once('=')?;
    let expr = expr.trim().trim_end_matches(';').trim();
    if expr.is_empty() {
        return None;
    }
    Some((name.trim(), ty.trim(), expr))
}

/// Integer literals joined by arithmetic operators, or a bool literal
fn value_fits(ty: &str, expr: &str) -> bool {
    match ty {
        "bool" => matches!(expr, "true" | "false"),
        _ => expr
            .chars()
            .all(|c| c.is_ascii_digit() || " _*+-()<".contains(c)),
    }
}

/// Apply the overrides in `source`; returns warnings for rejected lines
fn merge_overrides(source: &str, values: &mut BTreeMap<&'static str, String>) -> Vec<String> {
    let mut warnings = Vec::new();
    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((name, ty, expr)) = parse_declaration(line) else {
            continue;
        };
        let Some(&(known, expected_ty, _, _)) = TUNABLES.iter().find(|t| t.0 == name) else {
            warnings.push(format!("unknown tunable {}", name));
            continue;
        };
        if ty != expected_ty || !value_fits(ty, expr) {
            warnings.push(format!("{} must be a {} (got `{}: {}`)", name, expected_ty, ty, expr));
            continue;
        }
        values.insert(known, expr.to_string());
    }
    warnings
}

fn render(values: &BTreeMap<&'static str, String>, origin: Option<&str>) -> String {
    let mut out = String::from("// @generated by ufiber-runtime/build.rs\n");
    if let Some(path) = origin {
        out.push_str(&format!("// overrides from {}\n", path));
    }
    for &(name, ty, default, doc) in TUNABLES {
        let value = values.get(name).map_or(default, String::as_str);
        out.push_str(&format!("\n/// {}\npub const {}: {} = {};\n", doc, name, ty, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declaration() {
        assert_eq!(
            parse_declaration("pub const RING_ENTRIES: u32 = 1024;"),
            Some(("RING_ENTRIES", "u32", "1024"))
        );
        assert_eq!(
            parse_declaration("  pub const STACK_SIZE : usize = 2 * 1024 * 1024 ;"),
            Some(("STACK_SIZE", "usize", "2 * 1024 * 1024"))
        );
        assert_eq!(parse_declaration("const X: u32 = 1;"), None);
        assert_eq!(parse_declaration("pub const X: u32 = ;"), None);
    }

    #[test]
    fn test_merge_overrides() {
        let mut values = defaults();
        let warnings = merge_overrides(
            r#"
            // tuned for a small box
            pub const RING_ENTRIES: u32 = 1024;
            pub const HOOK_ENABLED: bool = true;
            pub const MAX_EVENT_WAIT_MS: u64 = 2;
            pub const NOT_A_TUNABLE: u64 = 7;
            pub const PARK_TIMEOUT_MS: u32 = 5;
            pub const MUTEX_SPIN_COUNT: u32 = some_fn();
            "#,
            &mut values,
        );

        assert_eq!(values["RING_ENTRIES"], "1024");
        assert_eq!(values["HOOK_ENABLED"], "true");
        assert_eq!(values["MAX_EVENT_WAIT_MS"], "2");
        assert_eq!(values["PARK_TIMEOUT_MS"], "10");
        assert_eq!(values["MUTEX_SPIN_COUNT"], "100");
        assert!(!values.contains_key("NOT_A_TUNABLE"));
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn test_render_defaults() {
        let out = render(&BTreeMap::new(), None);
        assert!(out.contains("pub const RING_ENTRIES: u32 = 256;"));
        assert!(out.contains("pub const HOOK_ENABLED: bool = false;"));
        assert!(out.contains("/// Fiber stack size in bytes\npub const STACK_SIZE: usize = 1024 * 1024;"));
        assert!(!out.contains("overrides from"));
    }
}
