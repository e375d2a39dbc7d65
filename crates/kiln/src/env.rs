use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static KILN_IR_DUMP: OnceLock<Option<PathBuf>> = OnceLock::new();
static KILN_PASS_STATS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Destination for the JSON IR dump written at the end of (or on failure of) `prepare`.
pub(crate) fn ir_dump_path() -> Option<PathBuf> {
    KILN_IR_DUMP
        .get_or_init(|| match env::var("KILN_IR_DUMP") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .clone()
}

pub(crate) fn pass_stats_enabled() -> bool {
    *KILN_PASS_STATS.get_or_init(|| match env::var("KILN_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
