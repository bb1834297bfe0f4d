// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool-output shrinking.
//!
//! Tool results feed straight back into the next model turn, so an
//! oversized one burns context on every remaining turn of the run.  When a
//! serialized result exceeds the configured cap it is shrunk with a
//! strategy picked by the tool's declared [`OutputCategory`]:
//!
//! - `Listing`: a JSON path array becomes a summary object with counts, an
//!   extension histogram, and a sample.
//! - `Matches`: a JSON match array becomes totals, the busiest files, and
//!   the leading matches.
//! - `TestRun`: keep the head (what ran) and a larger tail (the verdict).
//! - `Generic`: keep a larger head and a smaller tail.

use std::collections::HashMap;

use serde_json::{json, Value};

use klaus_tools::OutputCategory;

/// Shrink `content` to roughly `max_chars`.  Content within the cap passes
/// through untouched; a cap of zero disables shrinking.
pub fn shrink_tool_result(content: &str, category: OutputCategory, max_chars: usize) -> String {
    if max_chars == 0 || content.len() <= max_chars {
        return content.to_string();
    }
    match category {
        OutputCategory::Listing => {
            shrink_listing(content).unwrap_or_else(|| head_tail(content, max_chars, 0.6, 0.3))
        }
        OutputCategory::Matches => {
            shrink_matches(content).unwrap_or_else(|| head_tail(content, max_chars, 0.6, 0.3))
        }
        OutputCategory::TestRun => head_tail(content, max_chars, 0.3, 0.5),
        OutputCategory::Generic => head_tail(content, max_chars, 0.6, 0.3),
    }
}

/// Summarise a JSON array of file paths.  `None` when the content is not
/// the expected shape (falls back to generic truncation).
fn shrink_listing(content: &str) -> Option<String> {
    let paths: Vec<String> = serde_json::from_str(content).ok()?;

    let mut dirs: Vec<&str> = paths
        .iter()
        .map(|p| p.rsplit_once('/').map(|(d, _)| d).unwrap_or("."))
        .collect();
    dirs.sort();
    dirs.dedup();

    let mut extensions: HashMap<&str, usize> = HashMap::new();
    for path in &paths {
        let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("(none)");
        *extensions.entry(ext).or_default() += 1;
    }
    let mut top_extensions: Vec<(&str, usize)> = extensions.into_iter().collect();
    top_extensions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    top_extensions.truncate(10);

    let summary = json!({
        "summary": "file listing truncated",
        "total_files": paths.len(),
        "distinct_directories": dirs.len(),
        "top_extensions": top_extensions
            .iter()
            .map(|(ext, count)| json!({"extension": ext, "count": count}))
            .collect::<Vec<_>>(),
        "sample": paths.iter().take(20).collect::<Vec<_>>(),
    });
    Some(summary.to_string())
}

/// Summarise a JSON array of `{file, line, text}` match objects.
fn shrink_matches(content: &str) -> Option<String> {
    let matches: Vec<Value> = serde_json::from_str(content).ok()?;
    if !matches.iter().all(|m| m.get("file").is_some()) {
        return None;
    }

    let mut per_file: HashMap<&str, usize> = HashMap::new();
    for m in &matches {
        if let Some(file) = m["file"].as_str() {
            *per_file.entry(file).or_default() += 1;
        }
    }
    let files_with_matches = per_file.len();
    let mut top_files: Vec<(&str, usize)> = per_file.into_iter().collect();
    top_files.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    top_files.truncate(10);

    let summary = json!({
        "summary": "search results truncated",
        "total_matches": matches.len(),
        "files_with_matches": files_with_matches,
        "top_files": top_files
            .iter()
            .map(|(file, count)| json!({"file": file, "matches": count}))
            .collect::<Vec<_>>(),
        "sample": matches.iter().take(15).collect::<Vec<_>>(),
    });
    Some(summary.to_string())
}

/// Keep `head_frac` of the budget from the start and `tail_frac` from the
/// end, with an omission marker between.
fn head_tail(content: &str, max_chars: usize, head_frac: f64, tail_frac: f64) -> String {
    let head_len = floor_char_boundary(content, (max_chars as f64 * head_frac) as usize);
    let tail_target = (max_chars as f64 * tail_frac) as usize;
    let tail_start = ceil_char_boundary(content, content.len().saturating_sub(tail_target));
    let omitted = tail_start.saturating_sub(head_len);
    format!(
        "{}\n[... output truncated: {omitted} bytes omitted ...]\n{}",
        &content[..head_len],
        &content[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_passes_through() {
        let out = shrink_tool_result("small", OutputCategory::Generic, 100);
        assert_eq!(out, "small");
    }

    #[test]
    fn zero_cap_disables_shrinking() {
        let long = "x".repeat(10_000);
        assert_eq!(shrink_tool_result(&long, OutputCategory::Generic, 0), long);
    }

    #[test]
    fn listing_becomes_a_summary_object() {
        let paths: Vec<String> = (0..200)
            .map(|i| format!("src/module_{}/file_{i}.rs", i % 7))
            .chain((0..50).map(|i| format!("docs/page_{i}.md")))
            .collect();
        let content = serde_json::to_string(&paths).unwrap();
        let out = shrink_tool_result(&content, OutputCategory::Listing, 500);

        let summary: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(summary["total_files"], 250);
        assert_eq!(summary["distinct_directories"], 8);
        assert_eq!(summary["sample"].as_array().unwrap().len(), 20);
        // rs (200) should outrank md (50)
        assert_eq!(summary["top_extensions"][0]["extension"], "rs");
        assert_eq!(summary["top_extensions"][0]["count"], 200);
    }

    #[test]
    fn matches_become_totals_and_top_files() {
        let matches: Vec<Value> = (0..120)
            .map(|i| {
                json!({
                    "file": format!("src/f{}.rs", i % 4),
                    "line": i + 1,
                    "text": format!("match number {i} with some padding to exceed the cap"),
                })
            })
            .collect();
        let content = serde_json::to_string(&matches).unwrap();
        let out = shrink_tool_result(&content, OutputCategory::Matches, 500);

        let summary: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(summary["total_matches"], 120);
        assert_eq!(summary["files_with_matches"], 4);
        assert_eq!(summary["sample"].as_array().unwrap().len(), 15);
        assert_eq!(summary["top_files"][0]["matches"], 30);
    }

    #[test]
    fn test_run_keeps_head_and_bigger_tail() {
        let head = "running 120 tests\n".repeat(50);
        let tail = "test result: FAILED. 119 passed; 1 failed\n".repeat(20);
        let content = format!("{head}{tail}");
        let out = shrink_tool_result(&content, OutputCategory::TestRun, 600);

        assert!(out.len() < content.len());
        assert!(out.starts_with("running 120 tests"));
        assert!(out.contains("output truncated"));
        assert!(out.trim_end().ends_with("119 passed; 1 failed"));
        // The tail keeps more budget than the head.
        let marker_pos = out.find("[... output").unwrap();
        assert!(out.len() - marker_pos > marker_pos / 2);
    }

    #[test]
    fn generic_keeps_bigger_head() {
        let content = format!("{}{}", "A".repeat(5000), "Z".repeat(5000));
        let out = shrink_tool_result(&content, OutputCategory::Generic, 1000);
        assert!(out.starts_with('A'));
        assert!(out.trim_end().ends_with('Z'));
        let head_len = out.find('\n').unwrap();
        assert!((590..=610).contains(&head_len), "head was {head_len}");
    }

    #[test]
    fn malformed_listing_falls_back_to_generic() {
        let content = format!("not json {}", "x".repeat(1000));
        let out = shrink_tool_result(&content, OutputCategory::Listing, 100);
        assert!(out.contains("output truncated"));
    }

    #[test]
    fn multibyte_content_never_splits_a_char() {
        let content = "é".repeat(2000);
        let out = shrink_tool_result(&content, OutputCategory::Generic, 500);
        assert!(out.contains("output truncated"));
    }
}
