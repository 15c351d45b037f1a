//! Parsing the JSON summary the workflow prints on stdout.
//!
//! The workflow logs progress freely and finishes by printing one
//! pretty-printed JSON object. Only that trailing object is read.

use serde::Deserialize;

use scout_store::JobCounts;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Summary {
    Batch(BatchSummary),
    Single(SingleSummary),
    Analysis(AnalysisSummary),
}

#[derive(Debug, Deserialize)]
struct BatchSummary {
    total_posts_found: u32,
    total_new_posts: u32,
    #[serde(default)]
    results: Vec<SingleSummary>,
}

#[derive(Debug, Deserialize)]
struct SingleSummary {
    posts_found: u32,
    new_posts: u32,
    #[serde(default)]
    changes: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnalysisSummary {
    analyzed: u32,
}

impl From<Summary> for JobCounts {
    fn from(summary: Summary) -> Self {
        match summary {
            Summary::Batch(batch) => JobCounts {
                items_scraped: batch.total_posts_found,
                new_items_found: batch.total_new_posts,
                changes_detected: batch.results.iter().map(|r| r.changes.len() as u32).sum(),
            },
            Summary::Single(single) => JobCounts {
                items_scraped: single.posts_found,
                new_items_found: single.new_posts,
                changes_detected: single.changes.len() as u32,
            },
            Summary::Analysis(analysis) => JobCounts {
                items_scraped: analysis.analyzed,
                ..Default::default()
            },
        }
    }
}

/// Extract result counters from workflow stdout.
///
/// Returns zero counts when no recognizable summary is present.
pub fn parse_report(stdout: &str) -> JobCounts {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return JobCounts::default();
    }

    if let Ok(summary) = serde_json::from_str::<Summary>(trimmed) {
        return summary.into();
    }

    // Try each line that opens an object, last first.
    let starts = trimmed
        .match_indices('\n')
        .map(|(idx, _)| idx + 1)
        .filter(|&idx| trimmed[idx..].starts_with('{'));
    let mut candidates: Vec<usize> = starts.collect();
    candidates.reverse();

    candidates
        .into_iter()
        .find_map(|idx| serde_json::from_str::<Summary>(&trimmed[idx..]).ok())
        .map(JobCounts::from)
        .unwrap_or_default()
}
