//! Merge per-source versions into one history per report.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ecr_adapters::AdaptedVersion;
use ecr_core::{sort_newest_first, DedupKey, Report, ReportNumber, VersionRecord};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Below this title similarity a dropped same-day duplicate is worth a human look.
pub const CONFLICT_REVIEW_THRESHOLD: f64 = 0.85;

/// A same-day version that lost to an earlier-seen one.
#[derive(Debug, Clone, Serialize)]
pub struct SameDayConflict {
    pub number: ReportNumber,
    pub day: NaiveDate,
    pub kept_source: String,
    pub dropped_source: String,
    pub title_similarity: f64,
}

impl SameDayConflict {
    pub fn needs_review(&self) -> bool {
        self.title_similarity < CONFLICT_REVIEW_THRESHOLD
    }
}

#[derive(Debug, Default)]
pub struct Collation {
    /// Newest report first.
    pub reports: Vec<Report>,
    pub conflicts: Vec<SameDayConflict>,
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First seen wins: a version whose (report, day) was already taken is dropped,
/// whatever its source or retrieval time.
pub fn collate(versions: Vec<AdaptedVersion>) -> Collation {
    let mut by_report: BTreeMap<ReportNumber, Vec<VersionRecord>> = BTreeMap::new();
    let mut seen: HashMap<DedupKey, (String, String)> = HashMap::new();
    let mut conflicts = Vec::new();

    for AdaptedVersion { number, version, .. } in versions {
        let key = version.dedup_key(&number);
        if let Some((kept_source, kept_title)) = seen.get(&key) {
            let conflict = SameDayConflict {
                number: number.clone(),
                day: key.day,
                kept_source: kept_source.clone(),
                dropped_source: version.source.clone(),
                title_similarity: jaro_winkler(&normalize_title(kept_title), &normalize_title(&version.title)),
            };
            if conflict.needs_review() {
                warn!(
                    report = %conflict.number,
                    day = %conflict.day,
                    kept = %conflict.kept_source,
                    dropped = %conflict.dropped_source,
                    similarity = conflict.title_similarity,
                    "dropped same-day version has materially different metadata"
                );
            } else {
                debug!(report = %number, day = %key.day, source = %version.source, "dropped same-day duplicate");
            }
            conflicts.push(conflict);
            continue;
        }
        seen.insert(key, (version.source.clone(), version.title.clone()));
        by_report.entry(number).or_default().push(version);
    }

    let mut reports: Vec<Report> = by_report
        .into_iter()
        .filter_map(|(number, mut versions)| {
            sort_newest_first(&mut versions);
            Report::from_sorted_versions(number, versions)
        })
        .collect();
    reports.sort_by(Report::newest_first);
    Collation { reports, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use ecr_core::{DocumentKind, FormatKind, FormatRecord};

    fn adapted(number: &str, source: &str, day: &str, retrieved: &str, title: &str) -> AdaptedVersion {
        AdaptedVersion {
            number: ReportNumber::parse(number).unwrap(),
            version: VersionRecord {
                source: source.into(),
                source_link: None,
                id: format!("{number}-{source}-{day}"),
                date: day.parse().unwrap(),
                retrieved: NaiveDateTime::parse_from_str(retrieved, "%Y-%m-%dT%H:%M:%S").unwrap(),
                title: title.into(),
                summary: None,
                type_name: DocumentKind::Report.display_name().into(),
                type_id: DocumentKind::Report.type_id().into(),
                active: true,
                formats: vec![FormatRecord::new(FormatKind::Pdf, format!("files/{number}-{day}.pdf"))],
                topics: Vec::new(),
            },
            authors: Vec::new(),
        }
    }

    #[test]
    fn first_seen_same_day_version_wins() {
        let collation = collate(vec![
            adapted("R41360", "A", "2020-01-01", "2020-01-02T00:00:00", "Draft"),
            adapted("R41360", "B", "2020-01-01", "2020-01-03T00:00:00", "Final"),
        ]);
        assert_eq!(collation.reports.len(), 1);
        let report = &collation.reports[0];
        assert_eq!(report.versions.len(), 1);
        assert_eq!(report.versions[0].title, "Draft");
        assert_eq!(report.source, "A");
        assert_eq!(collation.conflicts.len(), 1);
        assert!(collation.conflicts[0].needs_review());
    }

    #[test]
    fn versions_sort_by_date_then_retrieved() {
        let collation = collate(vec![
            adapted("R1", "A", "2019-05-01", "2019-05-02T00:00:00", "Old"),
            adapted("R1", "A", "2020-02-01", "2020-02-02T00:00:00", "New"),
            adapted("R1", "B", "2019-12-01", "2019-12-02T00:00:00", "Mid"),
        ]);
        let titles: Vec<_> = collation.reports[0].versions.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["New", "Mid", "Old"]);
        assert_eq!(collation.reports[0].source, "A, B");
    }

    #[test]
    fn reports_order_newest_first_with_number_tiebreak() {
        let collation = collate(vec![
            adapted("R2", "A", "2020-01-01", "2020-01-02T00:00:00", "Two"),
            adapted("R1", "A", "2020-01-01", "2020-01-02T00:00:00", "One"),
            adapted("R3", "A", "2021-01-01", "2021-01-02T00:00:00", "Three"),
        ]);
        let numbers: Vec<_> = collation.reports.iter().map(|r| r.number.as_str()).collect();
        assert_eq!(numbers, vec!["R3", "R1", "R2"]);
    }

    #[test]
    fn near_identical_titles_do_not_need_review() {
        let collation = collate(vec![
            adapted("R1", "A", "2020-01-01", "2020-01-02T00:00:00", "Farm Bill Primer"),
            adapted("R1", "B", "2020-01-01", "2020-01-02T00:00:00", "Farm bill primer"),
        ]);
        assert!(!collation.conflicts[0].needs_review());
    }
}
