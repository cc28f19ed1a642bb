use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{Result, RiskError};
use crate::features::FeatureExtractor;
use crate::models::{AcademicRecord, PredictionResult, RiskLevel};
use crate::risk::RiskModel;

const HIGHEST_RISK_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct StudentAssessment {
    pub student_id: String,
    pub name: String,
    pub cohort: Option<String>,
    pub prediction: PredictionResult,
}

/// A record that could not be scored, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedStudent {
    pub student_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CohortAssessment {
    pub assessed: Vec<StudentAssessment>,
    pub skipped: Vec<SkippedStudent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorSummary {
    pub feature_name: String,
    pub count: usize,
    pub avg_importance: f64,
}

/// Score every record. Data-shape failures are collected per student; a
/// model-side failure aborts the batch.
pub fn assess_cohort(
    records: &[AcademicRecord],
    extractor: &FeatureExtractor,
    model: &RiskModel,
) -> Result<CohortAssessment> {
    let mut assessment = CohortAssessment::default();
    for record in records {
        match extractor.extract(record) {
            Ok(vector) => assessment.assessed.push(StudentAssessment {
                student_id: record.student_id.clone(),
                name: record.display_name().to_string(),
                cohort: record.cohort.clone(),
                prediction: model.predict(&vector)?,
            }),
            Err(err @ (RiskError::InsufficientHistory { .. } | RiskError::InvalidRecord { .. })) => {
                tracing::warn!(student = %record.student_id, error = %err, "skipping record");
                assessment.skipped.push(SkippedStudent {
                    student_id: record.student_id.clone(),
                    name: record.display_name().to_string(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    assessment.assessed.sort_by(|a, b| {
        b.prediction
            .failure_probability
            .total_cmp(&a.prediction.failure_probability)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    Ok(assessment)
}

pub fn summarize_factors(assessed: &[StudentAssessment]) -> Vec<FactorSummary> {
    let mut map: HashMap<String, (usize, f64)> = HashMap::new();

    for student in assessed {
        for factor in &student.prediction.top_factors {
            let entry = map.entry(factor.feature_name.clone()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += factor.importance;
        }
    }

    let mut summaries: Vec<FactorSummary> = map
        .into_iter()
        .map(|(feature_name, (count, total_importance))| FactorSummary {
            feature_name,
            count,
            avg_importance: if count == 0 {
                0.0
            } else {
                total_importance / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.feature_name.cmp(&b.feature_name))
    });
    summaries
}

pub fn level_counts(assessed: &[StudentAssessment]) -> Vec<(RiskLevel, usize)> {
    RiskLevel::ALL
        .iter()
        .map(|level| {
            let count = assessed
                .iter()
                .filter(|s| s.prediction.risk_level == *level)
                .count();
            (*level, count)
        })
        .collect()
}

pub fn build_report(
    cohort: Option<&str>,
    generated_on: NaiveDate,
    assessment: &CohortAssessment,
) -> String {
    let summaries = summarize_factors(&assessment.assessed);

    let mut output = String::new();
    let cohort_label = cohort.unwrap_or("all cohorts");

    let _ = writeln!(output, "# Academic Failure Risk Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} ({} assessed, {} without enough history)",
        cohort_label,
        generated_on,
        assessment.assessed.len(),
        assessment.skipped.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Distribution");

    if assessment.assessed.is_empty() {
        let _ = writeln!(output, "No students could be assessed.");
    } else {
        for (level, count) in level_counts(&assessment.assessed) {
            let _ = writeln!(output, "- {level}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Students");

    if assessment.assessed.is_empty() {
        let _ = writeln!(output, "No students could be assessed.");
    } else {
        for student in assessment.assessed.iter().take(HIGHEST_RISK_LIMIT) {
            let top_factor = student
                .prediction
                .top_factors
                .first()
                .map(|f| f.feature_name.as_str())
                .unwrap_or("none");
            let _ = writeln!(
                output,
                "- {} ({}, {}) failure probability {:.1}% [{}], top factor {}",
                student.name,
                student.student_id,
                student.cohort.as_deref().unwrap_or("no cohort"),
                student.prediction.failure_probability * 100.0,
                student.prediction.risk_level,
                top_factor
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Insufficient History");

    if assessment.skipped.is_empty() {
        let _ = writeln!(output, "Every student had enough history to assess.");
    } else {
        for student in &assessment.skipped {
            let _ = writeln!(
                output,
                "- {} ({}): {}",
                student.name, student.student_id, student.reason
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Most Frequent Risk Factors");

    if summaries.is_empty() {
        let _ = writeln!(output, "No contributing factors recorded.");
    } else {
        for summary in summaries.iter().take(5) {
            let _ = writeln!(
                output,
                "- {}: top factor for {} students (avg importance {:.3})",
                summary.feature_name, summary.count, summary.avg_importance
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PredictionConfig, RiskBands};
    use crate::models::{ContributingFactor, SubjectMarks};

    fn record(id: &str, attendance: Vec<f64>, marks: Vec<f64>) -> AcademicRecord {
        AcademicRecord {
            student_id: id.to_string(),
            name: Some(format!("Student {id}")),
            cohort: Some("2026".into()),
            attendance_history: attendance,
            marks_history: vec![SubjectMarks {
                subject: "Math".into(),
                marks,
            }],
            current_subjects: vec!["Math".into(), "Physics".into()],
            semester: Some(3),
            previous_failures: Some(0),
        }
    }

    fn assessment(id: &str, probability: f64, level: RiskLevel, factors: &[&str]) -> StudentAssessment {
        StudentAssessment {
            student_id: id.to_string(),
            name: id.to_string(),
            cohort: None,
            prediction: PredictionResult {
                failure_probability: probability,
                confidence: (probability - 0.5).abs() * 2.0,
                risk_level: level,
                top_factors: factors
                    .iter()
                    .enumerate()
                    .map(|(i, name)| ContributingFactor {
                        feature_name: name.to_string(),
                        feature_index: i,
                        importance: 0.1,
                        value: 0.5,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn assess_cohort_sorts_and_collects_skipped() {
        let extractor = FeatureExtractor::default();
        let model = RiskModel::bundled(RiskBands::default(), &PredictionConfig::default()).unwrap();
        let records = vec![
            record("A", vec![92.0, 93.0, 94.0, 95.0], vec![16.0, 17.0, 18.0]),
            record("B", vec![80.0, 72.0, 64.0, 55.0], vec![12.0, 10.0, 8.0]),
            record("C", vec![88.0], vec![15.0, 15.0]),
        ];

        let result = assess_cohort(&records, &extractor, &model).unwrap();
        assert_eq!(result.assessed.len(), 2);
        assert_eq!(result.assessed[0].student_id, "B");
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].student_id, "C");
        assert!(result.skipped[0].reason.contains("insufficient history"));
    }

    #[test]
    fn factor_summary_counts_and_breaks_ties_by_name() {
        let assessed = vec![
            assessment("A", 0.8, RiskLevel::Critical, &["attendance_trend", "avg_performance"]),
            assessment("B", 0.6, RiskLevel::High, &["avg_performance", "engagement_score"]),
            assessment("C", 0.1, RiskLevel::Low, &["attendance_trend"]),
        ];
        let summaries = summarize_factors(&assessed);
        assert_eq!(summaries[0].feature_name, "attendance_trend");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[1].feature_name, "avg_performance");
        assert_eq!(summaries[2].feature_name, "engagement_score");
        assert!((summaries[0].avg_importance - 0.1).abs() < 1e-12);
    }

    #[test]
    fn report_lists_every_section() {
        let result = CohortAssessment {
            assessed: vec![
                assessment("A", 0.8, RiskLevel::Critical, &["attendance_trend"]),
                assessment("B", 0.3, RiskLevel::Medium, &["avg_performance"]),
            ],
            skipped: vec![SkippedStudent {
                student_id: "C".into(),
                name: "Casey".into(),
                reason: "insufficient history: attendance has 1 point(s), need at least 2".into(),
            }],
        };
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let report = build_report(Some("2026"), date, &result);

        assert!(report.starts_with("# Academic Failure Risk Report"));
        assert!(report.contains("Generated for 2026 on 2026-03-02 (2 assessed, 1 without enough history)"));
        assert!(report.contains("- critical: 1"));
        assert!(report.contains("- low: 0"));
        assert!(report.contains("- A (A, no cohort) failure probability 80.0% [critical], top factor attendance_trend"));
        assert!(report.contains("- Casey (C): insufficient history"));
        assert!(report.contains("## Most Frequent Risk Factors"));
    }

    #[test]
    fn empty_cohort_report() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let report = build_report(None, date, &CohortAssessment::default());
        assert!(report.contains("Generated for all cohorts"));
        assert!(report.contains("No students could be assessed."));
        assert!(report.contains("No contributing factors recorded."));
    }
}
