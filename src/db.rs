use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{AcademicRecord, SubjectMarks};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Attendance,
    Mark,
    Enrollment,
}

/// One line of a long-format observation CSV.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRow {
    pub student_key: String,
    pub full_name: String,
    pub cohort: String,
    pub semester: Option<i32>,
    pub previous_failures: Option<i32>,
    pub kind: ObservationKind,
    pub subject: Option<String>,
    pub observed_on: Option<NaiveDate>,
    pub value: Option<f64>,
    pub source_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Attendance { observed_on: NaiveDate, pct: f64 },
    Mark { subject: String, observed_on: NaiveDate, mark: f64 },
    Enrollment { subject: String },
}

impl ImportRow {
    pub fn observation(&self) -> anyhow::Result<Observation> {
        let subject = || {
            self.subject
                .clone()
                .filter(|s| !s.trim().is_empty())
                .with_context(|| format!("{}: {:?} row needs a subject", self.student_key, self.kind))
        };
        let observed_on = || {
            self.observed_on
                .with_context(|| format!("{}: {:?} row needs observed_on", self.student_key, self.kind))
        };
        let value = || -> anyhow::Result<f64> {
            let value = self
                .value
                .with_context(|| format!("{}: {:?} row needs a value", self.student_key, self.kind))?;
            if !value.is_finite() || value < 0.0 {
                bail!("{}: value {value} must be a non-negative number", self.student_key);
            }
            Ok(value)
        };

        Ok(match self.kind {
            ObservationKind::Attendance => Observation::Attendance {
                observed_on: observed_on()?,
                pct: value()?,
            },
            ObservationKind::Mark => Observation::Mark {
                subject: subject()?,
                observed_on: observed_on()?,
                mark: value()?,
            },
            ObservationKind::Enrollment => Observation::Enrollment { subject: subject()? },
        })
    }
}

struct StudentSeed {
    key: &'static str,
    name: &'static str,
    cohort: &'static str,
    semester: Option<i32>,
    previous_failures: Option<i32>,
    attendance: &'static [f64],
    marks: Vec<(&'static str, Vec<f64>)>,
    enrollments: &'static [&'static str],
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = [
        StudentSeed {
            key: "STU-1001",
            name: "Avery Lee",
            cohort: "2026",
            semester: Some(3),
            previous_failures: Some(0),
            attendance: &[94.0, 92.0, 95.0, 93.0, 94.0, 96.0, 95.0, 94.0],
            marks: vec![
                ("Calculus I", vec![16.0, 17.0, 17.0, 18.0]),
                ("Programming Fundamentals", vec![15.0, 16.0, 16.0, 17.0]),
            ],
            enrollments: &["Calculus II", "Data Structures", "Linear Algebra"],
        },
        StudentSeed {
            key: "STU-1002",
            name: "Jules Moreno",
            cohort: "2025",
            semester: Some(4),
            previous_failures: Some(1),
            attendance: &[82.0, 79.0, 75.0, 72.0, 68.0, 64.0, 61.0, 57.0],
            marks: vec![
                ("Calculus II", vec![13.0, 12.0, 10.0, 9.0]),
                ("Physics I", vec![12.0, 11.0, 11.0, 9.0]),
            ],
            enrollments: &["Calculus III", "Physics II", "Engineering Mathematics"],
        },
        StudentSeed {
            key: "STU-1003",
            name: "Kiara Patel",
            cohort: "2026",
            semester: Some(2),
            previous_failures: Some(0),
            attendance: &[85.0, 83.0, 86.0, 80.0, 82.0, 79.0, 81.0, 78.0],
            marks: vec![
                ("Programming Fundamentals", vec![12.0, 13.0, 11.0, 12.0]),
                ("Calculus I", vec![11.0, 12.0, 12.0, 11.0]),
            ],
            enrollments: &["Data Structures", "Calculus II", "Physics I"],
        },
        StudentSeed {
            key: "STU-1004",
            name: "Sam Okafor",
            cohort: "2026",
            semester: Some(1),
            previous_failures: None,
            attendance: &[88.0],
            marks: Vec::new(),
            enrollments: &["Calculus I", "Chemistry"],
        },
    ];
    let term_start = NaiveDate::from_ymd_opt(2026, 1, 5).context("invalid date")?;

    for student in &students {
        let student_id = upsert_student(
            pool,
            student.key,
            student.name,
            student.cohort,
            student.semester,
            student.previous_failures,
        )
        .await?;

        for (week, pct) in student.attendance.iter().enumerate() {
            let observed_on = term_start + Duration::weeks(week as i64);
            let observation = Observation::Attendance {
                observed_on,
                pct: *pct,
            };
            insert_observation(pool, student_id, student.key, &observation, None).await?;
        }
        for (subject, marks) in &student.marks {
            for (test, mark) in marks.iter().enumerate() {
                let observation = Observation::Mark {
                    subject: subject.to_string(),
                    observed_on: term_start + Duration::weeks(2 * test as i64 + 1),
                    mark: *mark,
                };
                insert_observation(pool, student_id, student.key, &observation, None).await?;
            }
        }
        for subject in student.enrollments {
            let observation = Observation::Enrollment {
                subject: subject.to_string(),
            };
            insert_observation(pool, student_id, student.key, &observation, None).await?;
        }
    }

    tracing::info!(students = students.len(), "seed data inserted");
    Ok(())
}

async fn upsert_student(
    pool: &PgPool,
    student_key: &str,
    full_name: &str,
    cohort: &str,
    semester: Option<i32>,
    previous_failures: Option<i32>,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO failure_risk.students
        (id, student_key, full_name, cohort, semester, previous_failures)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (student_key) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            cohort = EXCLUDED.cohort,
            semester = COALESCE(EXCLUDED.semester, failure_risk.students.semester),
            previous_failures = COALESCE(
                EXCLUDED.previous_failures,
                failure_risk.students.previous_failures
            )
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_key)
    .bind(full_name)
    .bind(cohort)
    .bind(semester)
    .bind(previous_failures)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Returns whether a new row was written; re-importing the same source key
/// is a no-op.
async fn insert_observation(
    pool: &PgPool,
    student_id: Uuid,
    student_key: &str,
    observation: &Observation,
    source_key: Option<String>,
) -> anyhow::Result<bool> {
    let result = match observation {
        Observation::Attendance { observed_on, pct } => {
            let source_key =
                source_key.unwrap_or_else(|| format!("{student_key}:attendance:{observed_on}"));
            sqlx::query(
                r#"
                INSERT INTO failure_risk.attendance_observations
                (id, student_id, observed_on, attendance_pct, source_key)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(observed_on)
            .bind(pct)
            .bind(source_key)
            .execute(pool)
            .await?
        }
        Observation::Mark {
            subject,
            observed_on,
            mark,
        } => {
            let source_key = source_key
                .unwrap_or_else(|| format!("{student_key}:mark:{subject}:{observed_on}"));
            sqlx::query(
                r#"
                INSERT INTO failure_risk.mark_observations
                (id, student_id, subject, observed_on, mark, source_key)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (source_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(subject)
            .bind(observed_on)
            .bind(mark)
            .bind(source_key)
            .execute(pool)
            .await?
        }
        Observation::Enrollment { subject } => {
            sqlx::query(
                r#"
                INSERT INTO failure_risk.enrollments (student_id, subject)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(student_id)
            .bind(subject)
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<ImportRow>().enumerate() {
        let row = result.with_context(|| format!("malformed row {}", line + 1))?;
        let observation = row
            .observation()
            .with_context(|| format!("invalid row {}", line + 1))?;
        let student_id = upsert_student(
            pool,
            &row.student_key,
            &row.full_name,
            &row.cohort,
            row.semester,
            row.previous_failures,
        )
        .await?;

        if insert_observation(pool, student_id, &row.student_key, &observation, row.source_key)
            .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn scope_filter(cohort: Option<&str>, student_key: Option<&str>) -> (&'static str, Option<String>) {
    if let Some(value) = cohort {
        (" WHERE s.cohort = $1", Some(value.to_string()))
    } else if let Some(value) = student_key {
        (" WHERE s.student_key = $1", Some(value.to_string()))
    } else {
        ("", None)
    }
}

/// Assemble academic records, observations in chronological order.
pub async fn fetch_records(
    pool: &PgPool,
    cohort: Option<&str>,
    student_key: Option<&str>,
) -> anyhow::Result<Vec<AcademicRecord>> {
    let (filter, value) = scope_filter(cohort, student_key);

    let query = format!(
        "SELECT s.id, s.student_key, s.full_name, s.cohort, s.semester, s.previous_failures \
         FROM failure_risk.students s{filter} ORDER BY s.student_key"
    );
    let mut rows = sqlx::query(&query);
    if let Some(value) = &value {
        rows = rows.bind(value.clone());
    }

    let mut records = Vec::new();
    let mut index: BTreeMap<Uuid, usize> = BTreeMap::new();
    for row in rows.fetch_all(pool).await? {
        let semester: Option<i32> = row.get("semester");
        let previous_failures: Option<i32> = row.get("previous_failures");
        index.insert(row.get("id"), records.len());
        records.push(AcademicRecord {
            student_id: row.get("student_key"),
            name: Some(row.get("full_name")),
            cohort: Some(row.get("cohort")),
            attendance_history: Vec::new(),
            marks_history: Vec::new(),
            current_subjects: Vec::new(),
            semester: semester.and_then(|v| u32::try_from(v).ok()),
            previous_failures: previous_failures.and_then(|v| u32::try_from(v).ok()),
        });
    }
    if records.is_empty() {
        return Ok(records);
    }

    let query = format!(
        "SELECT a.student_id, a.attendance_pct \
         FROM failure_risk.attendance_observations a \
         JOIN failure_risk.students s ON s.id = a.student_id{filter} \
         ORDER BY a.student_id, a.observed_on, a.source_key"
    );
    let mut rows = sqlx::query(&query);
    if let Some(value) = &value {
        rows = rows.bind(value.clone());
    }
    for row in rows.fetch_all(pool).await? {
        let student_id: Uuid = row.get("student_id");
        if let Some(&i) = index.get(&student_id) {
            records[i].attendance_history.push(row.get("attendance_pct"));
        }
    }

    let query = format!(
        "SELECT m.student_id, m.subject, m.mark \
         FROM failure_risk.mark_observations m \
         JOIN failure_risk.students s ON s.id = m.student_id{filter} \
         ORDER BY m.student_id, m.subject, m.observed_on, m.source_key"
    );
    let mut rows = sqlx::query(&query);
    if let Some(value) = &value {
        rows = rows.bind(value.clone());
    }
    for row in rows.fetch_all(pool).await? {
        let student_id: Uuid = row.get("student_id");
        let subject: String = row.get("subject");
        let mark: f64 = row.get("mark");
        let Some(&i) = index.get(&student_id) else {
            continue;
        };
        let history = &mut records[i].marks_history;
        match history.last_mut() {
            Some(last) if last.subject == subject => last.marks.push(mark),
            _ => history.push(SubjectMarks {
                subject,
                marks: vec![mark],
            }),
        }
    }

    let query = format!(
        "SELECT e.student_id, e.subject \
         FROM failure_risk.enrollments e \
         JOIN failure_risk.students s ON s.id = e.student_id{filter} \
         ORDER BY e.student_id, e.subject"
    );
    let mut rows = sqlx::query(&query);
    if let Some(value) = &value {
        rows = rows.bind(value.clone());
    }
    for row in rows.fetch_all(pool).await? {
        let student_id: Uuid = row.get("student_id");
        if let Some(&i) = index.get(&student_id) {
            records[i].current_subjects.push(row.get("subject"));
        }
    }

    tracing::debug!(records = records.len(), "fetched academic records");
    Ok(records)
}

/// Read a JSON array of records from disk.
pub fn read_records_file(path: &Path) -> anyhow::Result<Vec<AcademicRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let records: Vec<AcademicRecord> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of records", path.display()))?;
    Ok(records)
}

/// Same scoping rules as the database fetch, applied in memory.
pub fn filter_records(
    records: Vec<AcademicRecord>,
    cohort: Option<&str>,
    student_key: Option<&str>,
) -> Vec<AcademicRecord> {
    records
        .into_iter()
        .filter(|r| match (cohort, student_key) {
            (Some(cohort), _) => r.cohort.as_deref() == Some(cohort),
            (None, Some(key)) => r.student_id == key,
            (None, None) => true,
        })
        .collect()
}
