use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use failure_risk::config::EngineConfig;
use failure_risk::counterfactual::{CounterfactualSimulator, InterventionCatalog};
use failure_risk::db;
use failure_risk::explain::{self, CommandExplainer, ExplanationRequest, Explainer};
use failure_risk::features::{FeatureExtractor, DATA_COMPLETENESS};
use failure_risk::graph::CourseGraph;
use failure_risk::models::AcademicRecord;
use failure_risk::report;
use failure_risk::risk::RiskModel;

#[derive(Parser)]
#[command(name = "failure-risk")]
#[command(about = "Academic failure risk assessment and intervention planning", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Model artifact (JSON); the bundled model is used when omitted
    #[arg(long, global = true)]
    model: Option<PathBuf>,
    /// Intervention catalog (JSON)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Course graph edges (CSV: prerequisite,course,strength)
    #[arg(long, global = true)]
    graph: Option<PathBuf>,
    /// Read records from a JSON file instead of Postgres
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import long-format observations from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Predict failure risk for each student
    #[command(group(
        ArgGroup::new("scope")
            .args(["cohort", "student"])
            .multiple(false)
    ))]
    Assess {
        #[arg(long)]
        cohort: Option<String>,
        #[arg(long)]
        student: Option<String>,
        /// External program that phrases explanations (request JSON on stdin)
        #[arg(long)]
        explain_cmd: Option<String>,
    },
    /// Rank interventions and search for a minimal safe path
    Interventions {
        #[arg(long)]
        student: String,
        /// Target failure probability; defaults to the configured value
        #[arg(long)]
        target: Option<f64>,
        /// Exit with an error when the target cannot be reached
        #[arg(long)]
        strict: bool,
    },
    /// Apply several named interventions together
    WhatIf {
        #[arg(long)]
        student: String,
        #[arg(long = "apply", required = true)]
        interventions: Vec<String>,
    },
    /// Project failure risk onto downstream courses
    #[command(group(
        ArgGroup::new("source")
            .args(["student", "course"])
            .required(true)
    ))]
    Propagate {
        #[arg(long)]
        student: Option<String>,
        #[arg(long, requires = "probability")]
        course: Option<String>,
        #[arg(long)]
        probability: Option<f64>,
    },
    /// Generate a markdown cohort report
    Report {
        #[arg(long)]
        cohort: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Query the course prerequisite graph
    Graph {
        #[command(subcommand)]
        query: GraphQuery,
    },
}

#[derive(Subcommand)]
enum GraphQuery {
    /// Direct prerequisites and dependency depth of a course
    Prerequisites { course: String },
    /// Courses that directly build on a course
    Dependents { course: String },
    /// Study order of every course leading to the target
    LearningPath { course: String },
    /// Prerequisites shared by a set of current courses
    Critical {
        #[arg(required = true)]
        courses: Vec<String>,
    },
    /// Every course and edge
    Export,
}

struct Engine {
    config: EngineConfig,
    extractor: FeatureExtractor,
    model: RiskModel,
    catalog: InterventionCatalog,
}

impl Engine {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let config = load_config(cli.config.as_deref())?;
        let model = match &cli.model {
            Some(path) => RiskModel::from_file(path, config.bands.clone(), &config.prediction),
            None => RiskModel::bundled(config.bands.clone(), &config.prediction),
        }
        .context("failed to load risk model")?;
        let catalog = match &cli.catalog {
            Some(path) => InterventionCatalog::from_file(path),
            None => InterventionCatalog::bundled(),
        }
        .context("failed to load intervention catalog")?;
        tracing::info!(
            model = model.model_id(),
            version = model.model_version(),
            interventions = catalog.interventions.len(),
            "engine loaded"
        );

        Ok(Self {
            extractor: FeatureExtractor::new(config.features.clone()),
            config,
            model,
            catalog,
        })
    }

    fn simulator(&self) -> CounterfactualSimulator<'_, RiskModel> {
        CounterfactualSimulator::new(&self.extractor, &self.model, &self.catalog, &self.config)
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn load_graph(path: Option<&Path>) -> anyhow::Result<CourseGraph> {
    match path {
        Some(path) => CourseGraph::from_file(path),
        None => CourseGraph::bundled(),
    }
    .context("failed to load course graph")
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn load_records(
    input: Option<&Path>,
    cohort: Option<&str>,
    student: Option<&str>,
) -> anyhow::Result<Vec<AcademicRecord>> {
    match input {
        Some(path) => Ok(db::filter_records(
            db::read_records_file(path)?,
            cohort,
            student,
        )),
        None => {
            let pool = connect().await?;
            db::fetch_records(&pool, cohort, student).await
        }
    }
}

async fn load_student(input: Option<&Path>, student: &str) -> anyhow::Result<AcademicRecord> {
    load_records(input, None, Some(student))
        .await?
        .into_iter()
        .next()
        .with_context(|| format!("student {student} not found"))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let input = cli.input.as_deref();

    match &cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, csv).await?;
            println!("Inserted {inserted} observations from {}.", csv.display());
        }
        Commands::Assess {
            cohort,
            student,
            explain_cmd,
        } => {
            let engine = Engine::load(&cli)?;
            let records = load_records(input, cohort.as_deref(), student.as_deref()).await?;
            if records.is_empty() {
                println!("No students found for this scope.");
                return Ok(());
            }
            let explainer = explain_cmd
                .as_ref()
                .map(|cmd| {
                    CommandExplainer::new(cmd.clone(), Vec::new())
                        .with_timeout(engine.config.explanation.timeout())
                });

            let mut results = Vec::with_capacity(records.len());
            for record in &records {
                let vector = match engine.extractor.extract(record) {
                    Ok(vector) => vector,
                    Err(err) => {
                        tracing::warn!(student = %record.student_id, error = %err, "cannot assess");
                        results.push(json!({
                            "student_id": record.student_id,
                            "error": err.to_string(),
                        }));
                        continue;
                    }
                };
                let prediction = engine.model.predict(&vector)?;
                let context = format!(
                    "semester {}, {} current subjects",
                    record.semester.unwrap_or(1),
                    record.current_subjects.len()
                );
                let request = ExplanationRequest::from_prediction(&prediction, context);
                let explanation = explain::explain_with_fallback(
                    explainer.as_ref().map(|e| e as &dyn Explainer),
                    &request,
                )
                .await;
                let completeness = vector.get(DATA_COMPLETENESS).unwrap_or_default();
                results.push(json!({
                    "student_id": record.student_id,
                    "name": record.display_name(),
                    "prediction": prediction,
                    "explanation": explanation,
                    "uncertainty": explain::uncertainty_template(&prediction, completeness),
                }));
            }
            print_json(&json!(results))?;
        }
        Commands::Interventions {
            student,
            target,
            strict,
        } => {
            let engine = Engine::load(&cli)?;
            let record = load_student(input, student).await?;
            let target = target.unwrap_or(engine.config.simulation.target_probability);
            if !(0.0..=1.0).contains(&target) {
                bail!("target probability must be within [0, 1], got {target}");
            }

            let baseline = engine.model.predict(&engine.extractor.extract(&record)?)?;
            let simulator = engine.simulator();
            let ranked = simulator.simulate(&record, &baseline)?;
            let path = simulator.minimal_safe_path(&record, &baseline, target)?;
            let explanations: Vec<String> = ranked
                .iter()
                .map(|r| explain::intervention_template(r, baseline.failure_probability))
                .collect();

            print_json(&json!({
                "student_id": record.student_id,
                "baseline": baseline,
                "interventions": ranked,
                "explanations": explanations,
                "summary": explain::summary_template(&baseline, &ranked),
                "minimal_safe_path": path,
            }))?;
            if *strict {
                path.ensure_reached()?;
            }
        }
        Commands::WhatIf {
            student,
            interventions,
        } => {
            let engine = Engine::load(&cli)?;
            let record = load_student(input, student).await?;
            let outcome = engine.simulator().what_if(&record, interventions)?;
            print_json(&json!({
                "student_id": record.student_id,
                "outcome": outcome,
            }))?;
        }
        Commands::Propagate {
            student,
            course,
            probability,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let graph = load_graph(cli.graph.as_deref())?;

            if let (Some(course), Some(probability)) = (course, probability) {
                if !(0.0..=1.0).contains(probability) {
                    bail!("probability must be within [0, 1], got {probability}");
                }
                let propagated = graph.propagate(course, *probability, &config.propagation);
                print_json(&json!({
                    "source": course,
                    "probability": probability,
                    "propagated": propagated,
                    "explanation": explain::prerequisite_template(course, &propagated),
                }))?;
            } else if let Some(student) = student {
                let engine = Engine::load(&cli)?;
                let record = load_student(input, student).await?;
                let prediction = engine.model.predict(&engine.extractor.extract(&record)?)?;
                let p = prediction.failure_probability;
                let propagated = graph.propagate_many(
                    record.current_subjects.iter().map(String::as_str),
                    p,
                    &engine.config.propagation,
                );
                let explanations: Vec<String> = record
                    .current_subjects
                    .iter()
                    .filter(|_| p > engine.config.propagation.min_source_probability)
                    .map(|subject| {
                        let risks = graph.propagate(subject, p, &engine.config.propagation);
                        explain::prerequisite_template(subject, &risks)
                    })
                    .collect();
                print_json(&json!({
                    "student_id": record.student_id,
                    "failure_probability": p,
                    "propagated": propagated,
                    "explanations": explanations,
                }))?;
            }
        }
        Commands::Report { cohort, out } => {
            let engine = Engine::load(&cli)?;
            let records = load_records(input, cohort.as_deref(), None).await?;
            let assessment = report::assess_cohort(&records, &engine.extractor, &engine.model)?;
            let markdown = report::build_report(
                cohort.as_deref(),
                chrono::Utc::now().date_naive(),
                &assessment,
            );
            std::fs::write(out, markdown)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Graph { query } => {
            let graph = load_graph(cli.graph.as_deref())?;
            let value = match query {
                GraphQuery::Prerequisites { course } => json!({
                    "course": course,
                    "prerequisites": graph.prerequisites(course),
                    "dependency_depth": graph.dependency_depth(course),
                }),
                GraphQuery::Dependents { course } => json!({
                    "course": course,
                    "dependents": graph.dependents(course),
                }),
                GraphQuery::LearningPath { course } => json!({
                    "target_course": course,
                    "learning_path": graph.learning_path(course),
                }),
                GraphQuery::Critical { courses } => json!({
                    "current_courses": courses,
                    "critical_prerequisites": graph.critical_prerequisites(courses),
                }),
                GraphQuery::Export => json!(graph.export()),
            };
            print_json(&value)?;
        }
    }

    Ok(())
}
