//! Natural-language explanations.
//!
//! An external collaborator may phrase explanations; when it is absent or
//! fails, deterministic templates built from the structured fields are used
//! instead, so callers always get a sentence back.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::error::{Result, RiskError};
use crate::graph::PropagatedRisk;
use crate::models::{ContributingFactor, InterventionResult, PredictionResult, RiskLevel};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplanationRequest {
    pub probability: f64,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub top_factors: Vec<ContributingFactor>,
    /// Free-text context passed through to the collaborator
    pub context: String,
}

impl ExplanationRequest {
    pub fn from_prediction(prediction: &PredictionResult, context: impl Into<String>) -> Self {
        Self {
            probability: prediction.failure_probability,
            confidence: prediction.confidence,
            risk_level: prediction.risk_level,
            top_factors: prediction.top_factors.clone(),
            context: context.into(),
        }
    }
}

#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, request: &ExplanationRequest) -> Result<String>;
}

/// Runs an external program with the request as JSON on stdin and takes its
/// stdout as the explanation. The program is killed if it outlives the
/// timeout or the exchange fails.
#[derive(Debug, Clone)]
pub struct CommandExplainer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExplainer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Feed the payload and collect the output. Dropping `child` on any early
/// return kills it.
async fn exchange(mut child: Child, payload: &[u8]) -> std::io::Result<Output> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload).await?;
        stdin.flush().await?;
    }
    child.wait_with_output().await
}

#[async_trait]
impl Explainer for CommandExplainer {
    async fn explain(&self, request: &ExplanationRequest) -> Result<String> {
        let unavailable = |reason: String| {
            RiskError::ExplanationUnavailable(format!("{}: {reason}", self.program))
        };
        let payload = serde_json::to_vec(request).map_err(|e| unavailable(e.to_string()))?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(e.to_string()))?;

        let output = tokio::time::timeout(self.timeout, exchange(child, &payload))
            .await
            .map_err(|_| unavailable(format!("no response within {:?}", self.timeout)))?
            .map_err(|e| unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(unavailable(format!("exited with {}", output.status)));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(unavailable("empty response".into()));
        }
        Ok(text)
    }
}

/// Ask the collaborator, substituting the risk template on any failure.
pub async fn explain_with_fallback(
    explainer: Option<&dyn Explainer>,
    request: &ExplanationRequest,
) -> String {
    let Some(explainer) = explainer else {
        return risk_template(request);
    };
    match explainer.explain(request).await {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(error = %err, "explanation collaborator failed, using template");
            risk_template(request)
        }
    }
}

pub fn risk_template(request: &ExplanationRequest) -> String {
    let mut text = format!(
        "The estimated failure risk is {:.1}% ({} risk) with {:.1}% confidence.",
        request.probability * 100.0,
        request.risk_level,
        request.confidence * 100.0
    );
    let factors: Vec<String> = request
        .top_factors
        .iter()
        .take(3)
        .map(|f| f.feature_name.replace('_', " "))
        .collect();
    if !factors.is_empty() {
        text.push_str(&format!(
            " The strongest contributing factors are {}.",
            join_words(&factors)
        ));
    }
    text.push_str(match request.risk_level {
        RiskLevel::High | RiskLevel::Critical => " Immediate attention is recommended.",
        RiskLevel::Medium => " Early intervention can significantly improve the outcome.",
        RiskLevel::Low => " Current patterns look stable.",
    });
    text
}

pub fn intervention_template(result: &InterventionResult, baseline_probability: f64) -> String {
    format!(
        "{} is recommended with an effectiveness of {:.3} per unit of effort: \
         it moves the estimated risk from {:.1}% to {:.1}% at an effort cost of {}.",
        result.description,
        result.effectiveness,
        baseline_probability * 100.0,
        result.resulting_probability * 100.0,
        result.effort_cost
    )
}

pub fn uncertainty_template(prediction: &PredictionResult, data_completeness: f64) -> String {
    let note = if data_completeness < 1.0 {
        " Filling in the missing record fields will sharpen the estimate."
    } else {
        " More observations over time will sharpen the estimate."
    };
    format!(
        "Confidence is {:.1}%, measuring how far the prediction sits from an even chance; \
         the record is {:.0}% complete.{note}",
        prediction.confidence * 100.0,
        data_completeness * 100.0
    )
}

pub fn prerequisite_template(course: &str, risks: &PropagatedRisk) -> String {
    if risks.is_empty() {
        return format!("No significant downstream risk was found for {course}.");
    }
    let mut ranked: Vec<(&String, &f64)> = risks.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let affected: Vec<String> = ranked
        .iter()
        .take(3)
        .map(|(name, risk)| format!("{name} ({:.1}%)", **risk * 100.0))
        .collect();
    format!(
        "Difficulty in {course} carries into later courses: {}. \
         Addressing {course} now prevents compounding gaps.",
        join_words(&affected)
    )
}

/// Overall picture for a student: current risk and the leading recommendations.
pub fn summary_template(prediction: &PredictionResult, recommendations: &[InterventionResult]) -> String {
    let mut text = format!(
        "The current trajectory shows a {:.1}% failure probability ({} risk).",
        prediction.failure_probability * 100.0,
        prediction.risk_level
    );
    let helpful: Vec<String> = recommendations
        .iter()
        .filter(|r| r.risk_reduction > 0.0)
        .take(3)
        .map(|r| r.name.clone())
        .collect();
    if helpful.is_empty() {
        text.push_str(" None of the catalogued interventions is expected to lower it.");
    } else {
        text.push_str(&format!(
            " The most effective next steps are {}. Small, consistent improvements in these \
             areas can lower the risk substantially.",
            join_words(&helpful)
        ));
    }
    text
}

fn join_words(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [first, second] => format!("{first} and {second}"),
        [rest @ .., last] => format!("{}, and {last}", rest.join(", ")),
    }
}
