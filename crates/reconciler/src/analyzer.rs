//! Drift analysis with an optional advisory collaborator.
//!
//! The analyzer always has a deterministic path: a fixed summary and the
//! mechanical plans from [`CorrectionGenerator`]. An advisor, when present,
//! may replace the summary and contribute plans. Advisor plans are only
//! accepted when they restore expected values on paths that actually
//! drifted; mechanical plans fill every gap.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use driftwatch_core::{
    CorrectionPlan, DriftRecord, FieldPath, FieldType, FieldValue, Patch, PlanSource,
    ShutdownCoordinator, UnitId,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::context::bounded;
use crate::correction::CorrectionGenerator;
use crate::error::{Error, Result};

/// Best-effort text completion service.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Where an analysis came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Advisor,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub summary: String,
    /// At most one plan per drifted unit.
    pub plans: Vec<CorrectionPlan>,
    pub source: AnalysisSource,
    /// Why the advisor was not used, when it was configured.
    pub advisor_error: Option<String>,
}

/// Deterministic summary used whenever the advisor is not.
pub fn fallback_summary(records: &[DriftRecord]) -> String {
    let units = records.iter().map(|record| record.unit).unique().count();
    format!("{} drift items detected across {units} units", records.len())
}

#[derive(Debug, Deserialize)]
struct AdvisorResponse {
    summary: String,
    #[serde(default)]
    corrections: Vec<AdvisorCorrection>,
}

#[derive(Debug, Deserialize)]
struct AdvisorCorrection {
    unit_id: String,
    patch: BTreeMap<String, Value>,
    #[serde(default)]
    explanation: String,
}

/// Summarizes drift and produces correction plans.
pub struct DriftAnalyzer {
    advisor: Option<Arc<dyn Advisor>>,
    timeout: Duration,
    generator: CorrectionGenerator,
}

impl DriftAnalyzer {
    pub fn new(advisor: Option<Arc<dyn Advisor>>, timeout: Duration) -> Self {
        Self {
            advisor,
            timeout,
            generator: CorrectionGenerator,
        }
    }

    /// Analyzer without an advisor.
    pub fn mechanical() -> Self {
        Self::new(None, Duration::from_secs(60))
    }

    pub fn has_advisor(&self) -> bool {
        self.advisor.is_some()
    }

    /// Analyze `records`. Never fails.
    ///
    /// The advisor call is bounded by the analyzer timeout and abandoned when
    /// `shutdown` is initiated.
    pub async fn analyze(
        &self,
        records: &[DriftRecord],
        shutdown: &ShutdownCoordinator,
    ) -> Analysis {
        let mechanical = self.generator.generate_all(records);
        let fallback = |advisor_error: Option<String>| Analysis {
            summary: fallback_summary(records),
            plans: mechanical.clone(),
            source: AnalysisSource::Fallback,
            advisor_error,
        };

        let Some(advisor) = self.advisor.as_ref().filter(|_| !records.is_empty()) else {
            return fallback(None);
        };

        let prompt = build_prompt(records);
        let call = advisor.complete(&prompt);
        let text = match bounded(shutdown, "advisor.complete", self.timeout, call).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "Advisor unavailable, using mechanical analysis");
                return fallback(Some(err.to_string()));
            }
        };

        let response = match parse_response(&text) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Advisor output unusable, using mechanical analysis");
                return fallback(Some(err.to_string()));
            }
        };

        let accepted: BTreeMap<UnitId, CorrectionPlan> = response
            .corrections
            .into_iter()
            .filter_map(|correction| validate(correction, records))
            .map(|plan| (plan.unit, plan))
            .collect();
        info!(
            proposed_units = accepted.len(),
            mechanical_units = mechanical.len(),
            "Advisor analysis accepted"
        );

        let plans = mechanical
            .into_iter()
            .map(|plan| match accepted.get(&plan.unit) {
                Some(advised) => fill_gaps(advised.clone(), plan),
                None => plan,
            })
            .collect();

        let summary = if response.summary.trim().is_empty() {
            fallback_summary(records)
        } else {
            response.summary.trim().to_string()
        };

        Analysis {
            summary,
            plans,
            source: AnalysisSource::Advisor,
            advisor_error: None,
        }
    }
}

fn build_prompt(records: &[DriftRecord]) -> String {
    let items = records
        .iter()
        .map(|record| {
            format!(
                "- unit_id={} resource={} path={} expected={} observed={} severity={}",
                record.unit,
                record.resource,
                record.path,
                record.expected,
                record.actual,
                record.severity
            )
        })
        .join("\n");
    format!(
        "Configuration drift was detected between declared and live state.\n\
         {items}\n\n\
         Respond with a single JSON object: \
         {{\"summary\": string, \"corrections\": [{{\"unit_id\": string, \
         \"patch\": {{\"<dotted.path>\": value}}, \"explanation\": string}}]}}. \
         Corrections must restore the expected value, never the observed one."
    )
}

/// Extract the JSON object from a bare or fenced reply.
fn parse_response(text: &str) -> Result<AdvisorResponse> {
    let body = fenced_body(text).unwrap_or(text);
    let start = body.find('{');
    let end = body.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => body.get(start..=end).unwrap_or(body),
        _ => return Err(Error::advisor("reply contains no JSON object")),
    };
    serde_json::from_str(json).map_err(|e| Error::advisor(format!("malformed reply: {e}")))
}

fn fenced_body(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = text.get(open + 3..)?;
    let body_start = after.find('\n')? + 1;
    let body = after.get(body_start..)?;
    let close = body.find("```")?;
    body.get(..close)
}

/// Whether `value` restores the expected side of `record`.
fn restores(record: &DriftRecord, value: &Value) -> bool {
    let field_type = match record.expected {
        FieldValue::Integer(_) => FieldType::Integer,
        FieldValue::IntegerList(_) => FieldType::IntegerList,
        FieldValue::Text(_) | FieldValue::Absent => FieldType::Text,
    };
    field_type.coerce(value) == record.expected
}

/// Turn an advisor correction into a plan, or discard it.
///
/// The plan's values are taken from the records so the document keeps its
/// declared representation.
fn validate(correction: AdvisorCorrection, records: &[DriftRecord]) -> Option<CorrectionPlan> {
    let Ok(unit) = UnitId::from_str(correction.unit_id.trim()) else {
        debug!(unit_id = %correction.unit_id, "Discarding advice for unknown unit id");
        return None;
    };
    let drifted: Vec<&DriftRecord> = records
        .iter()
        .filter(|record| record.unit == unit && record.is_correctable())
        .collect();
    let first = drifted.first()?;

    let mut origin = Vec::new();
    let mut patch = Patch::new();
    for (raw, value) in &correction.patch {
        let path = FieldPath::parse(raw).ok()?;
        let Some(record) = drifted.iter().find(|record| record.path == path) else {
            debug!(unit = %unit, path = %path, "Discarding advice on a path without drift");
            return None;
        };
        if !restores(record, value) {
            debug!(unit = %unit, path = %path, "Discarding advice that does not restore desired state");
            return None;
        }
        patch.insert(path, record.restore.clone());
        origin.push((*record).clone());
    }
    if patch.is_empty() {
        return None;
    }

    Some(CorrectionPlan {
        unit,
        scope: first.scope.clone(),
        resource: first.resource.clone(),
        patch,
        explanation: correction.explanation,
        origin,
        source: PlanSource::Advisor,
    })
}

/// Add the mechanical entries the advisor left out.
fn fill_gaps(mut advised: CorrectionPlan, mechanical: CorrectionPlan) -> CorrectionPlan {
    let missing = mechanical
        .patch
        .filtered(|path| advised.patch.get(path).is_none());
    if !missing.is_empty() {
        advised.patch.merge(missing);
        let uncovered: Vec<DriftRecord> = mechanical
            .origin
            .into_iter()
            .filter(|record| !advised.origin.contains(record))
            .collect();
        advised.origin.extend(uncovered);
    }
    advised
}

/// Advisor backed by an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct HttpAdvisor {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpAdvisor {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::invalid_config(format!("advisor client: {e}")))?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(endpoint = %self.endpoint, prompt_len = prompt.len(), "Calling advisor");
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&json!({
                "model": self.model,
                "temperature": 0,
                "messages": [
                    {"role": "system", "content": "You analyze Kubernetes configuration drift."},
                    {"role": "user", "content": prompt}
                ]
            }))
            .send()
            .await
            .map_err(|e| Error::advisor(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::advisor(format!("endpoint returned {status}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::advisor(format!("unreadable response: {e}")))?;
        chat.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::advisor("response has no choices"))
    }
}
