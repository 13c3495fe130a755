//! Content analysis
//!
//! Two independent model invocations per request:
//! - lead analysis (intent, sentiment, urgency, a 1-100 lead score, ...)
//! - spam likelihood (0-100)
//!
//! Both fail closed. Unparseable output is retried a fixed number of times,
//! separately from network retries, and every invocation is logged.

mod model;
mod parse;
mod prompt;

pub use model::*;
pub use parse::*;
pub use prompt::*;

use crate::audio::Transcript;
use crate::client::CallContext;
use crate::config::AnalysisConfig;
use crate::db::{AiProcessingLog, Repository};
use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LEAD_ANALYSIS: &str = "lead_analysis";
pub const SPAM_SCORE: &str = "spam_score";

const RAW_LOG_LIMIT: usize = 2000;

/// Everything the analysis stage produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub analysis: LeadAnalysis,
    pub spam_likelihood: i64,
}

/// Runs and audits the analysis invocations for a request
pub struct ContentAnalyzer {
    db: Repository,
    model: Arc<dyn LanguageModel>,
    config: AnalysisConfig,
}

impl ContentAnalyzer {
    pub fn new(db: Repository, model: Arc<dyn LanguageModel>, config: AnalysisConfig) -> Self {
        Self { db, model, config }
    }

    /// Analyze a transcript for one request
    pub async fn analyze(
        &self,
        ctx: &CallContext,
        tenant_id: &str,
        request_id: &str,
        info: &CallContextInfo,
        transcript: &Transcript,
        guidance: Option<&str>,
    ) -> Result<AnalysisOutcome> {
        let prompt = lead_prompt(info, transcript, guidance);
        let analysis = self
            .invoke(
                ctx,
                tenant_id,
                request_id,
                LEAD_ANALYSIS,
                &prompt,
                self.config.max_tokens,
                true,
                parse_lead_analysis,
            )
            .await?;

        let prompt = spam_prompt(info, transcript);
        let spam_likelihood = self
            .invoke(
                ctx,
                tenant_id,
                request_id,
                SPAM_SCORE,
                &prompt,
                self.config.spam_max_tokens,
                false,
                parse_spam_likelihood,
            )
            .await?;

        info!(
            tenant_id,
            request_id,
            lead_score = analysis.lead_score,
            spam_likelihood,
            "Analysis complete"
        );

        Ok(AnalysisOutcome {
            analysis,
            spam_likelihood,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke<T, P>(
        &self,
        ctx: &CallContext,
        tenant_id: &str,
        request_id: &str,
        processing_type: &str,
        prompt: &Prompt,
        max_tokens: u32,
        json_mode: bool,
        parse: P,
    ) -> Result<T>
    where
        T: Serialize,
        P: Fn(&str) -> Result<T>,
    {
        let request = CompletionRequest {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            max_tokens,
            temperature: self.config.temperature,
            json_mode,
        };

        let attempts = self.config.parse_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let raw = match self.model.complete(ctx, &request).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::Parse => {
                    // Empty completion: treat like unparseable output
                    self.log(tenant_id, request_id, processing_type, "parse_error", attempt, json!({
                        "error": e.to_string(),
                    }))
                    .await?;
                    last_error = Some(e);
                    continue;
                }
                Err(e) => {
                    self.log(tenant_id, request_id, processing_type, "failed", attempt, json!({
                        "error": e.to_string(),
                    }))
                    .await?;
                    return Err(e);
                }
            };

            match parse(&raw) {
                Ok(value) => {
                    self.log(tenant_id, request_id, processing_type, "completed", attempt, json!({
                        "model": self.model.model_name(),
                        "result": value,
                    }))
                    .await?;
                    debug!(tenant_id, request_id, processing_type, attempt, "Model output parsed");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        tenant_id,
                        request_id,
                        processing_type,
                        attempt,
                        error = %e,
                        "Unparseable model output"
                    );
                    self.log(tenant_id, request_id, processing_type, "parse_error", attempt, json!({
                        "error": e.to_string(),
                        "raw": truncate(&raw, RAW_LOG_LIMIT),
                    }))
                    .await?;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::AnalysisParse(format!("{} produced no usable output", processing_type))
        }))
    }

    async fn log(
        &self,
        tenant_id: &str,
        request_id: &str,
        processing_type: &str,
        status: &str,
        attempt: u32,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.db
            .insert_ai_log(&AiProcessingLog::new(
                tenant_id,
                request_id,
                processing_type,
                status,
                attempt,
                payload,
            ))
            .await
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
