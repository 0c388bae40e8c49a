//! The `generate_cases` job: requirement images in, test cases out.
//!
//! 1. every image is analysed by the model (retried, failures skipped),
//!    progress `0..=80`
//! 2. the analyses are merged into one summary; if that fails the first
//!    analysis stands in for it
//! 3. test cases are generated from the summary, progress 90
//! 4. raw cases are shaped into [`TestCase`]s

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use casegen_core::FileId;
use casegen_tasks::{BatchPipeline, ResilientCaller, ResultUpdate, TaskHandle, TaskStore};

use crate::case::TestCase;
use crate::error::GenerationError;
use crate::job::AiJob;
use crate::model::{ImageRef, RequirementModel};

pub const TASK_TYPE: &str = "generate_cases";

const ANALYSIS_PROGRESS_SPAN: usize = 80;
const GENERATION_PROGRESS: u8 = 90;

pub struct GenerateCasesJob {
    project_name: String,
    module_name: Option<String>,
    file_id: FileId,
    images: Vec<ImageRef>,
    model: Arc<dyn RequirementModel>,
    caller: ResilientCaller,
}

impl std::fmt::Debug for GenerateCasesJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateCasesJob")
            .field("project_name", &self.project_name)
            .field("module_name", &self.module_name)
            .field("file_id", &self.file_id)
            .field("images", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl GenerateCasesJob {
    pub fn new(
        project_name: impl Into<String>,
        file_id: FileId,
        images: Vec<ImageRef>,
        model: Arc<dyn RequirementModel>,
        caller: ResilientCaller,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            module_name: None,
            file_id,
            images,
            model,
            caller,
        }
    }

    pub fn with_module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }

    fn hint(&self) -> String {
        match self.module_name.as_deref() {
            Some(module) if !module.trim().is_empty() => format!("module: {module}"),
            _ => String::new(),
        }
    }

    async fn generate<S: TaskStore + 'static>(self, task: TaskHandle<S>) -> anyhow::Result<Value> {
        let hint = self.hint();
        let model = self.model.clone();
        let analyze = self.caller.named("analyze_image");

        let report = BatchPipeline::new(format!("images:{}", self.file_id))
            .run(
                self.images,
                |_, image| {
                    let model = model.clone();
                    let analyze = analyze.clone();
                    let hint = hint.clone();
                    async move { analyze.call(|| model.analyze_image(&image, &hint)).await }
                },
                |done, total| {
                    let task = task.clone();
                    async move {
                        let progress = (done * ANALYSIS_PROGRESS_SPAN / total) as u8;
                        task.report(
                            progress,
                            ResultUpdate::Progress {
                                stage: "analyzing_images".to_string(),
                                completed: done,
                                total,
                            },
                        )
                        .await;
                    }
                },
            )
            .await?;

        let analyzed = report.results().len();
        let skipped = report.failures().len();
        if skipped > 0 {
            task.record(ResultUpdate::ItemErrors(report.failures().to_vec()))
                .await;
        }

        let summarize = self.caller.named("summarize_requirements");
        let summary_model = model.clone();
        let consolidated = report
            .consolidate(|analyses| async move {
                summarize.call(|| summary_model.summarize(&analyses)).await
            })
            .await;
        let summary = consolidated.value;
        if summary.trim().is_empty() {
            return Err(GenerationError::EmptySummary.into());
        }

        task.report(
            GENERATION_PROGRESS,
            ResultUpdate::fields(json!({ "stage": "generating_cases" })),
        )
        .await;

        let generate = self.caller.named("generate_cases");
        let raw_cases = generate
            .call(|| model.generate_cases(&summary))
            .await
            .context("test case generation failed")?;

        let module = self.module_name.as_deref();
        let cases: Vec<TestCase> = raw_cases
            .iter()
            .map(|raw| TestCase::from_model_value(&self.project_name, module, raw))
            .collect();
        if cases.is_empty() {
            warn!(task_id = %task.task_id(), file_id = %self.file_id, "model returned no test cases");
            return Err(GenerationError::NoCases.into());
        }

        info!(
            task_id = %task.task_id(),
            file_id = %self.file_id,
            cases = cases.len(),
            analyzed_images = analyzed,
            skipped_images = skipped,
            "test cases generated"
        );

        Ok(json!({
            "summary": summary,
            "summary_aggregated": consolidated.aggregated,
            "cases": cases,
            "analyzed_images": analyzed,
            "skipped_images": skipped,
        }))
    }
}

impl AiJob for GenerateCasesJob {
    fn task_type(&self) -> &'static str {
        TASK_TYPE
    }

    fn context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("project_name".to_string(), json!(self.project_name));
        if let Some(module) = &self.module_name {
            context.insert("module_name".to_string(), json!(module));
        }
        context.insert("file_id".to_string(), json!(self.file_id.to_string()));
        context.insert("image_count".to_string(), json!(self.images.len()));
        context
    }

    fn run<S: TaskStore + 'static>(
        self,
        task: TaskHandle<S>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send {
        self.generate(task)
    }
}
