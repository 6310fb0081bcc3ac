//! Pipeline orchestration: layered execution, policy pre-checks, retries,
//! scoring and the final deploy/notify/block decision.
//!
//! Layers run strictly in order, sub-groups of a layer run in order, and only
//! the members of a multi-member parallel group run concurrently. An
//! escalating step stops the pipeline; in a parallel group the stop happens
//! once every member has finished.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::core::agent::DispatchRequest;
use crate::core::confidence::{ConfidenceScore, ConfidenceScorer, StepResult};
use crate::core::layers::{group_by_parallel, resolve_layers};
use crate::core::metrics::{MetricsCollector, RunMetrics};
use crate::core::policy::{EvaluationInput, PolicyEngine, Verdict};
use crate::core::types::{
    ActionNeeded, AgentResult, Decision, Finding, PipelineConfig, PipelineResult, RunContext,
    Severity, StepConfig,
};
use crate::error::ConfigError;
use crate::io::dispatch::Dispatcher;
use crate::io::notify::{Notifier, NotifyContext, NotifyEvent};
use crate::io::prompt::PromptBuilder;

pub const DEFAULT_MAX_RETRIES: u32 = 1;

pub struct Orchestrator<D, N> {
    policy: PolicyEngine,
    dispatcher: D,
    scorer: ConfidenceScorer,
    notifier: N,
    prompts: PromptBuilder,
    max_retries: u32,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<D: Dispatcher, N: Notifier> Orchestrator<D, N> {
    pub fn new(policy: PolicyEngine, dispatcher: D, scorer: ConfidenceScorer, notifier: N) -> Self {
        Self {
            policy,
            dispatcher,
            scorer,
            notifier,
            prompts: PromptBuilder::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            metrics: None,
        }
    }

    /// Extra dispatches allowed when an agent answers `action_needed: retry`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Run every step of `pipeline` and decide whether the change may deploy.
    ///
    /// Only an invalid pipeline definition is an error, and it is reported
    /// before any step is dispatched. Agent and policy failures are folded
    /// into the returned [`PipelineResult`].
    #[instrument(skip_all, fields(steps = pipeline.steps.len()))]
    pub async fn run_pipeline(
        &self,
        pipeline: &PipelineConfig,
        context: &RunContext,
    ) -> Result<PipelineResult, ConfigError> {
        let started = Instant::now();
        let layers = resolve_layers(&pipeline.steps)?;
        info!(layers = layers.len(), "pipeline resolved");

        let mut step_results: BTreeMap<String, AgentResult> = BTreeMap::new();
        let mut block_reasons: Vec<String> = Vec::new();

        for (layer_idx, layer) in layers.iter().enumerate() {
            debug!(
                layer = layer_idx,
                steps = ?layer.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "executing layer"
            );

            for group in group_by_parallel(layer) {
                if let [step] = group.as_slice() {
                    let result = self.execute_with_retry(step, context).await;
                    let escalated = result.action_needed == ActionNeeded::Escalate;
                    if escalated {
                        block_reasons.push(escalation_reason(step, &result));
                    }
                    step_results.insert(step.name.clone(), result);
                    if escalated {
                        let message = format!("Pipeline blocked at step '{}'", step.name);
                        return Ok(self.stop_early(
                            pipeline,
                            step_results,
                            block_reasons,
                            &message,
                            started,
                        ));
                    }
                } else {
                    let results =
                        join_all(group.iter().map(|step| self.execute_with_retry(step, context)))
                            .await;
                    for (step, result) in group.iter().zip(results) {
                        if result.action_needed == ActionNeeded::Escalate {
                            block_reasons.push(escalation_reason(step, &result));
                        }
                        step_results.insert(step.name.clone(), result);
                    }
                }
            }

            if !block_reasons.is_empty() {
                let message = format!("Pipeline blocked after layer {layer_idx}");
                return Ok(self.stop_early(
                    pipeline,
                    step_results,
                    block_reasons,
                    &message,
                    started,
                ));
            }
        }

        let score = self.score(pipeline, &step_results);
        if score.has_critical {
            block_reasons.push("Critical finding detected by confidence scorer.".to_string());
        }
        let confidence = score.score;
        let decision = self.decide(!block_reasons.is_empty(), confidence);
        info!(confidence, decision = decision.as_str(), reason = %score.reason, "pipeline scored");

        let (block_reasons, message) = match decision {
            Decision::Block => {
                let reasons = if block_reasons.is_empty() {
                    vec![format!("Confidence {confidence:.2} below deploy threshold.")]
                } else {
                    block_reasons
                };
                (
                    reasons,
                    "Pipeline blocked: confidence below threshold or critical finding.",
                )
            }
            Decision::Notify => (
                vec![format!("Confidence {confidence:.2} requires human review.")],
                "Pipeline requires human review before deployment.",
            ),
            Decision::Deploy => (Vec::new(), "Pipeline passed; ready for deployment."),
        };

        Ok(self.conclude(
            pipeline,
            step_results,
            decision,
            confidence,
            block_reasons,
            message,
            started,
        ))
    }

    /// Block on the current partial results.
    fn stop_early(
        &self,
        pipeline: &PipelineConfig,
        step_results: BTreeMap<String, AgentResult>,
        block_reasons: Vec<String>,
        message: &str,
        started: Instant,
    ) -> PipelineResult {
        let score = self.score(pipeline, &step_results);
        warn!(reasons = ?block_reasons, "pipeline stopped early");
        self.conclude(
            pipeline,
            step_results,
            Decision::Block,
            score.score,
            block_reasons,
            message,
            started,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn conclude(
        &self,
        pipeline: &PipelineConfig,
        step_results: BTreeMap<String, AgentResult>,
        decision: Decision,
        confidence: f64,
        block_reasons: Vec<String>,
        message: &str,
        started: Instant,
    ) -> PipelineResult {
        let event = match decision {
            Decision::Deploy => NotifyEvent::Deploy,
            Decision::Notify => NotifyEvent::Notify,
            Decision::Block => NotifyEvent::Block,
        };
        let mut notify_context = NotifyContext::new();
        notify_context.insert("confidence".to_string(), confidence.to_string());
        if let Err(err) = self.notifier.notify(event, message, &notify_context) {
            warn!(event = %event, err = %format!("{err:#}"), "notifier failed");
        }

        let result = PipelineResult {
            success: decision == Decision::Deploy,
            confidence,
            decision,
            blocked: decision == Decision::Block,
            block_reasons,
            step_results,
        };
        self.record_metrics(pipeline, &result, started.elapsed());
        result
    }

    fn record_metrics(&self, pipeline: &PipelineConfig, result: &PipelineResult, elapsed: Duration) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let mut run = RunMetrics::started_now();
        run.confidence = result.confidence;
        run.deployed = result.decision == Decision::Deploy;
        run.blocked = result.blocked;
        run.step_count = result.step_results.len();
        run.elapsed = elapsed;
        for step in &pipeline.steps {
            if let Some(step_result) = result.step_results.get(&step.name) {
                run.total_turns = run.total_turns.saturating_add(step_result.turns_used);
                run.steps.insert(step.name.clone(), step_result.confidence);
                metrics.record_turns(&step.skill, step_result.turns_used);
            }
        }
        metrics.record_run(run);
    }

    /// Score recorded results in pipeline step order.
    fn score(
        &self,
        pipeline: &PipelineConfig,
        step_results: &BTreeMap<String, AgentResult>,
    ) -> ConfidenceScore {
        let ordered: Vec<StepResult<'_>> = pipeline
            .steps
            .iter()
            .filter_map(|step| {
                step_results
                    .get(&step.name)
                    .map(|result| (step.name.as_str(), result))
            })
            .collect();
        self.scorer.score(&ordered)
    }

    fn decide(&self, blocked: bool, confidence: f64) -> Decision {
        if blocked || self.policy.should_notify_human(confidence) {
            Decision::Block
        } else if !self.policy.should_auto_deploy_staging(confidence) {
            Decision::Notify
        } else {
            Decision::Deploy
        }
    }

    async fn execute_with_retry(&self, step: &StepConfig, context: &RunContext) -> AgentResult {
        let mut result = self.execute_step(step, context).await;
        let mut retries = 0;
        while result.action_needed == ActionNeeded::Retry && retries < self.max_retries {
            retries += 1;
            warn!(
                step = %step.name,
                retry = retries,
                max_retries = self.max_retries,
                "agent requested retry"
            );
            result = self.execute_step(step, context).await;
        }
        result
    }

    #[instrument(skip_all, fields(step = %step.name, agent = %step.agent))]
    async fn execute_step(&self, step: &StepConfig, context: &RunContext) -> AgentResult {
        if let Some(blocked) = self.policy_precheck(step, context) {
            return blocked;
        }

        let prompt = match self.prompts.build_step(step, context) {
            Ok(prompt) => prompt,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "prompt build failed");
                return AgentResult::escalation(
                    format!("Prompt error: {message}"),
                    vec![Finding::new(Severity::Error, message)],
                );
            }
        };

        // Skills with enough recorded history get a turn budget sized from it.
        let max_turns = self
            .metrics
            .as_ref()
            .map_or(step.max_turns, |m| m.suggested_max_turns(&step.skill, step.max_turns));
        let request = DispatchRequest {
            agent: step.agent,
            label: step.name.clone(),
            prompt,
            system_prompt: None,
            max_turns,
            timeout: Duration::from_secs(step.timeout_secs),
        };

        info!("executing step");
        match self.dispatcher.dispatch(&request).await {
            Ok(result) => {
                info!(
                    completed = result.completed,
                    confidence = result.confidence,
                    action = result.action_needed.as_str(),
                    "step finished"
                );
                result
            }
            Err(err) => {
                warn!(err = %err, "dispatch failed");
                AgentResult::escalation(
                    format!("Dispatch error: {err}"),
                    vec![Finding::new(Severity::Error, err.to_string())],
                )
            }
        }
    }

    fn policy_precheck(&self, step: &StepConfig, context: &RunContext) -> Option<AgentResult> {
        if context.commands.is_empty() && context.file_paths.is_empty() {
            return None;
        }
        let evaluation = self.policy.evaluate(&EvaluationInput {
            commands: context.commands.clone(),
            file_paths: context.file_paths.clone(),
            ..EvaluationInput::default()
        });
        if evaluation.verdict != Verdict::Block {
            return None;
        }
        warn!(step = %step.name, reasons = ?evaluation.reasons, "step blocked by policy");
        let findings = evaluation
            .reasons
            .iter()
            .map(|reason| Finding::new(Severity::Critical, reason.clone()))
            .collect();
        Some(AgentResult::escalation(
            format!("Blocked by policy: {}", evaluation.reasons.join("; ")),
            findings,
        ))
    }
}

fn escalation_reason(step: &StepConfig, result: &AgentResult) -> String {
    format!("Step '{}' escalated: {}", step.name, result.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::Policy;
    use crate::test_support::{
        FailingNotifier, RecordingNotifier, ScriptedDispatch, ScriptedDispatcher, agent_result,
        step,
    };

    fn orchestrator<D: Dispatcher, N: Notifier>(dispatcher: D, notifier: N) -> Orchestrator<D, N> {
        let engine = PolicyEngine::new(Policy::default()).expect("policy");
        Orchestrator::new(engine, dispatcher, ConfidenceScorer::new(), notifier)
    }

    fn pipeline(steps: Vec<StepConfig>) -> PipelineConfig {
        PipelineConfig { steps }
    }

    #[tokio::test]
    async fn high_confidence_deploys() {
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.95)))
            .with("test", ScriptedDispatch::Result(agent_result(0.92)));
        let notifier = RecordingNotifier::default();
        let orch = orchestrator(dispatcher, notifier.clone());
        let result = orch
            .run_pipeline(
                &pipeline(vec![step("analyze", &[]), step("test", &["analyze"])]),
                &RunContext::default(),
            )
            .await
            .expect("run");

        assert_eq!(result.decision, Decision::Deploy);
        assert!(result.success);
        assert!(!result.blocked);
        assert!(result.block_reasons.is_empty());
        assert!((result.confidence - 0.9325).abs() < 0.002);

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, NotifyEvent::Deploy);
        assert!(events[0].2.contains_key("confidence"));
    }

    #[tokio::test]
    async fn middling_confidence_asks_for_review() {
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.7)));
        let notifier = RecordingNotifier::default();
        let orch = orchestrator(dispatcher, notifier.clone());
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");

        assert_eq!(result.decision, Decision::Notify);
        assert!(!result.success);
        assert!(!result.blocked);
        assert_eq!(
            result.block_reasons,
            vec!["Confidence 0.70 requires human review.".to_string()]
        );
        assert_eq!(notifier.events()[0].0, NotifyEvent::Notify);
    }

    #[tokio::test]
    async fn low_confidence_blocks() {
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.3)));
        let orch = orchestrator(dispatcher, RecordingNotifier::default());
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");
        assert_eq!(result.decision, Decision::Block);
        assert!(result.blocked);
        assert_eq!(
            result.block_reasons,
            vec!["Confidence 0.30 below deploy threshold.".to_string()]
        );
    }

    #[tokio::test]
    async fn escalation_stops_later_layers() {
        let mut security = agent_result(0.9);
        security.action_needed = ActionNeeded::Escalate;
        security.summary = "hardcoded credentials".to_string();
        security
            .findings
            .push(Finding::new(Severity::Critical, "AWS key in source"));
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.9)))
            .with("security", ScriptedDispatch::Result(security))
            .with("deploy", ScriptedDispatch::Result(agent_result(1.0)));
        let notifier = RecordingNotifier::default();
        let orch = orchestrator(dispatcher.clone(), notifier.clone());
        let result = orch
            .run_pipeline(
                &pipeline(vec![
                    step("analyze", &[]),
                    step("security", &["analyze"]),
                    step("deploy", &["security"]),
                ]),
                &RunContext::default(),
            )
            .await
            .expect("run");

        assert!(result.blocked);
        assert_eq!(result.decision, Decision::Block);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(
            result.block_reasons,
            vec!["Step 'security' escalated: hardcoded credentials".to_string()]
        );
        assert!(!result.step_results.contains_key("deploy"));
        assert_eq!(dispatcher.calls("deploy"), 0);
        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, NotifyEvent::Block);
        assert_eq!(events[0].1, "Pipeline blocked at step 'security'");
    }

    #[tokio::test]
    async fn parallel_group_waits_for_every_member_before_blocking() {
        let mut fast = agent_result(0.9);
        fast.action_needed = ActionNeeded::Escalate;
        fast.summary = "needs a human".to_string();
        let dispatcher = ScriptedDispatcher::new()
            .with("lint", ScriptedDispatch::Result(fast))
            .with(
                "test",
                ScriptedDispatch::Delayed(Duration::from_millis(50), agent_result(0.8)),
            )
            .with("verify", ScriptedDispatch::Result(agent_result(0.9)));
        let orch = orchestrator(dispatcher.clone(), RecordingNotifier::default());
        let mut lint = step("lint", &[]);
        lint.parallel_group = Some("checks".to_string());
        let mut test = step("test", &[]);
        test.parallel_group = Some("checks".to_string());
        let result = orch
            .run_pipeline(
                &pipeline(vec![lint, test, step("verify", &["lint", "test"])]),
                &RunContext::default(),
            )
            .await
            .expect("run");

        assert!(result.blocked);
        assert!(result.step_results.contains_key("test"));
        assert_eq!(result.step_results["test"].confidence, 0.8);
        assert_eq!(dispatcher.calls("verify"), 0);
        assert_eq!(
            result.block_reasons,
            vec!["Step 'lint' escalated: needs a human".to_string()]
        );
    }

    #[tokio::test]
    async fn retry_is_bounded_and_keeps_last_attempt() {
        let mut retry = agent_result(0.4);
        retry.action_needed = ActionNeeded::Retry;
        let dispatcher = ScriptedDispatcher::new().with_sequence(
            "analyze",
            vec![
                ScriptedDispatch::Result(retry.clone()),
                ScriptedDispatch::Result(retry.clone()),
                ScriptedDispatch::Result(agent_result(0.99)),
            ],
        );
        let orch = orchestrator(dispatcher.clone(), RecordingNotifier::default());
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");

        // Default allows one extra attempt; the third scripted answer is never used.
        assert_eq!(dispatcher.calls("analyze"), 2);
        assert_eq!(result.step_results["analyze"].action_needed, ActionNeeded::Retry);
    }

    #[tokio::test]
    async fn retry_can_recover() {
        let mut retry = agent_result(0.4);
        retry.action_needed = ActionNeeded::Retry;
        let dispatcher = ScriptedDispatcher::new().with_sequence(
            "analyze",
            vec![
                ScriptedDispatch::Result(retry),
                ScriptedDispatch::Result(agent_result(0.95)),
            ],
        );
        let orch = orchestrator(dispatcher.clone(), RecordingNotifier::default()).with_max_retries(3);
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");
        assert_eq!(dispatcher.calls("analyze"), 2);
        assert_eq!(result.decision, Decision::Deploy);
    }

    #[tokio::test]
    async fn policy_block_skips_dispatch() {
        let mut policy = Policy::default();
        policy.hard_stops.critical_paths = vec!["**/secrets/**".to_string()];
        let engine = PolicyEngine::new(policy).expect("policy");
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(1.0)));
        let orch = Orchestrator::new(
            engine,
            dispatcher.clone(),
            ConfidenceScorer::new(),
            RecordingNotifier::default(),
        );
        let context = RunContext {
            file_paths: vec!["config/secrets/db.yaml".to_string()],
            ..RunContext::default()
        };
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &context)
            .await
            .expect("run");

        assert_eq!(dispatcher.calls("analyze"), 0);
        assert!(result.blocked);
        let analyze = &result.step_results["analyze"];
        assert!(analyze.summary.starts_with("Blocked by policy: Hard stop: path"));
        assert_eq!(analyze.findings[0].severity, Severity::Critical);
        assert_eq!(analyze.action_needed, ActionNeeded::Escalate);
    }

    #[tokio::test]
    async fn dispatch_error_becomes_escalation() {
        let dispatcher = ScriptedDispatcher::new().with(
            "analyze",
            ScriptedDispatch::Error(crate::error::DispatchError::Timeout {
                agent: crate::core::agent::AgentKind::Claude,
                timeout: Duration::from_secs(300),
            }),
        );
        let orch = orchestrator(dispatcher, RecordingNotifier::default());
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");

        assert!(result.blocked);
        let analyze = &result.step_results["analyze"];
        assert_eq!(analyze.summary, "Dispatch error: claude timed out after 300s");
        assert_eq!(analyze.findings[0].severity, Severity::Error);
        assert_eq!(
            result.block_reasons,
            vec!["Step 'analyze' escalated: Dispatch error: claude timed out after 300s".to_string()]
        );
    }

    #[tokio::test]
    async fn critical_finding_without_escalation_blocks_at_the_end() {
        let mut analyze = agent_result(0.99);
        analyze
            .findings
            .push(Finding::new(Severity::Critical, "license violation"));
        let dispatcher =
            ScriptedDispatcher::new().with("analyze", ScriptedDispatch::Result(analyze));
        let orch = orchestrator(dispatcher, RecordingNotifier::default());
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");
        assert!(result.blocked);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(
            result.block_reasons,
            vec!["Critical finding detected by confidence scorer.".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_pipeline_fails_before_dispatch() {
        let dispatcher = ScriptedDispatcher::new();
        let notifier = RecordingNotifier::default();
        let orch = orchestrator(dispatcher.clone(), notifier.clone());
        let err = orch
            .run_pipeline(
                &pipeline(vec![step("a", &["b"]), step("b", &["a"])]),
                &RunContext::default(),
            )
            .await
            .expect_err("cycle");
        assert!(matches!(err, ConfigError::CyclicDependency(_)));
        assert_eq!(dispatcher.total_calls(), 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn notifier_failure_does_not_change_verdict() {
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.95)));
        let orch = orchestrator(dispatcher, FailingNotifier);
        let result = orch
            .run_pipeline(&pipeline(vec![step("analyze", &[])]), &RunContext::default())
            .await
            .expect("run");
        assert_eq!(result.decision, Decision::Deploy);
    }

    #[tokio::test]
    async fn metrics_record_runs_and_turns_by_skill() {
        let metrics = Arc::new(MetricsCollector::new());
        let mut analyzed = agent_result(0.95);
        analyzed.turns_used = 4;
        let dispatcher =
            ScriptedDispatcher::new().with("analyze", ScriptedDispatch::Result(analyzed));
        let orch = orchestrator(dispatcher, RecordingNotifier::default())
            .with_metrics(Arc::clone(&metrics));
        let mut analyze = step("analyze", &[]);
        analyze.skill = "code-analysis".to_string();
        orch.run_pipeline(&pipeline(vec![analyze]), &RunContext::default())
            .await
            .expect("run");

        let runs = metrics.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].deployed);
        assert_eq!(runs[0].total_turns, 4);
        assert_eq!(runs[0].step_count, 1);
        assert_eq!(metrics.turn_tracker().history("code-analysis"), vec![4]);
    }

    #[tokio::test]
    async fn huge_turn_counts_saturate_instead_of_overflowing() {
        let metrics = Arc::new(MetricsCollector::new());
        let mut heavy = agent_result(0.95);
        heavy.turns_used = 3_000_000_000;
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(heavy.clone()))
            .with("review", ScriptedDispatch::Result(heavy));
        let orch = orchestrator(dispatcher, RecordingNotifier::default())
            .with_metrics(Arc::clone(&metrics));
        let result = orch
            .run_pipeline(
                &pipeline(vec![step("analyze", &[]), step("review", &["analyze"])]),
                &RunContext::default(),
            )
            .await
            .expect("run");

        assert_eq!(result.step_results.len(), 2);
        let runs = metrics.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].total_turns, u32::MAX);
    }

    #[tokio::test]
    async fn recorded_turn_history_sizes_the_dispatch_budget() {
        let metrics = Arc::new(MetricsCollector::new());
        for turns in [4, 6, 8] {
            metrics.record_turns("code-analysis", turns);
        }
        let dispatcher = ScriptedDispatcher::new()
            .with("analyze", ScriptedDispatch::Result(agent_result(0.95)))
            .with("lint", ScriptedDispatch::Result(agent_result(0.95)));
        let orch = orchestrator(dispatcher.clone(), RecordingNotifier::default())
            .with_metrics(Arc::clone(&metrics));
        let mut analyze = step("analyze", &[]);
        analyze.skill = "code-analysis".to_string();
        analyze.max_turns = 20;
        let mut lint = step("lint", &["analyze"]);
        lint.max_turns = 7;
        orch.run_pipeline(&pipeline(vec![analyze, lint]), &RunContext::default())
            .await
            .expect("run");

        let requests = dispatcher.requests();
        let budget = |label: &str| {
            requests
                .iter()
                .find(|r| r.label == label)
                .map(|r| r.max_turns)
        };
        // Mean 6 with 1.5x headroom.
        assert_eq!(budget("analyze"), Some(9));
        // No history for this skill yet.
        assert_eq!(budget("lint"), Some(7));
    }
}
