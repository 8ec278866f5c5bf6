//! Action execution with scoped bindings and per-action tracing.

use crate::context::EvaluationContext;
use crate::error::{Result, RuleError};
use crate::events::Event;
use crate::facts::FactStore;
use crate::lookups::ServiceRegistry;
use crate::rule::{Action, LogLevel, Rule};
use crate::timers::TimerManager;
use crate::trace::{TraceCollector, TraceEntry, TraceType};
use crate::value;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Summary of one executed action.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Position in the rule's action list.
    pub index: usize,

    /// Action kind, as recorded on traces.
    pub kind: &'static str,

    /// Error message when the action failed.
    pub error: Option<String>,

    /// Execution wall time.
    pub duration_ms: f64,
}

impl ActionOutcome {
    /// Whether the action succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

type EmitFn = Box<dyn Fn(Event) + Send + Sync>;
type FactChangedFn = Box<dyn Fn(crate::facts::FactChange, Option<Event>) + Send + Sync>;

/// Executes a rule's actions in order.
///
/// Each side effect is applied before its trace entry is recorded. A
/// failing action is recorded and the remaining actions still run.
pub struct ActionExecutor {
    facts: Arc<FactStore>,
    timers: Arc<TimerManager>,
    services: Arc<ServiceRegistry>,
    traces: Arc<TraceCollector>,
    emit: EmitFn,
    fact_changed: FactChangedFn,
}

impl ActionExecutor {
    /// Create an executor wired to the engine internals.
    ///
    /// `emit` enqueues derived events; `fact_changed` hands fact mutations
    /// back to the dispatcher together with their causing event.
    pub fn new(
        facts: Arc<FactStore>,
        timers: Arc<TimerManager>,
        services: Arc<ServiceRegistry>,
        traces: Arc<TraceCollector>,
        emit: EmitFn,
        fact_changed: FactChangedFn,
    ) -> Self {
        Self {
            facts,
            timers,
            services,
            traces,
            emit,
            fact_changed,
        }
    }

    /// Execute every action of a rule, in order.
    pub async fn execute_all(
        &self,
        rule: &Rule,
        ctx: &mut EvaluationContext,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(rule.actions.len());

        for (index, action) in rule.actions.iter().enumerate() {
            let kind = action_kind(action);
            self.record(
                rule,
                ctx,
                TraceType::ActionStarted,
                json!({"index": index, "action_type": kind}),
                None,
            );

            let started = Instant::now();
            let result = self.execute(action, rule, ctx).await;
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

            match &result {
                Ok(details) => {
                    self.record(
                        rule,
                        ctx,
                        TraceType::ActionCompleted,
                        json!({
                            "index": index,
                            "action_type": kind,
                            "details": details,
                        }),
                        Some(duration_ms),
                    );
                }
                Err(err) => {
                    warn!("Rule {} action {} failed: {}", rule.id, index, err);
                    self.record(
                        rule,
                        ctx,
                        TraceType::ActionFailed,
                        json!({
                            "index": index,
                            "action_type": kind,
                            "error": err.to_string(),
                        }),
                        Some(duration_ms),
                    );
                }
            }

            outcomes.push(ActionOutcome {
                index,
                kind,
                error: result.err().map(|e| e.to_string()),
                duration_ms,
            });
        }

        outcomes
    }

    async fn execute(
        &self,
        action: &Action,
        rule: &Rule,
        ctx: &mut EvaluationContext,
    ) -> Result<Value> {
        match action {
            Action::SetFact { key, value } => {
                let key = ctx.interpolate(key);

                // A bare ref to an absent source skips the write instead of
                // storing null.
                if let Some(path) = value::as_ref_path(value) {
                    if ctx.resolve(path).is_none() {
                        debug!("Rule {}: set_fact {} skipped, {} is unresolved", rule.id, key, path);
                        return Ok(json!({"key": key, "skipped": "unresolved reference"}));
                    }
                }

                let resolved = ctx.resolve_payload(value);
                let source = format!("rule:{}", rule.id);
                let change = self.facts.set_returning(key.clone(), resolved.clone(), source);
                (self.fact_changed)(change, ctx.trigger.event().cloned());
                Ok(json!({"key": key, "value": resolved}))
            }

            Action::DeleteFact { key } => {
                let key = ctx.interpolate(key);
                let change = self.facts.delete_returning(&key, format!("rule:{}", rule.id));
                let existed = change.is_some();
                if let Some(change) = change {
                    (self.fact_changed)(change, ctx.trigger.event().cloned());
                }
                Ok(json!({"key": key, "existed": existed}))
            }

            Action::IncrementFact { key, by } => {
                let key = ctx.interpolate(key);
                let delta = ctx
                    .resolve_payload(by)
                    .as_f64()
                    .ok_or_else(|| RuleError::validation("increment delta is not numeric"))?;

                let current = match self.facts.get_value(&key) {
                    Some(value) => value.as_f64().ok_or_else(|| {
                        RuleError::validation(format!("fact {key} is not numeric"))
                    })?,
                    None => 0.0,
                };

                let next = json!(current + delta);
                let change =
                    self.facts
                        .set_returning(key.clone(), next.clone(), format!("rule:{}", rule.id));
                (self.fact_changed)(change, ctx.trigger.event().cloned());
                Ok(json!({"key": key, "value": next}))
            }

            Action::EmitEvent { topic, data } => {
                let topic = ctx.interpolate(topic);
                let data = ctx.resolve_payload(data);

                let mut event = Event::new(topic.clone(), data)
                    .with_source(format!("rule:{}", rule.id));
                if let Some(correlation_id) = ctx.trigger.correlation_id() {
                    event = event.with_correlation(correlation_id);
                }
                if let Some(causation_id) = ctx.trigger.causation_id() {
                    event = event.with_causation(causation_id);
                }

                let event_id = event.id;
                (self.emit)(event);
                Ok(json!({"topic": topic, "event_id": event_id}))
            }

            Action::SetTimer { config } => {
                let mut config = config.clone();
                config.name = ctx.interpolate(&config.name);
                config.on_expire.topic = ctx.interpolate(&config.on_expire.topic);
                config.on_expire.data = ctx.resolve_payload(&config.on_expire.data);

                let timer = self.timers.set_timer(config, ctx.trigger.correlation_id())?;
                self.record(
                    rule,
                    ctx,
                    TraceType::TimerSet,
                    json!({"name": timer.name, "expires_at": timer.expires_at}),
                    None,
                );
                Ok(json!({"name": timer.name, "timer_id": timer.id}))
            }

            Action::CancelTimer { name } => {
                let name = ctx.interpolate(name);
                let cancelled = self.timers.cancel_timer(&name);
                if cancelled.is_some() {
                    self.record(
                        rule,
                        ctx,
                        TraceType::TimerCancelled,
                        json!({"name": name}),
                        None,
                    );
                }
                Ok(json!({"name": name, "cancelled": cancelled.is_some()}))
            }

            Action::CallService {
                service,
                method,
                args,
                bind,
            } => {
                let resolved_args: Vec<Value> =
                    args.iter().map(|arg| ctx.resolve_payload(arg)).collect();

                let handle = self
                    .services
                    .get(service)
                    .ok_or_else(|| RuleError::UnknownService(service.clone()))?;
                let result = handle.call(method, &resolved_args).await.map_err(|e| {
                    RuleError::lookup(service, method, e.to_string())
                })?;

                if let Some(bind) = bind {
                    ctx.bind(bind.clone(), result.clone());
                }
                Ok(json!({"service": service, "method": method}))
            }

            Action::Log { level, message } => {
                let message = ctx.interpolate(message);
                match level {
                    LogLevel::Debug => debug!(rule = %rule.id, "{}", message),
                    LogLevel::Info => info!(rule = %rule.id, "{}", message),
                    LogLevel::Warn => warn!(rule = %rule.id, "{}", message),
                    LogLevel::Error => error!(rule = %rule.id, "{}", message),
                }
                Ok(json!({"level": level, "message": message}))
            }
        }
    }

    fn record(
        &self,
        rule: &Rule,
        ctx: &EvaluationContext,
        trace_type: TraceType,
        details: Value,
        duration_ms: Option<f64>,
    ) {
        let mut entry = TraceEntry::new(trace_type, details)
            .with_correlation(ctx.trigger.correlation_id())
            .with_causation(ctx.trigger.causation_id())
            .with_rule(rule.id.clone(), rule.name.clone());
        if let Some(duration_ms) = duration_ms {
            entry = entry.with_duration_ms(duration_ms);
        }
        self.traces.record(entry);
    }
}

/// Stable action kind label for traces and profiles.
pub fn action_kind(action: &Action) -> &'static str {
    match action {
        Action::SetFact { .. } => "set_fact",
        Action::DeleteFact { .. } => "delete_fact",
        Action::IncrementFact { .. } => "increment_fact",
        Action::EmitEvent { .. } => "emit_event",
        Action::SetTimer { .. } => "set_timer",
        Action::CancelTimer { .. } => "cancel_timer",
        Action::CallService { .. } => "call_service",
        Action::Log { .. } => "log",
    }
}
