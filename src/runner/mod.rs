//! # Run Engine
//!
//! Drives a flattened collection through its iterations and reports every
//! step as a [`RunEvent`]. A run is created by [`Runner::run`], which does
//! all validation up front, and executed by [`Run::start`].
//!
//! Pause and abort are observed between steps. An abort also interrupts an
//! in-flight request and any pending delay.

pub mod control;
pub mod events;
pub mod options;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collections::{Collection, CollectionError, RunnableItem};
use crate::environment::{VariableList, VariableScopes};
use crate::auth::AuthHandshake;
use crate::history::ExecutionHistory;
use crate::http::client::Requester;
use crate::http::policy::RequestPolicy;
use crate::http::request::ResolvedRequest;
use crate::http::response::ResponseRecord;
use crate::http::RequestError;
use crate::scripts::{run_scripts, NextRequest, ScriptContext, ScriptEvent, ScriptOutcome, ScriptSignal};
use crate::summary::{FailureSource, RunFailure, RunStatus, RunSummary};

pub use control::{ControlListener, ControlState, RunHandle};
pub use events::{Cursor, ItemRef, RunEvent};
pub use options::{RunOptions, RunnerOptions};

/// Failure to set up a run. Nothing has been emitted when this is returned.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error("Invalid run options: {0}")]
    Options(String),
    #[error("Failed to set up requester: {0}")]
    Requester(String),
}

pub struct Runner {
    options: RunnerOptions,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Validate `options` against `collection` and prepare a run.
    pub fn run(&self, collection: &Collection, options: RunOptions) -> Result<Run, RunError> {
        let items = collection.runnable_items(options.entrypoint.as_ref())?;

        if options.abort_on_error && options.stop_on_error {
            return Err(RunError::Options(
                "abortOnError and stopOnError are mutually exclusive".into(),
            ));
        }
        if options.iteration_count == Some(0) {
            return Err(RunError::Options("iterationCount must be at least 1".into()));
        }

        let mut requester_options = options
            .requester
            .clone()
            .unwrap_or_else(|| self.options.requester.clone());
        if options.request_timeout_ms.is_some() {
            requester_options.timeout_ms = options.request_timeout_ms;
        }
        let requester = Requester::new(requester_options).map_err(RunError::Requester)?;

        Ok(Run {
            id: Uuid::new_v4().to_string(),
            collection_name: collection.info.name.clone(),
            collection_variables: collection.variables.clone(),
            items,
            options,
            requester,
            handle: RunHandle::new(),
        })
    }
}

/// A prepared run. Consumed by [`Run::start`].
pub struct Run {
    id: String,
    collection_name: String,
    collection_variables: VariableList,
    items: Vec<RunnableItem>,
    options: RunOptions,
    requester: Requester,
    handle: RunHandle,
}

impl Run {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn items(&self) -> &[RunnableItem] {
        &self.items
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// Execute the run to completion. Events go to `events`; a dropped
    /// receiver does not stop the run.
    pub async fn start(self, events: mpsc::UnboundedSender<RunEvent>) -> RunSummary {
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = self.options.global_timeout_ms.filter(|ms| *ms > 0).map(|ms| {
            let handle = self.handle.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                flag.store(true, Ordering::SeqCst);
                handle.abort();
            })
        });

        let cycles = self.options.iterations();
        let mut scopes = VariableScopes {
            globals: self.options.globals.clone(),
            collection: self.collection_variables.clone(),
            environment: self.options.environment.clone(),
            ..Default::default()
        };
        let mut engine = Engine {
            summary: RunSummary::new(&self.id, &self.collection_name),
            cursor: Cursor::new(&self.id, self.items.len(), cycles),
            control: self.handle.listener(),
            run: &self,
            events,
        };

        info!(
            run_id = %self.id,
            collection = %self.collection_name,
            items = self.items.len(),
            iterations = cycles,
            "run started"
        );
        let status = engine.drive(&mut scopes, cycles).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        let (status, error) = if status == RunStatus::Aborted && timed_out.load(Ordering::SeqCst) {
            let ms = self.options.global_timeout_ms.unwrap_or_default();
            (RunStatus::TimedOut, Some(format!("Run timed out after {ms}ms")))
        } else {
            (status, None)
        };

        if status == RunStatus::Aborted || status == RunStatus::TimedOut {
            engine.emit(RunEvent::Abort {
                cursor: engine.cursor.clone(),
            });
        }
        if let Some(message) = &error {
            engine.summary.record_failure(RunFailure {
                iteration: engine.cursor.iteration,
                item_id: None,
                item_name: None,
                source: FailureSource::Run,
                message: message.clone(),
            });
        }
        engine.emit(RunEvent::Done {
            cursor: engine.cursor.clone(),
            error: error.clone(),
        });

        let mut summary = engine.summary;
        summary.error = error;
        summary.environment = scopes.environment;
        summary.globals = scopes.globals;
        summary.collection_variables = scopes.collection;
        summary.finish(status);

        info!(
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            failures = summary.failures.len(),
            duration_ms = summary.duration_ms,
            "run finished"
        );
        summary
    }
}


/// Why the item loop ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Stop,
    Abort,
}

impl Halt {
    fn worst(a: Option<Halt>, b: Option<Halt>) -> Option<Halt> {
        match (a, b) {
            (Some(Halt::Abort), _) | (_, Some(Halt::Abort)) => Some(Halt::Abort),
            (Some(Halt::Stop), _) | (_, Some(Halt::Stop)) => Some(Halt::Stop),
            _ => None,
        }
    }
}

struct ItemFlow {
    next: Option<NextRequest>,
    halt: Option<Halt>,
}

impl ItemFlow {
    fn aborted() -> Self {
        Self {
            next: None,
            halt: Some(Halt::Abort),
        }
    }
}

type PreparedRequest = (ResolvedRequest, Option<AuthHandshake>, RequestPolicy);

struct Engine<'r> {
    run: &'r Run,
    events: mpsc::UnboundedSender<RunEvent>,
    control: ControlListener,
    cursor: Cursor,
    summary: RunSummary,
}

impl Engine<'_> {
    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    async fn drive(&mut self, scopes: &mut VariableScopes, cycles: u32) -> RunStatus {
        self.emit(RunEvent::Start {
            cursor: self.cursor.clone(),
        });

        for iteration in 0..cycles {
            self.cursor.seek(0, iteration);
            if !self.checkpoint().await {
                return RunStatus::Aborted;
            }

            scopes.data = self
                .run
                .options
                .data_row(iteration)
                .map(VariableList::from_data_row)
                .unwrap_or_default();
            self.emit(RunEvent::BeforeIteration {
                cursor: self.cursor.clone(),
            });

            let halt = self.run_iteration(scopes, iteration).await;
            if halt == Some(Halt::Abort) {
                return RunStatus::Aborted;
            }

            self.emit(RunEvent::Iteration {
                cursor: self.cursor.clone(),
            });
            let failed = self.summary.failures.iter().any(|f| f.iteration == iteration);
            self.summary.stats.iterations.record(failed);

            if halt == Some(Halt::Stop) {
                return RunStatus::Stopped;
            }
            if iteration + 1 < cycles && !self.delay(self.run.options.iteration_delay_ms).await {
                return RunStatus::Aborted;
            }
        }

        RunStatus::Completed
    }

    async fn run_iteration(&mut self, scopes: &mut VariableScopes, iteration: u32) -> Option<Halt> {
        let run = self.run;
        let items = &run.items;
        let mut position = 0;

        while position < items.len() {
            self.cursor.seek(position, iteration);
            if !self.checkpoint().await {
                return Some(Halt::Abort);
            }

            scopes.local.clear();
            let flow = self.run_item(&items[position], scopes).await;
            if flow.halt.is_some() {
                return flow.halt;
            }

            position = match flow.next {
                None => position + 1,
                Some(NextRequest::EndIteration) => break,
                Some(NextRequest::Item(target)) => {
                    match items.iter().position(|item| item.id == target || item.name == target) {
                        Some(index) => index,
                        None => {
                            warn!(target = %target, "next request not found, ending iteration");
                            break;
                        }
                    }
                }
            };

            if position < items.len() && !self.delay(run.options.item_delay_ms).await {
                return Some(Halt::Abort);
            }
        }

        None
    }

    async fn run_item(&mut self, item: &RunnableItem, scopes: &mut VariableScopes) -> ItemFlow {
        let item_ref = ItemRef::from(item);
        let failures_before = self.summary.failures.len();

        self.emit(RunEvent::BeforeItem {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
        });

        // Pre-request scripts
        if !self.checkpoint().await {
            return ItemFlow::aborted();
        }
        self.emit(RunEvent::BeforePrerequest {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
        });
        let pre = run_scripts(
            &item.scripts,
            &mut ScriptContext {
                event: ScriptEvent::Prerequest,
                scopes: &mut *scopes,
                response: None,
                cookies: &[],
            },
        );
        self.report_signals(&pre, &item_ref);
        self.emit(RunEvent::Prerequest {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
            error: pre.error.clone(),
        });
        let mut next = pre.next_request.clone();
        let mut halt = self.tally_scripts(&pre, item, FailureSource::Prerequest);
        if halt == Some(Halt::Abort) {
            return ItemFlow::aborted();
        }

        if pre.skip_request {
            debug!(item = %item_ref.path, "request skipped by pre-request script");
            self.summary.stats.skipped_items += 1;
            self.finish_item(item_ref, true, failures_before);
            return ItemFlow { next, halt };
        }

        // Request
        if !self.checkpoint().await {
            return ItemFlow::aborted();
        }
        let prepared = self.prepare_request(item, scopes, &pre);
        self.emit(RunEvent::BeforeRequest {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
            request: prepared.as_ref().ok().map(|(request, _, _)| request.clone()),
        });

        let run = self.run;
        let (sent, result, history) = match prepared {
            Ok((request, handshake, policy)) => {
                let outcome = run
                    .requester
                    .execute(request, handshake, &policy, &mut self.control)
                    .await;
                debug!(
                    item = %item_ref.path,
                    exchanges = outcome.history.len(),
                    elapsed_ms = outcome.elapsed_ms,
                    "request executed"
                );
                (Some(outcome.request), outcome.result, outcome.history)
            }
            Err(err) => (None, Err(err), ExecutionHistory::new()),
        };
        if matches!(result, Err(RequestError::Cancelled)) || self.control.is_aborted() {
            return ItemFlow::aborted();
        }

        self.emit(RunEvent::Request {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
            error: result.as_ref().err().map(ToString::to_string),
            request: sent.clone(),
            response: result.as_ref().ok().cloned(),
            history,
        });
        let request_halt = self.tally_request(&result, item);
        halt = Halt::worst(halt, request_halt);
        if halt == Some(Halt::Abort) {
            return ItemFlow::aborted();
        }

        // Test scripts
        if !self.checkpoint().await {
            return ItemFlow::aborted();
        }
        self.emit(RunEvent::BeforeTest {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
        });
        let cookies = sent
            .as_ref()
            .map(|request| run.requester.cookies_for(&request.url))
            .unwrap_or_default();
        let test = run_scripts(
            &item.scripts,
            &mut ScriptContext {
                event: ScriptEvent::Test,
                scopes: &mut *scopes,
                response: result.as_ref().ok(),
                cookies: &cookies,
            },
        );
        self.report_signals(&test, &item_ref);
        self.emit(RunEvent::Test {
            cursor: self.cursor.clone(),
            item: item_ref.clone(),
            error: test.error.clone(),
        });
        if test.next_request.is_some() {
            next = test.next_request.clone();
        }
        halt = Halt::worst(halt, self.tally_scripts(&test, item, FailureSource::Test));
        if halt == Some(Halt::Abort) {
            return ItemFlow::aborted();
        }

        self.finish_item(item_ref, false, failures_before);
        ItemFlow { next, halt }
    }

    fn prepare_request(
        &self,
        item: &RunnableItem,
        scopes: &VariableScopes,
        pre: &ScriptOutcome,
    ) -> Result<PreparedRequest, RequestError> {
        let disable_pruning = item.protocol_profile.disable_body_pruning.unwrap_or(false);
        let mut request = item.request.resolve(scopes, disable_pruning)?;
        let handshake = match &item.auth {
            Some(auth) => auth.interpolated(scopes).apply(&mut request)?,
            None => None,
        };
        for op in &pre.header_ops {
            op.apply(&mut request);
        }
        self.run.requester.prepare(&mut request);
        let policy = RequestPolicy::new(self.run.requester.options(), &item.protocol_profile)?;
        Ok((request, handshake, policy))
    }

    fn finish_item(&mut self, item: ItemRef, skipped: bool, failures_before: usize) {
        let failed = self.summary.failures.len() > failures_before;
        self.summary.stats.items.record(failed);
        self.emit(RunEvent::Item {
            cursor: self.cursor.clone(),
            item,
            skipped,
        });
    }

    fn report_signals(&self, outcome: &ScriptOutcome, item: &ItemRef) {
        for signal in &outcome.signals {
            let event = match signal {
                ScriptSignal::Console { level, message } => RunEvent::Console {
                    cursor: self.cursor.clone(),
                    level: *level,
                    message: message.clone(),
                },
                ScriptSignal::Assertion(result) => RunEvent::Assertion {
                    cursor: self.cursor.clone(),
                    item: item.clone(),
                    assertion: result.clone(),
                },
                ScriptSignal::Exception(error) => RunEvent::Exception {
                    cursor: self.cursor.clone(),
                    item: item.clone(),
                    error: error.clone(),
                },
            };
            self.emit(event);
        }
    }

    fn failure(&self, item: &RunnableItem, source: FailureSource, message: String) -> RunFailure {
        RunFailure {
            iteration: self.cursor.iteration,
            item_id: Some(item.id.clone()),
            item_name: Some(item.name.clone()),
            source,
            message,
        }
    }

    /// Record script results and decide whether they end the run.
    fn tally_scripts(&mut self, outcome: &ScriptOutcome, item: &RunnableItem, source: FailureSource) -> Option<Halt> {
        if outcome.scripts_run > 0 {
            let stat = match source {
                FailureSource::Prerequest => &mut self.summary.stats.prerequest_scripts,
                _ => &mut self.summary.stats.test_scripts,
            };
            stat.record(outcome.error.is_some());
        }

        for assertion in &outcome.assertions {
            self.summary.stats.assertions.record(!assertion.passed);
            if !assertion.passed {
                let message = match &assertion.message {
                    Some(message) => format!("{}: {message}", assertion.name),
                    None => assertion.name.clone(),
                };
                let failure = self.failure(item, FailureSource::Assertion, message);
                self.summary.record_failure(failure);
            }
        }

        if let Some(error) = &outcome.error {
            let failure = self.failure(item, source, error.to_string());
            self.summary.record_failure(failure);
        }

        let options = &self.run.options;
        let error_halt = outcome
            .error
            .as_ref()
            .and_then(|_| self.halt_for(options.abort_on_error, options.stop_on_error));
        let failure_halt = (outcome.failed_assertions() > 0)
            .then(|| self.halt_for(options.abort_on_failure, options.stop_on_failure))
            .flatten();
        Halt::worst(error_halt, failure_halt)
    }

    fn tally_request(
        &mut self,
        result: &Result<ResponseRecord, RequestError>,
        item: &RunnableItem,
    ) -> Option<Halt> {
        self.summary.stats.requests.record(result.is_err());
        match result {
            Ok(response) => {
                self.summary.record_response(response.time, response.size);
                None
            }
            Err(err) => {
                debug!(item = %item.name, error = %err, "request failed");
                let failure = self.failure(item, FailureSource::Request, err.to_string());
                self.summary.record_failure(failure);
                let options = &self.run.options;
                self.halt_for(options.abort_on_error, options.stop_on_error)
            }
        }
    }

    fn halt_for(&self, abort: bool, stop: bool) -> Option<Halt> {
        if abort {
            Some(Halt::Abort)
        } else if stop {
            Some(Halt::Stop)
        } else {
            None
        }
    }

    /// Honour pause and abort between steps. Returns false once aborted.
    async fn checkpoint(&mut self) -> bool {
        match self.control.state() {
            ControlState::Running => true,
            ControlState::Aborted => false,
            ControlState::Paused => {
                debug!(run_id = %self.run.id, "run paused");
                self.emit(RunEvent::Pause {
                    cursor: self.cursor.clone(),
                });
                if self.control.wait_while_paused().await == ControlState::Aborted {
                    return false;
                }
                debug!(run_id = %self.run.id, "run resumed");
                self.emit(RunEvent::Resume {
                    cursor: self.cursor.clone(),
                });
                true
            }
        }
    }

    /// Sleep unless aborted first. Returns false once aborted.
    async fn delay(&mut self, ms: u64) -> bool {
        if ms == 0 {
            return !self.control.is_aborted();
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
            _ = self.control.aborted() => false,
        }
    }
}
