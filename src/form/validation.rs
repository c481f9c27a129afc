use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bitflags::bitflags;
use futures::channel::oneshot;
use futures::future::{self, AbortHandle, AbortRegistration, Abortable, BoxFuture, Shared};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{Map, Value};

use super::context::{FormContext, InFlightGuard, InFlightToken};
use super::error::{FormError, FormResult, ValidationError, ValidatorFault};
use super::model::Model;
use crate::lock::mutex_lock;

bitflags! {
    /// Options carried by a validate request. Combine with `|`.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ValidateOption: u8 {
        const DEFAULT = 0;
        /// Skip validators flagged asynchronous.
        const IGNORE_ASYNC = 1 << 1;
        /// Validate nodes even if they were never touched.
        const IGNORE_TOUCHED = 1 << 2;
        /// Replay the request into every child.
        const INCLUDE_CHILDREN = 1 << 3;
    }
}

pub type ValidatorResult = Result<Option<ValidationError>, ValidatorFault>;

/// Resolves to the node's published error once the request settles or is
/// superseded. Dropping it before then cancels the request.
pub type ValidationFuture = Pin<Box<dyn Future<Output = Option<ValidationError>> + Send + 'static>>;

pub enum Outcome {
    Ready(ValidatorResult),
    Deferred(BoxFuture<'static, ValidatorResult>),
    Stream(BoxStream<'static, ValidatorResult>),
}

impl Outcome {
    pub fn valid() -> Self {
        Outcome::Ready(Ok(None))
    }

    pub fn invalid(error: ValidationError) -> Self {
        Outcome::Ready(Ok(Some(error)))
    }

    pub fn fault(fault: ValidatorFault) -> Self {
        Outcome::Ready(Err(fault))
    }
}

impl From<ValidatorResult> for Outcome {
    fn from(result: ValidatorResult) -> Self {
        Outcome::Ready(result)
    }
}

type ValidatorFn = Arc<dyn Fn(&Value, &ValidatorContext) -> Outcome + Send + Sync>;

#[derive(Clone)]
pub struct Validator {
    name: Arc<str>,
    is_async: bool,
    run: ValidatorFn,
}

impl Validator {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Value, &ValidatorContext) -> ValidatorResult + Send + Sync + 'static,
    {
        Self::from_fn(false, move |value, ctx| Outcome::Ready(validator(value, ctx)))
    }

    pub fn deferred<F, Fut>(validator: F) -> Self
    where
        F: Fn(&Value, &ValidatorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ValidatorResult> + Send + 'static,
    {
        Self::from_fn(true, move |value, ctx| {
            Outcome::Deferred(validator(value, ctx).boxed())
        })
    }

    pub fn streaming<F, S>(validator: F) -> Self
    where
        F: Fn(&Value, &ValidatorContext) -> S + Send + Sync + 'static,
        S: Stream<Item = ValidatorResult> + Send + 'static,
    {
        Self::from_fn(true, move |value, ctx| {
            Outcome::Stream(validator(value, ctx).boxed())
        })
    }

    pub fn from_fn<F>(is_async: bool, validator: F) -> Self
    where
        F: Fn(&Value, &ValidatorContext) -> Outcome + Send + Sync + 'static,
    {
        Self {
            name: Arc::from("anonymous"),
            is_async,
            run: Arc::new(validator),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn call(&self, value: &Value, ctx: &ValidatorContext) -> Outcome {
        let _scope = ValidatorScope::enter();
        (self.run)(value, ctx)
    }
}

impl Debug for Validator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("name", &self.name)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Cancellation signal handed to validators. A request is cancelled when a
/// newer request on the same node begins or the node leaves its tree.
#[derive(Clone)]
pub struct CancelToken {
    abort: AbortHandle,
    signal: Shared<oneshot::Receiver<()>>,
}

impl CancelToken {
    fn new_pair() -> (Self, CancelTrigger, AbortRegistration) {
        let (abort, registration) = AbortHandle::new_pair();
        let (sender, receiver) = oneshot::channel();
        let token = Self {
            abort: abort.clone(),
            signal: receiver.shared(),
        };
        let trigger = CancelTrigger {
            abort,
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (token, trigger, registration)
    }

    /// A token that is never cancelled.
    pub fn detached() -> Self {
        Self::new_pair().0
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Completes once the request is cancelled. Never completes for requests
    /// that settle normally.
    pub async fn cancelled(&self) {
        if self.signal.clone().await.is_err() {
            future::pending::<()>().await;
        }
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
struct CancelTrigger {
    abort: AbortHandle,
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CancelTrigger {
    fn cancel(&self) {
        self.abort.abort();
        if let Some(sender) = mutex_lock(&self.sender).take() {
            let _ = sender.send(());
        }
    }
}

#[derive(Clone)]
pub struct ValidatorContext {
    model: Model,
    token: CancelToken,
}

impl ValidatorContext {
    pub fn new(model: Model, token: CancelToken) -> Self {
        Self { model, token }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn owner(&self) -> Option<Model> {
        self.model.owner()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Raw values of the named siblings. An empty `names` selects the whole
    /// section; names that do not exist are left out.
    pub fn get_section_value(&self, names: &[&str]) -> FormResult<Map<String, Value>> {
        let owner = self.owner().ok_or(FormError::MissingSectionContext)?;
        let section = match owner.get_raw_value() {
            Value::Object(map) => map,
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, value)| (index.to_string(), value))
                .collect(),
            _ => Map::new(),
        };
        if names.is_empty() {
            return Ok(section);
        }
        Ok(section
            .into_iter()
            .filter(|(key, _)| names.contains(&key.as_str()))
            .collect())
    }

    pub fn get_form_value(&self) -> FormResult<Value> {
        self.model
            .core()
            .context()
            .ok_or(FormError::MissingFormContext)?
            .form_value()
    }
}

thread_local! {
    static VALIDATOR_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct ValidatorScope;

impl ValidatorScope {
    fn enter() -> Self {
        VALIDATOR_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ValidatorScope
    }
}

impl Drop for ValidatorScope {
    fn drop(&mut self) {
        VALIDATOR_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub(crate) fn ensure_not_validating(operation: &'static str) -> FormResult<()> {
    if VALIDATOR_DEPTH.with(Cell::get) > 0 {
        return Err(FormError::ReentrantMutation(operation));
    }
    Ok(())
}

/// Polls a validator's future or stream inside a validator scope.
struct InValidator<T>(T);

impl<F: Future + Unpin> Future for InValidator<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _scope = ValidatorScope::enter();
        self.0.poll_unpin(cx)
    }
}

impl<S: Stream + Unpin> Stream for InValidator<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
        let _scope = ValidatorScope::enter();
        self.0.poll_next_unpin(cx)
    }
}

struct Request {
    ticket: u64,
    trigger: CancelTrigger,
    tokens: Arc<Mutex<Vec<InFlightToken>>>,
}

impl Request {
    fn cancel(self) {
        self.trigger.cancel();
        for token in mutex_lock(&self.tokens).drain(..) {
            token.release();
        }
    }
}

struct Started {
    ticket: u64,
    token: CancelToken,
    registration: AbortRegistration,
    tokens: Arc<Mutex<Vec<InFlightToken>>>,
    previous: Option<Request>,
}

#[derive(Default)]
struct PipelineState {
    ticket: u64,
    current: Option<Request>,
}

/// Per-node validate-request state: latest request wins.
#[derive(Default)]
pub(crate) struct Pipeline {
    state: Mutex<PipelineState>,
}

impl Pipeline {
    fn begin(&self) -> Started {
        let (token, trigger, registration) = CancelToken::new_pair();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let mut state = mutex_lock(&self.state);
        state.ticket += 1;
        let ticket = state.ticket;
        let previous = state.current.replace(Request {
            ticket,
            trigger,
            tokens: tokens.clone(),
        });
        Started {
            ticket,
            token,
            registration,
            tokens,
            previous,
        }
    }

    fn is_current(&self, ticket: u64) -> bool {
        mutex_lock(&self.state).ticket == ticket
    }

    fn finish(&self, ticket: u64) {
        let mut state = mutex_lock(&self.state);
        if state
            .current
            .as_ref()
            .is_some_and(|request| request.ticket == ticket)
        {
            state.current = None;
        }
    }

    /// Cancels the request `ticket` if it is still outstanding. Later
    /// requests are left alone.
    fn abandon(&self, ticket: u64) {
        let request = {
            let mut state = mutex_lock(&self.state);
            let outstanding = state
                .current
                .as_ref()
                .is_some_and(|request| request.ticket == ticket);
            if outstanding {
                state.current.take()
            } else {
                None
            }
        };
        if let Some(request) = request {
            tracing::debug!(ticket, "validate request dropped before settling");
            request.cancel();
        }
    }

    /// Cancels the outstanding request, if any, and invalidates its ticket.
    pub(crate) fn cancel(&self) {
        let previous = {
            let mut state = mutex_lock(&self.state);
            state.ticket += 1;
            state.current.take()
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        mutex_lock(&self.state).current.is_some()
    }
}

/// Runs the node's own validators for one request and publishes the outcome.
pub(crate) fn run_validators(model: &Model, option: ValidateOption) -> ValidationFuture {
    let core = model.core();
    if !option.contains(ValidateOption::IGNORE_TOUCHED) && !model.touched() {
        return future::ready(core.error.get()).boxed();
    }
    core.requests.emit(&option);

    let validators = core
        .validators()
        .into_iter()
        .filter(|validator| {
            !(option.contains(ValidateOption::IGNORE_ASYNC) && validator.is_async())
        })
        .collect::<VecDeque<_>>();
    let value = model.get_raw_value();
    let Started {
        ticket,
        token,
        registration,
        tokens,
        previous,
    } = core.pipeline.begin();
    tracing::debug!(
        model = model.id().0,
        ticket,
        validators = validators.len(),
        superseding = previous.is_some(),
        "validate request started"
    );
    core.error.set(None);

    let mut run = Run {
        model: model.clone(),
        ticket,
        value,
        context: ValidatorContext::new(model.clone(), token),
        form: core.context(),
        remaining: validators,
        tokens,
    };
    let pending = run.step_sync();

    if let Some(previous) = previous {
        tracing::debug!(
            model = model.id().0,
            ticket = previous.ticket,
            "validate request superseded"
        );
        previous.cancel();
    }

    match pending {
        None => {
            run.settle();
            future::ready(core.error.get()).boxed()
        }
        Some(pending) => {
            let model = model.clone();
            let execution = Abortable::new(run.finish(pending), registration);
            let abandon = AbandonOnDrop {
                model: model.clone(),
                ticket,
            };
            async move {
                let _abandon = abandon;
                let _ = execution.await;
                model.core().error.get()
            }
            .boxed()
        }
    }
}

/// Cancels the request when its future is dropped before settling.
struct AbandonOnDrop {
    model: Model,
    ticket: u64,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.model.core().pipeline.abandon(self.ticket);
    }
}

enum Pending {
    Deferred(BoxFuture<'static, ValidatorResult>, InFlightGuard),
    Stream(BoxStream<'static, ValidatorResult>, InFlightGuard),
}

struct Run {
    model: Model,
    ticket: u64,
    value: Value,
    context: ValidatorContext,
    form: Option<Arc<FormContext>>,
    remaining: VecDeque<Validator>,
    tokens: Arc<Mutex<Vec<InFlightToken>>>,
}

impl Run {
    /// Calls validators until one returns asynchronously or the run stops.
    fn step_sync(&mut self) -> Option<(Pending, String)> {
        while let Some(validator) = self.remaining.pop_front() {
            match validator.call(&self.value, &self.context) {
                Outcome::Ready(result) => {
                    if self.settle_one(validator.name(), result) {
                        self.remaining.clear();
                        return None;
                    }
                }
                Outcome::Deferred(future) => {
                    let pending = Pending::Deferred(future, self.track());
                    return Some((pending, validator.name().to_string()));
                }
                Outcome::Stream(stream) => {
                    let pending = Pending::Stream(stream, self.track());
                    return Some((pending, validator.name().to_string()));
                }
            }
        }
        None
    }

    /// Drives the asynchronous remainder. A settled execution stays in the
    /// in-flight set until the next one of the request has registered.
    async fn finish(mut self, pending: (Pending, String)) {
        let mut pending = pending;
        loop {
            let (execution, name) = pending;
            let (stop, guard) = match execution {
                Pending::Deferred(future, guard) => {
                    let result = InValidator(future).await;
                    (self.settle_one(&name, result), guard)
                }
                Pending::Stream(stream, guard) => {
                    let mut stream = InValidator(stream);
                    let mut last = None;
                    while let Some(result) = stream.next().await {
                        match result {
                            Ok(outcome) => {
                                last = outcome.clone();
                                self.publish(outcome);
                            }
                            Err(fault) => {
                                last = None;
                                self.report(&name, fault);
                                break;
                            }
                        }
                    }
                    (last.is_some(), guard)
                }
            };
            let next = if stop { None } else { self.step_sync() };
            drop(guard);
            match next {
                Some(next) => pending = next,
                None => break,
            }
        }
        self.settle();
    }

    fn track(&self) -> InFlightGuard {
        let token = InFlightToken::register(self.form.clone());
        mutex_lock(&self.tokens).push(token.clone());
        InFlightGuard(token)
    }

    fn settle_one(&self, name: &str, result: ValidatorResult) -> bool {
        match result {
            Ok(outcome) => {
                let stop = outcome.is_some();
                self.publish(outcome);
                stop
            }
            Err(fault) => {
                self.report(name, fault);
                false
            }
        }
    }

    fn publish(&self, outcome: Option<ValidationError>) {
        let core = self.model.core();
        if core.pipeline.is_current(self.ticket) {
            core.error.set_if_changed(outcome);
        }
    }

    fn report(&self, name: &str, fault: ValidatorFault) {
        match &self.form {
            Some(form) => form.report_fault(&self.model, name, fault),
            None => tracing::error!(
                model = self.model.id().0,
                validator = name,
                "{fault}"
            ),
        }
    }

    fn settle(&self) {
        let core = self.model.core();
        core.pipeline.finish(self.ticket);
        tracing::debug!(
            model = self.model.id().0,
            ticket = self.ticket,
            invalid = core.error.with(Option::is_some),
            "validate request settled"
        );
    }
}
