use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;

use super::controller::{FormId, FormOptions};
use super::error::{FormError, FormResult, ValidatorFault};
use super::field_set::{FieldSetModel, SetInner};
use super::model::{Model, ModelId};
use crate::lock::{mutex_lock, read_lock, write_lock};
use crate::reactive::{EventStream, StateStream};

static EXECUTION_ID_ALLOCATOR: AtomicU64 = AtomicU64::new(1);

/// Identity of one asynchronous validator execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExecutionId(pub u64);

impl ExecutionId {
    pub fn next() -> Self {
        Self(EXECUTION_ID_ALLOCATOR.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorFaultReport {
    pub model: ModelId,
    pub path: String,
    pub validator: String,
    pub fault: ValidatorFault,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StructureChange {
    pub path: String,
}

/// Set of running asynchronous validator executions plus the derived
/// "is validating" flag. The flag flips only on empty/non-empty transitions.
pub(crate) struct InFlight {
    executions: Mutex<BTreeSet<ExecutionId>>,
    validating: StateStream<bool>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            executions: Mutex::new(BTreeSet::new()),
            validating: StateStream::new(false),
        }
    }

    pub(crate) fn register(&self, id: ExecutionId) {
        let became_busy = {
            let mut executions = mutex_lock(&self.executions);
            executions.insert(id) && executions.len() == 1
        };
        tracing::trace!(execution = id.0, "async validator registered");
        if became_busy {
            self.validating.set(true);
        }
    }

    pub(crate) fn deregister(&self, id: ExecutionId) {
        let became_idle = {
            let mut executions = mutex_lock(&self.executions);
            executions.remove(&id) && executions.is_empty()
        };
        if became_idle {
            self.validating.set(false);
        }
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.executions).len()
    }
}

/// Shared state handed down from a form to every model attached beneath it.
pub(crate) struct FormContext {
    pub(crate) id: FormId,
    pub(crate) options: FormOptions,
    pub(crate) in_flight: InFlight,
    pub(crate) faults: EventStream<ValidatorFaultReport>,
    pub(crate) change: EventStream<StructureChange>,
    root: RwLock<Weak<SetInner>>,
}

impl FormContext {
    pub(crate) fn new(id: FormId, options: FormOptions) -> Self {
        Self {
            id,
            options,
            in_flight: InFlight::new(),
            faults: EventStream::new(),
            change: EventStream::new(),
            root: RwLock::new(Weak::new()),
        }
    }

    pub(crate) fn set_root(&self, root: &FieldSetModel) {
        *write_lock(&self.root) = root.downgrade();
    }

    pub(crate) fn form_value(&self) -> FormResult<Value> {
        read_lock(&self.root)
            .upgrade()
            .map(|inner| FieldSetModel::from_inner(inner).get_raw_value())
            .ok_or(FormError::MissingFormContext)
    }

    pub(crate) fn validating(&self) -> &StateStream<bool> {
        &self.in_flight.validating
    }

    pub(crate) fn report_fault(&self, model: &Model, validator: &str, fault: ValidatorFault) {
        let report = ValidatorFaultReport {
            model: model.id(),
            path: model.path(),
            validator: validator.to_string(),
            fault,
        };
        if self.options.log_validator_faults {
            tracing::error!(
                form = self.id.0,
                model = report.model.0,
                path = %report.path,
                validator = %report.validator,
                "{}",
                report.fault
            );
        }
        self.faults.emit(&report);
    }

    pub(crate) fn notify_change(&self, path: String) {
        self.change.emit(&StructureChange { path });
    }
}

/// Registration of one execution in a form's in-flight set. Releasing is
/// idempotent, so the pipeline and the execution itself may both release.
#[derive(Clone)]
pub(crate) struct InFlightToken {
    form: Option<Arc<FormContext>>,
    id: ExecutionId,
}

impl InFlightToken {
    pub(crate) fn register(form: Option<Arc<FormContext>>) -> Self {
        let id = ExecutionId::next();
        if let Some(form) = &form {
            form.in_flight.register(id);
        }
        Self { form, id }
    }

    pub(crate) fn release(&self) {
        if let Some(form) = &self.form {
            form.in_flight.deregister(self.id);
        }
    }
}

/// Releases its token when dropped, covering executions whose future is
/// dropped before it settles.
pub(crate) struct InFlightGuard(pub(crate) InFlightToken);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}
