use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::controller::{FormId, FormModel};
use super::error::{FormError, FormResult};
use crate::lock::{read_lock, write_lock};

/// Persists raw form values between sessions, keyed by form id.
pub trait FormDraftStore<T>: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn save(&self, form_id: FormId, value: &T) -> Result<(), Self::Error>;
    fn load(&self, form_id: FormId) -> Result<Option<T>, Self::Error>;
    fn clear(&self, form_id: FormId) -> Result<(), Self::Error>;
}

#[derive(Clone)]
pub struct InMemoryDraftStore<T> {
    drafts: Arc<RwLock<BTreeMap<FormId, T>>>,
}

impl<T> InMemoryDraftStore<T> {
    pub fn new() -> Self {
        Self {
            drafts: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        read_lock(&self.drafts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for InMemoryDraftStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FormDraftStore<T> for InMemoryDraftStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Error = Infallible;

    fn save(&self, form_id: FormId, value: &T) -> Result<(), Self::Error> {
        write_lock(&self.drafts).insert(form_id, value.clone());
        Ok(())
    }

    fn load(&self, form_id: FormId) -> Result<Option<T>, Self::Error> {
        Ok(read_lock(&self.drafts).get(&form_id).cloned())
    }

    fn clear(&self, form_id: FormId) -> Result<(), Self::Error> {
        write_lock(&self.drafts).remove(&form_id);
        Ok(())
    }
}

impl FormModel {
    pub fn save_draft<S>(&self, store: &S) -> FormResult<()>
    where
        S: FormDraftStore<Value>,
    {
        store
            .save(self.form_id(), &self.get_raw_value())
            .map_err(|error| FormError::DraftSaveFailed(error.to_string()))
    }

    /// Patches the stored draft into the tree. Returns `false` when no draft
    /// exists for this form.
    pub fn load_draft<S>(&self, store: &S) -> FormResult<bool>
    where
        S: FormDraftStore<Value>,
    {
        let Some(draft) = store
            .load(self.form_id())
            .map_err(|error| FormError::DraftLoadFailed(error.to_string()))?
        else {
            return Ok(false);
        };
        self.patch_value(draft)?;
        self.reset_submit_state()?;
        self.submit_count_stream().set(0);
        tracing::debug!(form = self.form_id().0, "draft loaded");
        Ok(true)
    }

    pub fn clear_draft<S>(&self, store: &S) -> FormResult<()>
    where
        S: FormDraftStore<Value>,
    {
        store
            .clear(self.form_id())
            .map_err(|error| FormError::DraftClearFailed(error.to_string()))
    }
}
