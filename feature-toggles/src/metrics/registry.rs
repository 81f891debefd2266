use std::sync::Arc;

use tracing::instrument;

use crate::metrics::metrics_models::{ClientApplication, ClientRegistration};
use crate::metrics_utils::REGISTRATIONS_COUNTER;
use crate::store::{ApplicationStore, StoreError};

/// Tracks which SDK instances have registered, per application.
pub struct ApplicationRegistry {
    store: Arc<dyn ApplicationStore>,
}

impl ApplicationRegistry {
    pub fn new(store: Arc<dyn ApplicationStore>) -> Self {
        ApplicationRegistry { store }
    }

    #[instrument(skip_all, fields(app_name = %registration.app_name))]
    pub async fn register(&self, registration: &ClientRegistration) -> Result<(), StoreError> {
        self.store.upsert_registration(registration).await?;
        metrics::counter!(REGISTRATIONS_COUNTER).increment(1);
        Ok(())
    }

    pub async fn applications(&self) -> Result<Vec<ClientApplication>, StoreError> {
        self.store.list_applications().await
    }
}
