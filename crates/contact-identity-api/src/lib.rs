pub mod config;
mod error;

use contact_identity_core::{ConsolidatedView, Contact, ContactId, Identity};
use contact_identity_store_sqlite::{IntegrityReport, SqliteStore};
use serde::{Deserialize, Serialize};

pub use config::{ConfigError, SslMode, StoreArgs, StoreConfig};
pub use error::{ApiError, ErrorKind};

/// Body of an identify call. Both fields are optional on the wire; at least one must
/// carry a value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<i64>,
}

impl IdentifyRequest {
    /// Decode a JSON request body.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidRequest`] when the body is not a JSON object of the
    /// expected shape.
    pub fn from_json(body: &[u8]) -> Result<Self, ApiError> {
        serde_json::from_slice(body)
            .map_err(|err| ApiError::InvalidRequest(format!("malformed request body: {err}")))
    }

    /// # Errors
    /// Returns [`ApiError::InvalidRequest`] when neither field carries a value.
    pub fn into_identity(self) -> Result<Identity, ApiError> {
        Ok(Identity::new(self.email, self.phone_number)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedView,
}

#[derive(Debug, Clone)]
pub struct IdentityApi {
    config: StoreConfig,
}

impl IdentityApi {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let store = SqliteStore::open_with_busy_timeout(
            &self.config.database_path(),
            self.config.busy_timeout(),
        )
        .map_err(ApiError::StoreUnavailable)?;
        store.ensure_schema().map_err(ApiError::StoreUnavailable)?;
        Ok(store)
    }

    /// Create the contact schema if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`ApiError::StoreUnavailable`] when the store cannot be opened or the
    /// schema cannot be created.
    pub fn init_store(&self) -> Result<(), ApiError> {
        self.open_store().map(|_| ())
    }

    /// Resolve the caller's identity and return the consolidated contact.
    ///
    /// # Errors
    /// Returns [`ApiError::InvalidRequest`] for an empty identity, store error kinds when
    /// persistence fails, and [`ApiError::Internal`] when stored rows are inconsistent.
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse, ApiError> {
        let identity = request.into_identity()?;
        let mut store = self.open_store()?;
        let resolution = store.resolve(&identity)?;

        if let Some(created) = resolution.created {
            tracing::info!(
                contact_id = %created.id,
                link_precedence = created.link_precedence.as_str(),
                primary_contact_id = %resolution.view.primary_contact_id,
                "created contact"
            );
        }
        if !resolution.bridged_primaries.is_empty() {
            tracing::warn!(
                primary_contact_id = %resolution.view.primary_contact_id,
                bridged_primaries = ?resolution.bridged_primaries,
                "identity bridges multiple primary contacts; clusters left unmerged"
            );
        }

        Ok(IdentifyResponse { contact: resolution.view })
    }

    /// [`IdentityApi::identify`] for a raw JSON body.
    ///
    /// # Errors
    /// As [`IdentifyRequest::from_json`] and [`IdentityApi::identify`].
    pub fn identify_json(&self, body: &[u8]) -> Result<IdentifyResponse, ApiError> {
        self.identify(IdentifyRequest::from_json(body)?)
    }

    /// Every stored contact in creation order.
    ///
    /// # Errors
    /// Returns a store error kind when the store cannot be opened or read.
    pub fn list_contacts(&self) -> Result<Vec<Contact>, ApiError> {
        let store = self.open_store()?;
        store.list_contacts().map_err(ApiError::StoreFailure)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when no contact has this id, or a store error kind
    /// when the lookup fails.
    pub fn contact_show(&self, id: ContactId) -> Result<Contact, ApiError> {
        let store = self.open_store()?;
        store
            .get_contact(id)
            .map_err(ApiError::StoreFailure)?
            .ok_or_else(|| ApiError::NotFound(format!("contact {id} does not exist")))
    }

    /// # Errors
    /// Returns a store error kind when the checks cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport, ApiError> {
        let store = self.open_store()?;
        store.integrity_check().map_err(ApiError::StoreFailure)
    }
}
