//! Organization settings repository trait.

use orbin_types::error::RepositoryError;
use orbin_types::organization::OrganizationSettings;
use uuid::Uuid;

/// Storage for per-organization settings and usage counters.
pub trait OrganizationRepository: Send + Sync {
    fn get_settings(
        &self,
        organization_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<OrganizationSettings>, RepositoryError>> + Send;

    /// Insert or replace settings. Usage counters are left untouched.
    fn save_settings(
        &self,
        settings: &OrganizationSettings,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Add `delta` finished executions to the organization's usage counter,
    /// creating default settings if none exist.
    fn increment_usage(
        &self,
        organization_id: &Uuid,
        delta: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
