//! Organization scoping extractor.
//!
//! Authentication happens upstream of this service. Callers identify the
//! organization they act for with the `X-Orbin-Organization` header.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::http::error::AppError;

pub const ORGANIZATION_HEADER: &str = "x-orbin-organization";

/// The organization a request is scoped to.
#[derive(Debug, Clone, Copy)]
pub struct OrganizationId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for OrganizationId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse_organization(parts.headers.get(ORGANIZATION_HEADER).map(|v| v.to_str()))
    }
}

fn parse_organization(
    header: Option<Result<&str, axum::http::header::ToStrError>>,
) -> Result<OrganizationId, AppError> {
    let raw = header
        .ok_or_else(|| AppError::Validation(format!("missing {ORGANIZATION_HEADER} header")))?
        .map_err(|_| AppError::Validation(format!("invalid {ORGANIZATION_HEADER} header encoding")))?;
    raw.trim()
        .parse::<Uuid>()
        .map(OrganizationId)
        .map_err(|_| AppError::Validation(format!("{ORGANIZATION_HEADER} must be a UUID")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_organization() {
        let org = Uuid::now_v7();
        let header = format!(" {org} ");
        assert_eq!(parse_organization(Some(Ok(&header))).unwrap().0, org);

        assert!(matches!(parse_organization(None), Err(AppError::Validation(_))));
        assert!(matches!(
            parse_organization(Some(Ok("acme"))),
            Err(AppError::Validation(_))
        ));
    }
}
