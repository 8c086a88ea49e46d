//! Authenticated principal and role guards.
//!
//! Token validation happens upstream: the gateway in front of Libris verifies
//! the caller with the user service and forwards the result as two headers,
//! [`PRINCIPAL_ID_HEADER`] and [`PRINCIPAL_ROLE_HEADER`]. This crate trusts
//! those headers as given.

use std::fmt;
use std::str::FromStr;

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use libris_http::error::AppError;

pub const PRINCIPAL_ID_HEADER: &str = "x-user-id";
pub const PRINCIPAL_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "librarian")]
    Librarian,
    #[serde(rename = "super admin")]
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Librarian => "librarian",
            Role::SuperAdmin => "super admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "librarian" => Ok(Role::Librarian),
            "super admin" | "super_admin" | "superadmin" => Ok(Role::SuperAdmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Whether `role` may use an endpoint guarded by `allowed`.
///
/// An empty guard admits plain users; super admins pass every guard.
pub fn has_access(role: Role, allowed: &[Role]) -> bool {
    if role == Role::SuperAdmin {
        return true;
    }
    if allowed.is_empty() {
        return role == Role::User;
    }
    allowed.contains(&role)
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub subject: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn new(subject: Uuid, role: Role) -> Self {
        Self { subject, role }
    }

    /// Fail with `403` unless the principal's role passes the guard.
    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        if has_access(self.role, allowed) {
            Ok(())
        } else {
            tracing::warn!(
                subject = %self.subject,
                role = %self.role,
                "access denied: insufficient permissions"
            );
            Err(AppError::forbidden("access forbidden: insufficient permissions"))
        }
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let subject = header(parts, PRINCIPAL_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing authenticated principal"))?;
        let subject = Uuid::parse_str(subject)
            .map_err(|_| AppError::unauthorized("malformed principal id"))?;

        let role = header(parts, PRINCIPAL_ROLE_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing principal role"))?
            .parse::<Role>()
            .map_err(|e| AppError::unauthorized(e.to_string()))?;

        Ok(Principal { subject, role })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;

    #[test]
    fn parses_roles_leniently() {
        assert_eq!("User".parse::<Role>(), Ok(Role::User));
        assert_eq!(" librarian ".parse::<Role>(), Ok(Role::Librarian));
        assert_eq!("super admin".parse::<Role>(), Ok(Role::SuperAdmin));
        assert_eq!(
            "janitor".parse::<Role>(),
            Err(UnknownRole("janitor".to_string()))
        );
    }

    #[test]
    fn empty_guard_admits_users_only() {
        assert!(has_access(Role::User, &[]));
        assert!(!has_access(Role::Librarian, &[]));
        assert!(has_access(Role::SuperAdmin, &[]));
    }

    #[test]
    fn super_admin_passes_every_guard() {
        assert!(has_access(Role::SuperAdmin, &[Role::Librarian]));
        assert!(!has_access(Role::User, &[Role::Librarian]));
        assert!(has_access(Role::Librarian, &[Role::Librarian, Role::User]));
    }

    #[test]
    fn require_maps_denial_to_forbidden() {
        let principal = Principal::new(Uuid::new_v4(), Role::User);
        let err = principal.require(&[Role::Librarian]).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    async fn extract(request: Request<()>) -> Result<Principal, AppError> {
        let (mut parts, _) = request.into_parts();
        Principal::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn extracts_principal_from_gateway_headers() {
        let subject = Uuid::new_v4();
        let request = Request::builder()
            .header(PRINCIPAL_ID_HEADER, subject.to_string())
            .header(PRINCIPAL_ROLE_HEADER, "librarian")
            .body(())
            .unwrap();

        let principal = extract(request).await.unwrap();
        assert_eq!(principal, Principal::new(subject, Role::Librarian));
    }

    #[tokio::test]
    async fn missing_or_malformed_headers_are_unauthorized() {
        let missing = Request::builder().body(()).unwrap();
        let err = extract(missing).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let malformed = Request::builder()
            .header(PRINCIPAL_ID_HEADER, "not-a-uuid")
            .header(PRINCIPAL_ROLE_HEADER, "user")
            .body(())
            .unwrap();
        let err = extract(malformed).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
