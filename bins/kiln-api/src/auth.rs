// Caller identity, taken from headers set by the authenticating proxy.
//
// `x-kiln-user` is required. `x-kiln-role: admin` grants administrator
// access; any other role value is an ordinary user.

use crate::error::ApiError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use kiln_common::types::Caller;

pub const USER_HEADER: &str = "x-kiln-user";
pub const ROLE_HEADER: &str = "x-kiln-role";

#[derive(Debug, Clone)]
pub struct Identity(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user = header(USER_HEADER).ok_or(ApiError::Unauthorized)?;
        let caller = match header(ROLE_HEADER) {
            Some(role) if role.eq_ignore_ascii_case("admin") => Caller::admin(user),
            _ => Caller::user(user),
        };
        Ok(Identity(caller))
    }
}
