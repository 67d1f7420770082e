//! Caller identity extraction. The policy engine that decides what a
//! principal may do lives outside this gateway; all the core needs is who is
//! calling and under which tenant.

use http::HeaderMap;

use crate::server::error::ApiError;
use crate::*;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone)]
pub struct Identity {
	/// The authenticated caller, one level below the tenant. The bearer
	/// token doubles as the principal identifier and the api-key rate-limit
	/// key.
	pub principal: Strng,
	pub tenant: Strng,
}

pub fn extract(headers: &HeaderMap, request_id: &Strng) -> Result<Identity, ApiError> {
	let authorization = headers
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| {
			ApiError::unauthenticated("missing Authorization header", request_id.clone())
		})?;
	let token = authorization.strip_prefix("Bearer ").ok_or_else(|| {
		ApiError::unauthenticated(
			"Authorization header must be of the form 'Bearer <key>'",
			request_id.clone(),
		)
	})?;
	if token.is_empty() {
		return Err(ApiError::unauthenticated(
			"empty bearer token",
			request_id.clone(),
		));
	}
	let tenant = headers
		.get(TENANT_HEADER)
		.and_then(|v| v.to_str().ok())
		.filter(|t| !t.is_empty())
		.map(strng::new)
		.unwrap_or_else(|| strng::new(DEFAULT_TENANT));
	Ok(Identity {
		principal: strng::new(token),
		tenant,
	})
}
