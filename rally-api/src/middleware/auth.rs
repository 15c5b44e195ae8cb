use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

pub const ROLE_OPERATOR: &str = "OPERATOR";
pub const ROLE_PROVIDER: &str = "PROVIDER";
pub const ROLE_BUYER: &str = "BUYER";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_operator(&self) -> bool {
        self.role == ROLE_OPERATOR
    }

    /// True when the token's subject is one of the given parties.
    pub fn is_party_to(&self, parties: &[Uuid]) -> bool {
        Uuid::parse_str(&self.sub)
            .map(|sub| parties.contains(&sub))
            .unwrap_or(false)
    }
}

fn decode_claims(req: &Request, secret: &str) -> Result<Claims, StatusCode> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header.strip_prefix("Bearer ").ok_or(StatusCode::UNAUTHORIZED)?;

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

/// Any marketplace participant. Handlers decide whether the caller is a
/// party to the unit they touch.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let claims = decode_claims(&req, state.auth.secret.expose())?;

    if ![ROLE_OPERATOR, ROLE_PROVIDER, ROLE_BUYER].contains(&claims.role.as_str()) {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub async fn operator_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let claims = decode_claims(&req, state.auth.secret.expose())?;

    if !claims.is_operator() {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
