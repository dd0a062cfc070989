use axum::{
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-username";
pub const DISPLAY_NAME_HEADER: &str = "x-display-name";

/// Author identity asserted by the authenticating proxy in front of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
}

impl Identity {
    /// Read identity headers. The display name falls back to the username.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let user_id = get(USER_ID_HEADER)?.parse::<i64>().ok()?;
        let username = get(USERNAME_HEADER)?.to_string();
        let display_name = get(DISPLAY_NAME_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| username.clone());
        Some(Self {
            user_id,
            username,
            display_name,
        })
    }
}

/// Attach the caller's [`Identity`] to the request or answer 401.
pub async fn identity_middleware<B>(mut req: Request<B>, next: Next<B>) -> Response {
    match Identity::from_headers(req.headers()) {
        Some(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}
