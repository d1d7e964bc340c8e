use crate::db::UserRepo;
use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use retroverse_core::User;
use std::sync::Arc;
use tracing::warn;

/// Resolves API tokens to users; installed as a request extension
#[derive(Clone)]
pub struct UserAuth {
    pub repo: Arc<UserRepo>,
}

/// Extractor for optional authentication
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<User>);

/// Extractor for required authentication
///
/// Use this for protected endpoints - returns 401 if not authenticated
#[derive(Debug, Clone)]
pub struct RequireUser(pub User);

/// Token from an `Authorization: Bearer` header, falling back to a `token=`
/// query parameter
pub fn bearer_token(parts: &Parts) -> Option<String> {
    let token = parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());

    token.or_else(|| {
        parts.uri.query().and_then(|q| {
            q.split('&')
                .find_map(|p| p.strip_prefix("token="))
                .map(|t| t.to_string())
        })
    })
}

impl UserAuth {
    pub fn new(repo: Arc<UserRepo>) -> Self {
        Self { repo }
    }

    /// Resolve the request's token to a user
    pub fn authenticate(&self, parts: &Parts) -> Option<User> {
        let token = bearer_token(parts)?;
        match self.repo.validate_token(&token) {
            Ok(user) => user,
            Err(e) => {
                warn!("Token lookup failed: {}", e);
                None
            }
        }
    }
}

impl<S> FromRequestParts<S> for OptionalUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth = parts
            .extensions
            .get::<UserAuth>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Auth not configured"))?;

        Ok(OptionalUser(auth.authenticate(parts)))
    }
}

impl<S> FromRequestParts<S> for RequireUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let OptionalUser(user) = OptionalUser::from_request_parts(parts, state).await?;

        match user {
            Some(user) => Ok(RequireUser(user)),
            None => Err((StatusCode::UNAUTHORIZED, "Authentication required")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use axum::http::Request;
    use rusqlite::Connection;

    fn parts(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn auth_with_user() -> (UserAuth, String) {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let repo = Arc::new(UserRepo::new(conn));
        let token = repo.create_user("ann", &["sales"]).unwrap();
        (UserAuth::new(repo), token)
    }

    #[test]
    fn test_bearer_token_sources() {
        let header = parts("/api/main", Some("Bearer abc"));
        assert_eq!(bearer_token(&header).as_deref(), Some("abc"));
        let query = parts("/api/longpoll?x=1&token=def", None);
        assert_eq!(bearer_token(&query).as_deref(), Some("def"));
        assert!(bearer_token(&parts("/api/main", Some("Basic abc"))).is_none());
    }

    #[tokio::test]
    async fn test_require_user() {
        let (auth, token) = auth_with_user();

        let mut ok = parts("/api/main", Some(&format!("Bearer {}", token)));
        ok.extensions.insert(auth.clone());
        let RequireUser(user) = RequireUser::from_request_parts(&mut ok, &()).await.unwrap();
        assert_eq!(user.id, "ann");

        let mut missing = parts("/api/main", Some("Bearer nope"));
        missing.extensions.insert(auth);
        let err = RequireUser::from_request_parts(&mut missing, &()).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_extension() {
        let mut bare = parts("/api/main", None);
        let err = OptionalUser::from_request_parts(&mut bare, &()).await.unwrap_err();
        assert_eq!(err.0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
