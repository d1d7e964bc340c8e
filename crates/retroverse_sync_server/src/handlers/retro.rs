use crate::auth::RequireUser;
use axum::{Router, extract::State, http::StatusCode, response::Json, routing::post};
use retroverse_core::protocol::{LongPollRequest, LongPollResponse, MainRequest, MainResponse};
use retroverse_core::{ErrorCode, Retroverse};
use std::sync::Arc;
use tracing::debug;

/// Shared state for the sync protocol handlers
#[derive(Clone)]
pub struct RetroState {
    pub retro: Arc<Retroverse>,
}

/// Create the sync protocol routes
pub fn retro_routes(state: RetroState) -> Router {
    Router::new()
        .route("/main", post(main_handler))
        .route("/longpoll", post(long_poll_handler))
        .with_state(state)
}

/// POST /api/main - Initialize, save, manage subscriptions, get and quit
pub async fn main_handler(
    State(state): State<RetroState>,
    RequireUser(user): RequireUser,
    Json(request): Json<MainRequest>,
) -> (StatusCode, Json<MainResponse>) {
    let response = state.retro.main(&user, request).await;
    let status = match response.error_code {
        Some(ErrorCode::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (status, Json(response))
}

/// POST /api/longpoll - Wait for pushed changes to the session's datons
pub async fn long_poll_handler(
    State(state): State<RetroState>,
    RequireUser(user): RequireUser,
    Json(request): Json<LongPollRequest>,
) -> Json<LongPollResponse> {
    let response = state.retro.handle_long_poll(&user, &request.session_key).await;
    if !response.is_empty() {
        debug!(
            "Long poll for {} returned {} datons",
            user.id,
            response.condensed_datons.len()
        );
    }
    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use retroverse_core::protocol::{GetDatonRequest, InitializeRequest};
    use retroverse_core::{
        ColDef, ColType, DataDictionary, Daton, DatonDef, DatonKey, LockManager, MemoryDataService,
        MemoryLockStore, RetroverseConfig, Row, TableDef, User,
    };
    use std::time::Duration;

    fn state() -> RetroState {
        let customer = DatonDef::persiston(
            "Customer",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef::new("Company", ColType::String)),
        );
        let data = MemoryDataService::new();
        data.insert(
            &customer,
            Daton::new(DatonKey::record("Customer", "5"))
                .with_rows(vec![Row::new().with("CustomerId", 5).with("Company", "Acme")]),
        );
        let config = RetroverseConfig {
            long_poll_timeout: Duration::from_millis(20),
            ..RetroverseConfig::default()
        };
        let locks = LockManager::new(Arc::new(MemoryLockStore::new()), &config);
        let retro = Retroverse::new(
            Arc::new(DataDictionary::new([customer])),
            locks,
            Arc::new(data),
            config,
        );
        RetroState {
            retro: Arc::new(retro),
        }
    }

    #[tokio::test]
    async fn test_initialize_and_get() {
        let state = state();
        let request = MainRequest {
            initialize: Some(InitializeRequest::default()),
            get_datons: vec![GetDatonRequest {
                key: "Customer|=5".to_string(),
                do_subscribe: true,
                force_load: false,
                known_version: None,
            }],
            ..MainRequest::default()
        };

        let (status, Json(response)) =
            main_handler(State(state.clone()), RequireUser(User::new("ann")), Json(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.error_code.is_none());
        assert!(response.session_key.is_some());
        assert!(response.data_dictionary.is_some());
        assert_eq!(response.condensed_datons.len(), 1);
        assert_eq!(response.condensed_datons[0].key, "Customer|=5");
    }

    #[tokio::test]
    async fn test_unknown_session_is_bad_session() {
        let state = state();
        let request = MainRequest {
            session_key: Some("missing".to_string()),
            ..MainRequest::default()
        };
        let (status, Json(response)) =
            main_handler(State(state.clone()), RequireUser(User::new("ann")), Json(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.error_code, Some(ErrorCode::BadSession));

        let Json(poll) = long_poll_handler(
            State(state),
            RequireUser(User::new("ann")),
            Json(LongPollRequest {
                session_key: "missing".to_string(),
            }),
        )
        .await;
        assert_eq!(poll.error_code, Some(ErrorCode::BadSession));
    }

    #[tokio::test]
    async fn test_malformed_key_is_internal_error() {
        let state = state();
        let session_key = state.retro.create_session(User::new("ann"));
        let request = MainRequest {
            session_key: Some(session_key),
            get_datons: vec![GetDatonRequest {
                key: "Customer|=5|=6".to_string(),
                do_subscribe: false,
                force_load: false,
                known_version: None,
            }],
            ..MainRequest::default()
        };
        let (status, Json(response)) =
            main_handler(State(state), RequireUser(User::new("ann")), Json(request)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.error_code, Some(ErrorCode::Internal));
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let state = state();
        let session_key = state.retro.create_session(User::new("ann"));
        let Json(poll) = long_poll_handler(
            State(state),
            RequireUser(User::new("ann")),
            Json(LongPollRequest { session_key }),
        )
        .await;
        assert!(poll.error_code.is_none());
        assert!(poll.is_empty());
    }
}
