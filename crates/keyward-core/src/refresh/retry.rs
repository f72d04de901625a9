use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::coordinator::RefreshCoordinator;
use crate::api::{ApiError, ApiRequest, ApiResponse, Middleware, Verdict};
use crate::session::SessionFacade;

/// Turns a 401 into refresh-and-replay.
///
/// The first 401 for a request marks it retried and waits for the (shared)
/// refresh. A refreshed credential means one replay; a failed refresh
/// invalidates the session and hands the caller the original 401. A 401 on the
/// replay is returned as is.
pub struct RefreshOnUnauthorized {
    coordinator: Arc<RefreshCoordinator>,
    session: SessionFacade,
}

impl RefreshOnUnauthorized {
    pub fn new(coordinator: Arc<RefreshCoordinator>, session: SessionFacade) -> Self {
        Self {
            coordinator,
            session,
        }
    }
}

#[async_trait]
impl Middleware for RefreshOnUnauthorized {
    fn name(&self) -> &'static str {
        "refresh-on-401"
    }

    async fn after_receive(
        &self,
        pending: &mut ApiRequest,
        sent: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Verdict {
        let err = match outcome {
            Err(err) if err.is_unauthorized() => err,
            other => return Verdict::Done(other),
        };

        if pending.is_retried() {
            debug!(url = %pending.url, "Replay rejected as well, not refreshing again");
            return Verdict::Done(Err(err));
        }
        pending.mark_retried();

        debug!(url = %pending.url, "Unauthorized, attempting credential refresh");
        match self.coordinator.refresh(sent.bearer_token()).await {
            Ok(_) => Verdict::Replay(err),
            Err(refresh_err) => {
                warn!(error = %refresh_err, "Credential refresh failed, re-login required");
                self.session.invalidate();
                Verdict::Done(Err(err))
            }
        }
    }
}
