//! Request dispatcher
//!
//! Resolves the session owning a resource (creating it on demand) and
//! forwards a named request to it. Feature requests are best effort: a
//! resource outside every workspace yields [`RequestOutcome::NoSession`]
//! rather than an error.

use lsp_types::{InlineValueContext, Position, Range};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug};
use url::Url;

use crate::server::error::SessionError;
use crate::server::session::Session;
use crate::workspace::folders::WorkspaceKey;
use crate::workspace::registry::SessionRegistry;
use crate::workspace::types::{
    EvaluatableExpression, EvaluatableExpressionParams, GetTestsFromDocumentParams,
    GetTestsFromWorkspaceParams, InlineValue, InlineValuesParams, TestItem, methods,
};

/// Result of a dispatched request that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome<T> {
    Completed(T),
    /// The caller's token fired before the result arrived
    Cancelled,
    /// No workspace owns the resource, or its server is not ready
    NoSession,
}

impl<T> RequestOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RequestOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestOutcome::Cancelled)
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> RequestOutcome<U> {
        match self {
            RequestOutcome::Completed(value) => RequestOutcome::Completed(f(value)),
            RequestOutcome::Cancelled => RequestOutcome::Cancelled,
            RequestOutcome::NoSession => RequestOutcome::NoSession,
        }
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    registry: SessionRegistry,
}

impl RequestDispatcher {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Forward `method` to the session owning `resource`
    pub async fn send<P, R>(
        &self,
        resource: &Url,
        method: &str,
        params: Option<P>,
    ) -> Result<RequestOutcome<R>, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch(resource, method, params, None).await
    }

    /// [`Self::send`], abandoned with [`RequestOutcome::Cancelled`] once
    /// `token` fires
    ///
    /// Session startup itself is not interrupted; the token is checked before
    /// and after it.
    pub async fn send_with_cancellation<P, R>(
        &self,
        resource: &Url,
        method: &str,
        params: Option<P>,
        token: &CancellationToken,
    ) -> Result<RequestOutcome<R>, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch(resource, method, params, Some(token)).await
    }

    async fn dispatch<P, R>(
        &self,
        resource: &Url,
        method: &str,
        params: Option<P>,
        token: Option<&CancellationToken>,
    ) -> Result<RequestOutcome<R>, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let cancelled = || token.is_some_and(CancellationToken::is_cancelled);
        if cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }

        let Some(session) = self.session_for(resource).await? else {
            return Ok(RequestOutcome::NoSession);
        };
        if cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }

        crate::log_lsp_message!(Level::DEBUG, "outgoing", method, resource.as_str());
        let result = match token {
            Some(token) => session.request_with_cancellation(method, params, token).await,
            None => session.request(method, params).await,
        };

        match result {
            Ok(value) => Ok(RequestOutcome::Completed(value)),
            Err(e) if e.is_cancelled() => {
                debug!("Request {} cancelled", method);
                Ok(RequestOutcome::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Session owning `resource`, with the sole-root fallback
    async fn session_for(&self, resource: &Url) -> Result<Option<Arc<Session>>, SessionError> {
        let Some(folder) = self.registry.resolve_folder(resource, true) else {
            debug!("No workspace folder for {}", resource);
            return Ok(None);
        };
        self.open_session(&folder.key(), resource).await
    }

    /// A root removed by a refresh after resolution counts as no session
    async fn open_session(
        &self,
        key: &WorkspaceKey,
        resource: &Url,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        match self.registry.get_or_create(key, resource).await {
            Err(SessionError::UnknownWorkspace { .. }) => {
                debug!("Workspace {} went away before {} was dispatched", key, resource);
                Ok(None)
            }
            result => result,
        }
    }

    // ------------------------------------------------------------------------
    // Typed requests
    // ------------------------------------------------------------------------

    pub async fn get_tests_from_workspace(
        &self,
        workspace: &Url,
        paths: Option<Vec<String>>,
        suites: Option<Vec<String>>,
        token: Option<&CancellationToken>,
    ) -> Result<RequestOutcome<Option<Vec<TestItem>>>, SessionError> {
        let params = GetTestsFromWorkspaceParams {
            workspace_uri: workspace.to_string(),
            paths,
            suites,
        };
        self.dispatch(workspace, methods::GET_TESTS_FROM_WORKSPACE, Some(params), token)
            .await
    }

    pub async fn get_tests_from_document(
        &self,
        document: &Url,
        base_name: Option<String>,
        token: Option<&CancellationToken>,
    ) -> Result<RequestOutcome<Option<Vec<TestItem>>>, SessionError> {
        let params = GetTestsFromDocumentParams {
            document_uri: document.to_string(),
            base_name,
        };
        self.dispatch(document, methods::GET_TESTS_FROM_DOCUMENT, Some(params), token)
            .await
    }

    pub async fn get_evaluatable_expression(
        &self,
        document: &Url,
        position: Position,
        token: Option<&CancellationToken>,
    ) -> Result<RequestOutcome<Option<EvaluatableExpression>>, SessionError> {
        let params = EvaluatableExpressionParams {
            document_uri: document.to_string(),
            position,
        };
        self.dispatch(document, methods::GET_EVALUATABLE_EXPRESSION, Some(params), token)
            .await
    }

    /// Inline values for `viewport`; a `null` result is an empty list
    pub async fn get_inline_values(
        &self,
        document: &Url,
        viewport: Range,
        context: InlineValueContext,
        token: Option<&CancellationToken>,
    ) -> Result<RequestOutcome<Vec<InlineValue>>, SessionError> {
        let params = InlineValuesParams {
            document_uri: document.to_string(),
            viewport,
            context,
        };
        let outcome: RequestOutcome<Option<Vec<InlineValue>>> = self
            .dispatch(document, methods::GET_INLINE_VALUES, Some(params), token)
            .await?;
        Ok(outcome.map(Option::unwrap_or_default))
    }

    /// Ask the server of the workspace owning `resource` to drop its caches
    pub async fn clear_cache(&self, resource: &Url) -> Result<RequestOutcome<()>, SessionError> {
        let outcome: RequestOutcome<Value> = self
            .dispatch(resource, methods::CLEAR_CACHE, None::<Value>, None)
            .await?;
        Ok(outcome.map(|_| ()))
    }
}
