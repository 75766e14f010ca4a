use std::collections::HashMap;
use std::sync::Arc;

use dirsync_core::protocol::{Action, Request, Response};
use serde_json::Value;

use crate::context::ServerContext;
use crate::handlers::{self, HandlerFuture};

pub type Handler = fn(Arc<ServerContext>, Value) -> HandlerFuture;

/// Routing table from action name to handler.
pub struct Dispatcher {
    routes: HashMap<&'static str, Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        let mut dispatcher = Self {
            routes: HashMap::new(),
        };
        dispatcher.register(Action::Login, handlers::login::route);
        dispatcher.register(Action::FolderTree, handlers::folders::tree_route);
        dispatcher.register(Action::CreateFolder, handlers::folders::create_route);
        dispatcher.register(Action::DeleteFolder, handlers::folders::delete_route);
        dispatcher.register(Action::GetFileList, handlers::files::list_route);
        dispatcher.register(Action::UploadFile, handlers::files::upload_route);
        dispatcher.register(Action::Download, handlers::files::download_route);
        dispatcher.register(Action::DeleteFile, handlers::files::delete_route);
        dispatcher
    }
}

impl Dispatcher {
    pub fn register(&mut self, action: Action, handler: Handler) {
        self.routes.insert(action.as_str(), handler);
    }

    pub async fn dispatch(&self, ctx: Arc<ServerContext>, request: Request) -> Response {
        let Some(handler) = self.routes.get(request.action.as_str()) else {
            tracing::warn!(action = %request.action, "unknown action");
            return Response::error(format!("Unknown action: {}", request.action));
        };
        match handler(ctx, request.data).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_internal() {
                    tracing::error!(action = %request.action, error = %err, "request failed");
                } else {
                    tracing::debug!(action = %request.action, error = %err, "request rejected");
                }
                err.into_response()
            }
        }
    }
}
