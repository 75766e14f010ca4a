use std::sync::Arc;

use dirsync_core::protocol::{LoginData, Response};
use serde_json::{Value, json};

use super::{HandlerError, HandlerFuture, HandlerResult, parse_payload};
use crate::context::ServerContext;

pub fn route(ctx: Arc<ServerContext>, data: Value) -> HandlerFuture {
    Box::pin(async move { login(&ctx, data).await })
}

// Plain equality against configured credentials. Not a real authentication scheme.
pub async fn login(ctx: &ServerContext, data: Value) -> HandlerResult {
    let data: LoginData = parse_payload(data)?;
    if data.username != ctx.credentials.username || data.password != ctx.credentials.password {
        tracing::warn!(username = %data.username, "rejected login");
        return Err(HandlerError::Unauthorized);
    }
    tracing::info!(username = %data.username, "login accepted");
    Ok(Response::success(
        "Login successful",
        json!({ "username": data.username }),
    ))
}
