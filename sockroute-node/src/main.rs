//! sockroute node — one routing server configured from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SOCKROUTE_BIND_ADDR` | `127.0.0.1:9090` |
//! | `SOCKROUTE_WIRE` | `binary` (`binary` or `json`) |
//! | `SOCKROUTE_SERVER_ID` | random |
//! | `SOCKROUTE_REDIS_URL` | unset: single-process in-memory distributor |
//! | `SOCKROUTE_CHANNEL_MODE` | `queue` (`queue` or `pubsub`) |
//!
//! Logging goes through `env_logger`; set `RUST_LOG=debug` for per-frame detail.

use std::sync::Arc;

use log::info;
use sockroute::{Distributor, InMemoryDistributor, Request, Response, RouteError, Router, Server, ServerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn config_from_env() -> Result<ServerConfig, BoxError> {
    let mut config = ServerConfig::default();
    if let Some(addr) = env("SOCKROUTE_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(wire) = env("SOCKROUTE_WIRE") {
        config.wire_format = wire.parse()?;
    }
    config.server_id = env("SOCKROUTE_SERVER_ID");
    Ok(config)
}

#[cfg(feature = "redis")]
fn distributor_from_env() -> Result<Arc<dyn Distributor>, BoxError> {
    use sockroute::{ChannelMode, RedisConfig, RedisDistributor};

    let Some(url) = env("SOCKROUTE_REDIS_URL") else {
        return Ok(Arc::new(InMemoryDistributor::new()));
    };
    let channel_mode: ChannelMode = match env("SOCKROUTE_CHANNEL_MODE") {
        Some(mode) => mode.parse()?,
        None => ChannelMode::default(),
    };
    info!("Using redis distributor at {url} ({channel_mode:?} channels)");
    Ok(Arc::new(RedisDistributor::new(RedisConfig { url, channel_mode })?))
}

#[cfg(not(feature = "redis"))]
fn distributor_from_env() -> Result<Arc<dyn Distributor>, BoxError> {
    if env("SOCKROUTE_REDIS_URL").is_some() {
        log::warn!("SOCKROUTE_REDIS_URL ignored: built without the redis feature");
    }
    Ok(Arc::new(InMemoryDistributor::new()))
}

fn group_param(req: &Request) -> Result<String, RouteError> {
    req.param("group")
        .map(str::to_string)
        .ok_or_else(|| RouteError::bad_request("missing group"))
}

fn demo_routes() -> Router {
    Router::new()
        .get("/ping", |_req: Request, res: Response| async move { res.send("pong").await })
        .get("/me", |req: Request, res: Response| async move {
            let groups = res.groups();
            res.send(serde_json::json!({ "id": req.connection_id, "groups": groups }))
                .await
        })
        .put("/groups/:group", |req: Request, res: Response| async move {
            res.join_group(&group_param(&req)?).await?;
            res.status(201)?;
            res.send(()).await
        })
        .delete("/groups/:group", |req: Request, res: Response| async move {
            res.leave_group(&group_param(&req)?).await?;
            res.send(()).await
        })
        .post("/groups/:group", |req: Request, res: Response| async move {
            let group = group_param(&req)?;
            res.group(group)
                .header("from", req.connection_id.clone())
                .send(req.body.clone())
                .await?;
            res.send(()).await
        })
        .post("/direct/:id", |req: Request, res: Response| async move {
            let target = req.param("id").unwrap_or_default().to_string();
            res.to(target)
                .header("from", req.connection_id.clone())
                .send(req.body.clone())
                .await?;
            res.send(()).await
        })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = config_from_env()?;
    let distributor = distributor_from_env()?;
    let server = Server::new(config, demo_routes(), distributor);
    info!("Starting sockroute node {}", server.server_id());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
