use std::sync::Arc;

use tollgate::{Gateway, GatewayConfig, KvStore, ProviderRegistry, RedisKv};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut listen = "127.0.0.1:8080".to_string();
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let config = GatewayConfig::from_env()?;
    tollgate::telemetry::init_tracing(&config.log_level, json_logs)?;

    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::new(&config.redis_url)?);
    let registry = ProviderRegistry::from_config(&config)?;
    if registry.is_empty() {
        tracing::warn!("no provider API keys configured; every model will resolve as unknown");
    }

    let gateway = Arc::new(Gateway::new(kv, registry, &config));
    let app = tollgate::http::router(gateway);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "tollgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}
