use anyhow::Context;
use dotenv::dotenv;
use env_logger::Env;
use psych_agent::config::Settings;
use psych_agent::handlers::{cors_layer, router};
use psych_agent::state::AppState;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let settings = Settings::from_env().context("loading configuration")?;
    let app_state = AppState::from_settings(&settings)?;

    let app = router(app_state)
        .layer(cors_layer(&settings.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("listening on http://{}", &addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
