use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use webhook_engine::{
    EngineSettings, InMemoryStore, InboundEvent, MatchType, TriggerRule, TriggerType,
    WebhookConfigDraft, WebhookEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::var("WEBHOOK_DEMO_URL").unwrap_or_else(|_| "https://example.com/webhook".to_string());
    let engine = WebhookEngine::start(EngineSettings::from_env()?, Arc::new(InMemoryStore::new())).await?;

    let config = engine
        .create_config(
            WebhookConfigDraft::new("support-alerts", url)
                .with_secret("supersecret")
                .with_trigger(TriggerRule::new(TriggerType::Keyword, "urgent", MatchType::Contains))
                .with_trigger(TriggerRule::new(TriggerType::MediaType, "image", MatchType::Exact)),
        )
        .await?;

    let event = InboundEvent::new(
        "3EB0C767D26A1D8E",
        "120363040000000000@g.us",
        "4915112345678@s.whatsapp.net",
        "Urgent: the build is red",
    )
    .with_chat_name("Ops")
    .with_sender_name("Dana");

    let queued = engine.handle_event(&event).await;
    println!("queued {queued} delivery(ies)");

    tokio::time::sleep(Duration::from_secs(2)).await;
    for attempt in engine.delivery_logs(config.id, 10).await? {
        println!(
            "attempt {} -> status {:?}, delivered: {}",
            attempt.attempt_number,
            attempt.response_status,
            attempt.delivered_at.is_some()
        );
    }

    engine.shutdown().await;
    Ok(())
}
