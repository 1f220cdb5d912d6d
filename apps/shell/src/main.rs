use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use media_transport::{MissingMediaDevices, MissingPeerConnector};
use shared::{
    domain::{SessionId, UserId},
    protocol::MessageContent,
};
use sync_core::{config, transport::WebSocketChannel, ChatSessionController};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    display_name: String,
    /// Session to select after bootstrap.
    #[arg(long)]
    session_id: Option<i64>,
    /// Optional message to send into the selected session.
    #[arg(long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();
    let settings = config::load_settings();
    let user_id = UserId(args.user_id);

    let live = WebSocketChannel::connect(&settings.server_url, user_id).await?;
    let controller = ChatSessionController::new_with_dependencies(
        user_id,
        args.display_name,
        settings,
        live,
        Arc::new(MissingPeerConnector),
        Arc::new(MissingMediaDevices),
    );
    controller.start().await;
    controller.bootstrap().await?;

    for session in controller.chat_list().await {
        println!(
            "{:>6}  {}  unread={}",
            session.session_id.0, session.name, session.unread
        );
    }

    if let Some(session_id) = args.session_id {
        let session_id = SessionId(session_id);
        controller.select_session(session_id).await?;
        info!(session_id = session_id.0, "session selected");

        if let Some(message) = args.message {
            controller
                .send_message(MessageContent::text(message))
                .await?;
        }

        if let Some(view) = controller.session_view(session_id).await {
            for message in view.messages {
                println!(
                    "[{}] {}: {}",
                    message.sent_at,
                    message
                        .sender_name
                        .unwrap_or_else(|| message.sender_id.0.to_string()),
                    message.content.preview()
                );
            }
        }
    }

    Ok(())
}
