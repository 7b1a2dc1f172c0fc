use std::sync::Arc;

use log::{debug, error, info, warn};
use rocket_bot::responder::{EchoResponder, Responder};
use rocket_bot::{Config, Connection, Status};

#[tokio::main]
async fn main() {
    let path = Config::path_from_env();
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot load config {}: {}", path, e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .init();
    info!("Starting up with config {}", path);

    let connection = match Connection::connect(&config.rocket_chat).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Cannot create new rocketchat connection: {}", e);
            std::process::exit(1);
        }
    };
    info!("Connected as {} ({})", connection.username(), connection.display_name());

    if let Err(e) = connection.set_temporary_status(Status::Online).await {
        warn!("Cannot set status online: {}", e);
    }

    let responder: Arc<dyn Responder> = Arc::new(EchoResponder::default());
    loop {
        let message = tokio::select! {
            next = connection.next_fresh_message() => match next {
                Ok(message) => message,
                Err(e) => {
                    info!("Stopping: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                connection.close();
                break;
            }
        };

        if !responder.wants(&message) {
            continue;
        }
        debug!("Incoming message for the bot: {:?}", message);

        let connection = connection.clone();
        let responder = responder.clone();
        tokio::spawn(async move {
            if let Err(e) = responder.respond(&connection, &message).await {
                error!("Responding to {} failed: {}", message.id, e);
                let apology = format!(
                    "@{} :x: Sorry, something went wrong while processing your request. :x:",
                    message.username
                );
                if let Err(e) = connection.reply(&message, &apology).await {
                    error!("Cannot send reply about the error: {}", e);
                }
            }
        });
    }
}
