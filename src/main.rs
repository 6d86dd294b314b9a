use lead_chat_server::{app, error::StartupError};

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    app::run().await
}
