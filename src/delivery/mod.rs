use matrix_sdk::ruma::OwnedRoomId;

use crate::message::Message;
use crate::route::RouteTable;

mod file;
mod matrix;

pub use file::FileDestination;
pub use matrix::MatrixDestination;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("matrix session unavailable: {0}")]
    Session(String),
    #[error("matrix room {0} is not joined")]
    RoomNotJoined(OwnedRoomId),
    #[error("matrix send failed: {0}")]
    Matrix(#[from] matrix_sdk::Error),
}

/// Where a routed recipient's mail ends up.
pub enum Destination {
    File(FileDestination),
    Matrix(MatrixDestination),
}

impl Destination {
    pub async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        match self {
            Destination::File(dest) => dest.deliver(message).await,
            Destination::Matrix(dest) => dest.deliver(message).await,
        }
    }
}

/// Delivers a completed message to every accepted recipient and returns
/// the single SMTP reply for the DATA phase.
///
/// Each recipient is attempted independently; one failing write neither
/// blocks nor rolls back the others. The aggregate reply is 250 as long
/// as at least one recipient was served, 451 when every attempt failed.
pub async fn deliver_all(message: &Message, routes: &RouteTable) -> String {
    let total = message.recipients.len();
    let mut failed = 0usize;

    for recipient in &message.recipients {
        match routes.route(recipient) {
            Some(destination) => match destination.deliver(message).await {
                Ok(()) => tracing::info!(%recipient, "delivered message"),
                Err(error) => {
                    failed += 1;
                    tracing::error!(%recipient, %error, "delivery failed");
                }
            },
            // Recipients are validated at RCPT time, so this only happens
            // if the destination vanished in between.
            None => {
                failed += 1;
                tracing::error!(%recipient, "no destination for accepted recipient");
            }
        }
    }

    if failed == total && total > 0 {
        "451 4.3.0 Delivery failed for all recipients\r\n".to_string()
    } else if failed > 0 {
        format!("250 2.6.0 Message accepted, {failed} of {total} deliveries failed\r\n")
    } else {
        "250 2.6.0 Message accepted for delivery\r\n".to_string()
    }
}
