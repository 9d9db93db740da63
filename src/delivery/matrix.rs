use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use matrix_sdk::room::Room;
use matrix_sdk::ruma::events::room::message::RoomMessageEventContent;
use matrix_sdk::ruma::OwnedRoomId;
use matrix_sdk::{Client, Session};
use tokio::sync::OnceCell;

use super::DeliveryError;
use crate::message::Message;

/// Forwards message bodies into a Matrix room.
///
/// The homeserver login happens at most once per mapping for the lifetime
/// of the process: the first delivery creates the session (restoring it
/// from the session file when one exists, logging in with the configured
/// credentials otherwise) while concurrent deliveries await the same
/// cell. A failed creation is cached too; the operator has to fix the
/// configuration and restart rather than have the daemon hammer the
/// homeserver with doomed login attempts.
pub struct MatrixDestination {
    homeserver: String,
    credentials: Option<(String, String)>,
    session_file: Option<PathBuf>,
    room_id: OwnedRoomId,
    client: OnceCell<Result<Client, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPlan {
    Restore,
    Login,
}

/// If the session file exists it is authoritative and credentials are
/// ignored; otherwise credentials are required for a fresh login.
fn session_plan(session_file_exists: bool, has_credentials: bool) -> Option<SessionPlan> {
    if session_file_exists {
        Some(SessionPlan::Restore)
    } else if has_credentials {
        Some(SessionPlan::Login)
    } else {
        None
    }
}

impl MatrixDestination {
    /// Validates the credential policy at startup: a mapping that has
    /// neither an existing session file nor a complete username/password
    /// pair could never log in, and must fail configuration loading
    /// instead of failing at first delivery.
    pub fn new(
        homeserver: String,
        credentials: Option<(String, String)>,
        session_file: Option<PathBuf>,
        room_id: OwnedRoomId,
    ) -> Result<Self> {
        let file_exists = session_file.as_deref().is_some_and(|p| p.is_file());
        if session_plan(file_exists, credentials.is_some()).is_none() {
            bail!(
                "matrix mapping needs either an existing session file or \
                 matrix_username and matrix_password"
            );
        }
        Ok(Self {
            homeserver,
            credentials,
            session_file,
            room_id,
            client: OnceCell::new(),
        })
    }

    pub fn room_id(&self) -> &OwnedRoomId {
        &self.room_id
    }

    async fn client(&self) -> Result<&Client, DeliveryError> {
        let cached = self
            .client
            .get_or_init(|| async { self.connect().await.map_err(|e| format!("{:#}", e)) })
            .await;
        match cached {
            Ok(client) => Ok(client),
            Err(error) => Err(DeliveryError::Session(error.clone())),
        }
    }

    async fn connect(&self) -> Result<Client> {
        let client = Client::builder()
            .homeserver_url(&self.homeserver)
            .respect_login_well_known(true)
            .build()
            .await
            .context("could not create matrix client")?;

        let existing = self.session_file.as_deref().filter(|p| p.is_file());
        match session_plan(existing.is_some(), self.credentials.is_some()) {
            Some(SessionPlan::Restore) => {
                let path = existing.expect("plan is restore");
                let raw = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("could not read session file {:?}", path))?;
                let session: Session = serde_json::from_slice(&raw)
                    .with_context(|| format!("could not parse session file {:?}", path))?;
                client
                    .restore_login(session)
                    .await
                    .context("could not restore matrix session")?;
                tracing::info!(file = %path.display(), "restored matrix session");
            }
            Some(SessionPlan::Login) => {
                let (username, password) = self.credentials.as_ref().expect("plan is login");
                client
                    .login(username, password, None, Some("kutsche-server"))
                    .await
                    .with_context(|| format!("login to {} failed", self.homeserver))?;
                // Persist before first use so a restart never needs the
                // password again.
                if let Some(path) = &self.session_file {
                    let session = client
                        .session()
                        .await
                        .context("logged-in client has no session")?;
                    let raw = serde_json::to_vec_pretty(&session)
                        .context("could not serialize matrix session")?;
                    tokio::fs::write(path, raw)
                        .await
                        .with_context(|| format!("could not write session file {:?}", path))?;
                    tracing::info!(file = %path.display(), "persisted matrix session");
                }
                tracing::info!(homeserver = %self.homeserver, "logged in to matrix homeserver");
            }
            None => bail!("missing matrix session file and login credentials"),
        }

        Ok(client)
    }

    pub async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        let client = self.client().await?;
        let room = match client.get_room(&self.room_id) {
            Some(Room::Joined(room)) => room,
            _ => return Err(DeliveryError::RoomNotJoined(self.room_id.clone())),
        };

        let text = String::from_utf8_lossy(&message.body).into_owned();
        room.send(RoomMessageEventContent::text_plain(text), None)
            .await?;

        tracing::info!(room = %self.room_id, "forwarded message to matrix room");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_sdk::ruma::UserId;

    fn room() -> OwnedRoomId {
        OwnedRoomId::try_from("!room:example.org".to_string()).unwrap()
    }

    #[test]
    fn existing_session_file_wins_over_credentials() {
        assert_eq!(session_plan(true, true), Some(SessionPlan::Restore));
        assert_eq!(session_plan(true, false), Some(SessionPlan::Restore));
        assert_eq!(session_plan(false, true), Some(SessionPlan::Login));
        assert_eq!(session_plan(false, false), None);
    }

    #[test]
    fn rejects_mapping_without_session_or_credentials() {
        let result = MatrixDestination::new(
            "https://matrix.example.org".to_string(),
            None,
            Some(PathBuf::from("/nonexistent/kutsche.session")),
            room(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_credentials_without_session_file() {
        let result = MatrixDestination::new(
            "https://matrix.example.org".to_string(),
            Some(("bot".to_string(), "secret".to_string())),
            None,
            room(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn accepts_existing_session_file_without_credentials() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = MatrixDestination::new(
            "https://matrix.example.org".to_string(),
            None,
            Some(file.path().to_path_buf()),
            room(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn persisted_session_round_trips_without_the_password() {
        let session = Session {
            access_token: "syt_opaque_token".to_string(),
            user_id: UserId::parse("@kutsche:example.org").unwrap(),
            device_id: "KUTSCHEDEV".into(),
        };

        let raw = serde_json::to_vec_pretty(&session).unwrap();
        let reloaded: Session = serde_json::from_slice(&raw).unwrap();
        assert_eq!(reloaded.access_token, session.access_token);
        assert_eq!(reloaded.user_id, session.user_id);
        assert_eq!(reloaded.device_id, session.device_id);
    }
}
