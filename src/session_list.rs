/// Builds the session picker from the persistence service.
///
/// Detail fetches for all ids are issued together and gathered by position,
/// so the list always follows the order `list_sessions` returned no matter
/// which fetch finishes first.
use chrono::NaiveDateTime;
use futures_util::future::join_all;
use tracing::warn;

use crate::persistence::PersistenceClient;
use crate::session::{UNTITLED, derive_title};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: String,
    pub title: String,
    pub created_at: Option<NaiveDateTime>,
}

pub struct SessionListLoader<'a> {
    persistence: &'a dyn PersistenceClient,
}

impl<'a> SessionListLoader<'a> {
    pub fn new(persistence: &'a dyn PersistenceClient) -> Self {
        Self { persistence }
    }

    pub async fn load(&self) -> Vec<SessionEntry> {
        let ids = match self.persistence.list_sessions().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not list sessions");
                return Vec::new();
            }
        };

        let details = join_all(ids.iter().map(|id| self.persistence.get_session(id))).await;

        ids.into_iter()
            .zip(details)
            .map(|(id, detail)| {
                let remote = match detail {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!(session = %id, error = %e, "could not fetch session detail");
                        None
                    }
                };
                let title = remote
                    .as_ref()
                    .and_then(|r| r.first_user_message())
                    .map(derive_title)
                    .unwrap_or_else(|| UNTITLED.to_string());
                let created_at = remote
                    .as_ref()
                    .and_then(|r| r.created_at.as_deref())
                    .and_then(parse_created_at);
                SessionEntry { id, title, created_at }
            })
            .collect()
    }
}

/// The service writes naive local ISO-8601 timestamps, with or without
/// fractional seconds.
fn parse_created_at(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()
}
