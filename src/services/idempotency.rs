//! Idempotency ledger for retried client requests.
//!
//! Claiming a key is insert-first: the unique (key, route) index arbitrates
//! between concurrent requests, so exactly one caller wins the claim and
//! everyone else either replays the stored response or backs off while the
//! winner is still in flight.

use crate::{
    entities::{idempotency_key, IdempotencyKey},
    errors::ServiceError,
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// How long a claimed-but-unfinished key blocks other callers before it is
/// considered orphaned and can be re-claimed.
const CLAIM_TTL_MINUTES: i64 = 15;

/// Outcome of attempting to claim an idempotency key.
#[derive(Debug)]
pub enum IdempotencyClaim {
    /// This caller owns the key and must execute the operation.
    Acquired(Uuid),
    /// A previous request completed; replay its stored response.
    Replay {
        status_code: u16,
        response_body: serde_json::Value,
    },
    /// Another request holds the claim and has not finished yet.
    InFlight,
}

#[derive(Clone)]
pub struct IdempotencyService {
    db: Arc<DatabaseConnection>,
}

impl IdempotencyService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Tries to claim `(key, route)`. The insert runs first; a unique-index
    /// violation means somebody already holds it, and the stored row decides
    /// between replay and in-flight.
    #[instrument(skip(self))]
    pub async fn claim(&self, key: &str, route: &str) -> Result<IdempotencyClaim, ServiceError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let attempt = idempotency_key::ActiveModel {
            id: Set(id),
            key: Set(key.to_string()),
            route: Set(route.to_string()),
            status_code: Set(None),
            response_body: Set(None),
            locked_at: Set(now),
            expires_at: Set(Some(now + Duration::minutes(CLAIM_TTL_MINUTES))),
        };

        match attempt.insert(&*self.db).await {
            Ok(_) => {
                debug!(key, route, "Claimed idempotency key");
                Ok(IdempotencyClaim::Acquired(id))
            }
            Err(insert_err) => {
                let existing = IdempotencyKey::find()
                    .filter(idempotency_key::Column::Key.eq(key))
                    .filter(idempotency_key::Column::Route.eq(route))
                    .one(&*self.db)
                    .await?;
                match existing {
                    Some(row) => self.resolve_existing(row, key, route).await,
                    // Insert failed for a reason other than the unique index.
                    None => Err(ServiceError::DatabaseError(insert_err)),
                }
            }
        }
    }

    async fn resolve_existing(
        &self,
        row: idempotency_key::Model,
        key: &str,
        route: &str,
    ) -> Result<IdempotencyClaim, ServiceError> {
        if let (Some(code), Some(body)) = (row.status_code, row.response_body.clone()) {
            debug!(key, route, "Replaying stored idempotent response");
            return Ok(IdempotencyClaim::Replay {
                status_code: code as u16,
                response_body: body,
            });
        }

        // Unfinished claim. Re-claim it only if the holder's TTL lapsed,
        // which covers a crashed request that never recorded its response.
        let orphaned = matches!(row.expires_at, Some(exp) if exp < Utc::now());
        if orphaned {
            let now = Utc::now();
            let mut active: idempotency_key::ActiveModel = row.clone().into();
            active.locked_at = Set(now);
            active.expires_at = Set(Some(now + Duration::minutes(CLAIM_TTL_MINUTES)));
            active.update(&*self.db).await?;
            debug!(key, route, "Re-claimed orphaned idempotency key");
            return Ok(IdempotencyClaim::Acquired(row.id));
        }

        Ok(IdempotencyClaim::InFlight)
    }

    /// Records the response for a claimed key so later retries replay it.
    pub async fn record_response(
        &self,
        conn: &impl ConnectionTrait,
        claim_id: Uuid,
        status_code: u16,
        response_body: serde_json::Value,
    ) -> Result<(), ServiceError> {
        let row = IdempotencyKey::find_by_id(claim_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("Idempotency claim {} vanished", claim_id))
            })?;
        let mut active: idempotency_key::ActiveModel = row.into();
        active.status_code = Set(Some(status_code as i16));
        active.response_body = Set(Some(response_body));
        active.expires_at = Set(None);
        active.update(conn).await?;
        Ok(())
    }

    /// Releases a claim without recording a response, letting the client
    /// retry with the same key. Used when the operation failed before any
    /// side effect worth replaying happened.
    pub async fn release(&self, claim_id: Uuid) -> Result<(), ServiceError> {
        IdempotencyKey::delete_by_id(claim_id)
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Deletes completed rows older than `retention`. Run from the same
    /// background sweep as cart expiry.
    pub async fn prune_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = IdempotencyKey::delete_many()
            .filter(idempotency_key::Column::LockedAt.lt(cutoff))
            .filter(idempotency_key::Column::StatusCode.is_not_null())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
