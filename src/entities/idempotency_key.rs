use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic request-dedup record, usable by any mutating endpoint.
///
/// `(key, route)` is unique. The first request claims the pair with an
/// atomic insert; once the handler finishes, the response is cached on the
/// row and replayed to later requests carrying the same key.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "idempotency_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub key: String,
    pub route: String,
    #[sea_orm(nullable)]
    pub status_code: Option<i16>,
    #[sea_orm(column_type = "Json", nullable)]
    pub response_body: Option<Json>,
    pub locked_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
