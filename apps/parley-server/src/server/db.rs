use parley_core::DeliveryState;

use super::{
    core::{AppState, AuditLogRecord, MessageRecord},
    errors::ApiFailure,
};

/// Initialize the durable-row schema once per process. Conversation and
/// membership authority stays in process memory; Postgres, when configured,
/// holds the write-through copies of users, messages, delivery statuses,
/// and the audit log.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ApiFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5041_524c_4559_0001;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    password_hash TEXT NOT NULL,
                    failed_logins SMALLINT NOT NULL DEFAULT 0,
                    locked_until_unix BIGINT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    content TEXT NOT NULL,
                    reply_to_message_id TEXT NULL,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                    ON messages(conversation_id, created_at_unix DESC)",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS delivery_statuses (
                    message_id TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    state TEXT NOT NULL,
                    updated_at_unix BIGINT NOT NULL,
                    PRIMARY KEY (message_id, user_id)
                )",
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS audit_logs (
                    audit_id BIGSERIAL PRIMARY KEY,
                    actor_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    entity TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    detail TEXT NOT NULL,
                    created_at_unix BIGINT NOT NULL
                )",
            )
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_audit_logs_actor_created
                    ON audit_logs(actor_id, created_at_unix DESC)",
            )
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(event = "db.schema_init_failed", error = %e);
            ApiFailure::Internal
        })?;
    Ok(())
}

pub(crate) async fn db_insert_user(
    state: &AppState,
    user_id: &str,
    username: &str,
    password_hash: &str,
) -> Result<(), ApiFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };
    ensure_db_schema(state).await?;
    sqlx::query(
        "INSERT INTO users (user_id, username, password_hash)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(username)
    .bind(password_hash)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(event = "db.user_insert_failed", error = %e);
        ApiFailure::Internal
    })?;
    Ok(())
}

pub(crate) async fn db_insert_message(
    state: &AppState,
    conversation_id: &str,
    message: &MessageRecord,
) -> Result<(), ApiFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };
    ensure_db_schema(state).await?;
    sqlx::query(
        "INSERT INTO messages
            (message_id, conversation_id, sender_id, kind, content, reply_to_message_id, created_at_unix)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (message_id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(conversation_id)
    .bind(message.sender_id.to_string())
    .bind(message.kind.as_str())
    .bind(&message.content)
    .bind(&message.reply_to_message_id)
    .bind(message.created_at_unix)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(event = "db.message_insert_failed", error = %e);
        ApiFailure::Internal
    })?;
    Ok(())
}

pub(crate) async fn db_upsert_delivery_status(
    state: &AppState,
    message_id: &str,
    user_id: &str,
    delivery_state: DeliveryState,
    updated_at_unix: i64,
) -> Result<(), ApiFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };
    ensure_db_schema(state).await?;
    sqlx::query(
        "INSERT INTO delivery_statuses (message_id, user_id, state, updated_at_unix)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (message_id, user_id)
         DO UPDATE SET state = EXCLUDED.state, updated_at_unix = EXCLUDED.updated_at_unix",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(delivery_state.as_str())
    .bind(updated_at_unix)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(event = "db.delivery_status_upsert_failed", error = %e);
        ApiFailure::Internal
    })?;
    Ok(())
}

pub(crate) async fn db_insert_audit_log(
    state: &AppState,
    record: &AuditLogRecord,
) -> Result<(), ApiFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };
    ensure_db_schema(state).await?;
    sqlx::query(
        "INSERT INTO audit_logs (actor_id, action, entity, outcome, detail, created_at_unix)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&record.actor_id)
    .bind(&record.action)
    .bind(&record.entity)
    .bind(&record.outcome)
    .bind(record.detail.to_string())
    .bind(record.created_at_unix)
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!(event = "db.audit_insert_failed", error = %e);
        ApiFailure::Internal
    })?;
    Ok(())
}
