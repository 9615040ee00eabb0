//! SurrealDB schema migrations and initialization

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all perfbisect tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing perfbisect SurrealDB schema");

    init_jobs_table(db).await?;
    init_steps_table(db).await?;

    info!("perfbisect schema initialization complete");
    Ok(())
}

/// Initialize `bisect_jobs` table
///
/// Schema:
/// ```text
/// TABLE bisect_jobs {
///   job_id:                  STRING (unique)
///   request_digest:          STRING (indexed)
///   benchmark, story, chart: STRING
///   request:                 OBJECT
///   status:                  STRING (running | completed | failed | cancelled)
///   culprit_repository_url:  STRING?
///   culprit_git_hash:        STRING?
///   error:                   STRING?
///   total_steps:             INT
///   duration_ms:             INT
///   created_at:              DATETIME (indexed)
///   completed_at:            DATETIME?
/// }
/// ```
///
/// Status transitions (running → terminal) are enforced in application logic.
async fn init_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing bisect_jobs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS bisect_jobs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE bisect_jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_request_digest ON TABLE bisect_jobs COLUMNS request_digest;
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE bisect_jobs COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE bisect_jobs COLUMNS created_at;
    "#;

    db.query(sql).await?;
    info!("bisect_jobs table initialized");
    Ok(())
}

/// Initialize `bisect_steps` table
///
/// `(job_id, seq)` is unique: a journaled step is written exactly once, which
/// is what lets a replayed job trust what it reads back.
async fn init_steps_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing bisect_steps table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS bisect_steps AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_job_id_seq ON TABLE bisect_steps COLUMNS job_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_step_job_id ON TABLE bisect_steps COLUMNS job_id;
        DEFINE INDEX IF NOT EXISTS idx_step_kind ON TABLE bisect_steps COLUMNS kind;
    "#;

    db.query(sql).await?;
    info!("bisect_steps table initialized");
    Ok(())
}
