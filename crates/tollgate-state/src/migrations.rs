//! SurrealDB schema initialization
//!
//! Defines the three Tollgate tables with their uniqueness constraints and
//! listing indexes. Safe to call on every connection.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Tollgate tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Tollgate SurrealDB schema");

    init_agents_table(db).await?;
    init_trajectories_table(db).await?;
    init_steps_table(db).await?;

    info!("Tollgate schema initialization complete");
    Ok(())
}

/// `agents`: one row per registered agent id, first registration wins.
async fn init_agents_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agents table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agents SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_agent_id ON TABLE agents COLUMNS agent_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_provider_id ON TABLE agents COLUMNS provider_id, agent_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `trajectories`
///
/// ```text
/// TABLE trajectories {
///   trajectory_id:   STRING (unique)
///   agent_id:        STRING (indexed)
///   status:          STRING (pending | running | suspended | completed | failed)
///   metadata:        OBJECT
///   created_micros:  INT (keyset ordering key)
///   created_at:      DATETIME
///   updated_at:      DATETIME
///   started_at:      DATETIME?
///   ended_at:        DATETIME?
///   step_count:      INT
///   revision:        INT (bumped by every write)
/// }
/// ```
///
/// Status, step_count and revision guards are checked inside the
/// write transactions, not by table permissions.
async fn init_trajectories_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing trajectories table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS trajectories SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_trajectory_id ON TABLE trajectories COLUMNS trajectory_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_listing ON TABLE trajectories COLUMNS created_micros, trajectory_id;
        DEFINE INDEX IF NOT EXISTS idx_agent_listing ON TABLE trajectories COLUMNS agent_id, created_micros;
        DEFINE INDEX IF NOT EXISTS idx_status ON TABLE trajectories COLUMNS status;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `steps`: append-only. `(trajectory_id, seq)` is unique so two writers
/// can never both commit the same sequence number.
async fn init_steps_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing steps table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS steps SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_trajectory_seq ON TABLE steps COLUMNS trajectory_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_decision ON TABLE steps COLUMNS decision;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
