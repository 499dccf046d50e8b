use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tablesync_server::{router, AppState};

/// Parse the `TABLESYNC_TABLES` value: a comma-separated list of table
/// names, each optionally suffixed `:hard` to disable soft delete.
fn table_specs(raw: &str) -> Vec<(String, bool)> {
    raw.split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(|spec| match spec.split_once(':') {
            Some((name, mode)) => (name.to_string(), mode != "hard"),
            None => (spec.to_string(), true),
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("TABLESYNC_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let tables = std::env::var("TABLESYNC_TABLES").unwrap_or_else(|_| "movies".to_string());

    let state = Arc::new(AppState::new());
    for (name, soft_delete) in table_specs(&tables) {
        info!(table = %name, soft_delete, "serving table");
        state.store.define_table(&name, soft_delete);
    }

    let app = router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "tablesync server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::table_specs;

    #[test]
    fn table_specs_parse_soft_and_hard_tables() {
        assert_eq!(
            table_specs("movies, logs:hard,books"),
            vec![
                ("movies".to_string(), true),
                ("logs".to_string(), false),
                ("books".to_string(), true),
            ]
        );
        assert!(table_specs("").is_empty());
    }
}
