use chain_indexer_lib::{
    cli::{parse_args, Cli},
    config::Config,
    db::build_db_pool,
    logging::{format_error_report, init_logging},
    server::{register_metrics, setup_server_with_addr},
    state::AppState,
    sync_service::SyncService,
};
use diesel::{pg::PgConnection, Connection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use dotenv::dotenv;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels `shutdown_token` when SIGTERM or SIGINT is received.
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(event = "sigterm_handler_unavailable", error = %err, "SIGTERM handler not installed");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = terminate => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "shutting down");
        }
        _ = shutdown_token.cancelled() => return,
    }

    shutdown_token.cancel();
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn run_initial_migrations(
    connection: &mut impl MigrationHarness<diesel::pg::Pg>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    connection.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

async fn run(args: Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::from_env()?;

    if args.skip_migrations {
        info!(event = "migrations_skipped", "skipping embedded migrations");
    } else {
        let db_url = config.db_url.clone();
        tokio::task::spawn_blocking(move || {
            let mut temp_conn = PgConnection::establish(&db_url)?;
            run_initial_migrations(&mut temp_conn)
        })
        .await??;
        info!(event = "migrations_applied", "database migrations applied");
    }

    let pool = build_db_pool(&config.db_url).await?;
    let state = Arc::new(AppState::new(pool.clone(), CancellationToken::new()));
    let sync_service = SyncService::new(config.clone(), pool, args.domains.clone());

    if args.once {
        register_metrics(&state).await;
        sync_service
            .run_once(state.health.clone(), state.shutdown_token.clone())
            .await?;
        info!(event = "once_completed", "single tick completed");
        return Ok(());
    }

    let addr: SocketAddr = args
        .metrics_bind
        .clone()
        .unwrap_or_else(|| config.metrics_bind.clone())
        .parse()?;
    let server_handle = setup_server_with_addr(state.clone(), addr).await?;
    info!(event = "http_server_listening", addr = %addr, "serving /health and /metrics");

    let shutdown_handle = tokio::spawn(handle_shutdown_signals(state.shutdown_token.clone()));

    let result = sync_service
        .run(state.health.clone(), state.shutdown_token.clone())
        .await;

    state.shutdown_token.cancel();
    let _ = shutdown_handle.await;
    let _ = server_handle.await;
    result.map_err(Into::into)
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let args = parse_args();
    let mode = if args.once { "once" } else { "service" };
    let _logging = init_logging("chain_indexer", mode, &args.log_level);

    if let Err(err) = run(args).await {
        error!(
            event = "process_failed",
            report = %format_error_report(err.as_ref()),
            "chain indexer exited with an error"
        );
        std::process::exit(1);
    }
}
