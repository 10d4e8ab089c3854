use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_appender::rolling;

use portal::backend::rest::RestBackend;
use portal::config::Config;
use portal::model::analytics::{DashboardStats, percentage};
use portal::models::Credentials;
use portal::routes::Navigator;
use portal::{LeaveManager, Session, TaskManager, ToastQueue};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = Config::from_env()?;

    // Rolling daily log
    let file_appender = rolling::daily(&config.log_dir, "portal.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .with_level(true)
        .pretty()
        .init();

    info!("Portal client starting...");

    let backend = Arc::new(
        RestBackend::connect(&config)
            .await
            .context("Failed to build backend client")?,
    );
    let navigator = Arc::new(Navigator::new());
    let toasts = ToastQueue::new(config.toast_ttl);

    let session = Session::initialize(backend.clone(), navigator.clone()).await;
    session.wait_until_ready().await;

    if !session.is_authenticated() {
        match (&config.email, &config.password) {
            (Some(email), Some(password)) => {
                let outcome = session
                    .sign_in(&Credentials {
                        email: email.clone(),
                        password: password.clone(),
                    })
                    .await;
                if let Some(error) = outcome.error {
                    toasts.show_error(error.clone());
                    anyhow::bail!("Sign in failed: {error}");
                }
            }
            _ => {
                warn!("No session and no PORTAL_EMAIL/PORTAL_PASSWORD set");
                anyhow::bail!("Not signed in; set PORTAL_EMAIL and PORTAL_PASSWORD");
            }
        }
    }

    let tasks = TaskManager::new(backend.clone(), session.clone());
    let leaves = LeaveManager::new(backend.clone(), session.clone());
    futures::join!(tasks.load_tasks(), leaves.load_leaves());

    let stats = DashboardStats {
        tasks: tasks.task_stats(),
        leaves: leaves.leave_stats(),
    };
    let today = Utc::now().date_naive();
    let overdue = tasks.tasks().iter().filter(|t| t.is_overdue(today)).count();

    if let Some(user) = session.current_user() {
        println!("Welcome, {} ({})", user.full_name, user.role);
    }
    println!(
        "Tasks: {} total, {} completed ({:.0}%), {} pending, {} overdue",
        stats.tasks.total,
        stats.tasks.completed,
        percentage(stats.tasks.completed, stats.tasks.total),
        stats.tasks.pending,
        overdue,
    );
    println!(
        "Leaves: {} total, {} approved ({:.0}%), {} pending, {} rejected",
        stats.leaves.total,
        stats.leaves.approved,
        percentage(stats.leaves.approved, stats.leaves.total),
        stats.leaves.pending,
        stats.leaves.rejected,
    );
    info!(?stats, route = %navigator.current(), "Dashboard loaded");
    toasts.show_info("Dashboard loaded");

    session.shutdown();
    Ok(())
}
