//! `campusdock status` checks a running server over HTTP.
//! `campusdock generate-token` creates a random admin token.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use campusdock_protocol::{ConnectionStatus, SessionStatusEntry};

use crate::config::StatusArgs;
use crate::paths;
use crate::VERSION;

pub async fn run(args: &StatusArgs, data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  CampusDock v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let base = args.url.trim_end_matches('/');
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;

    let health_ok = client
        .get(format!("{base}/health"))
        .send()
        .await
        .is_ok_and(|r| r.status().is_success());
    if health_ok {
        println!("  Health: OK ({base}/health)");
    } else {
        println!("  Health: unreachable");
    }

    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);
    } else {
        println!("  Database: not found");
    }

    if !health_ok {
        println!();
        println!("  Server is not running.");
        println!("  Start with: campusdock start");
        println!();
        return Ok(());
    }

    let authed = |path: &str| {
        let req = client.get(format!("{base}{path}"));
        match &args.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    };

    match authed("/api/connection").send().await?.error_for_status() {
        Ok(resp) => {
            let status: ConnectionStatus = resp.json().await?;
            let state = if status.open { "open" } else { "closed" };
            println!(
                "  Store connection: {state} (opened {} times, {} active leases)",
                status.opens_total, status.active_leases
            );
            if let Some(ms) = status.idle_close_in_ms {
                println!("  Idle close in: {:.1}s", ms as f64 / 1000.0);
            }
        }
        Err(e) => println!("  Store connection: unavailable ({e})"),
    }

    match authed("/api/sessions").send().await?.error_for_status() {
        Ok(resp) => {
            let sessions: Vec<SessionStatusEntry> = resp.json().await?;
            println!("  Sessions: {}", sessions.len());
            for s in sessions {
                println!(
                    "    {}  {}  idle {}s  {}",
                    s.id,
                    s.peer_address,
                    s.idle_ms / 1000,
                    s.client_descriptor
                );
            }
        }
        Err(e) => println!("  Sessions: unavailable ({e})"),
    }

    println!();
    Ok(())
}

pub fn generate_token(data_dir: &Path) -> anyhow::Result<()> {
    let token = uuid::Uuid::new_v4().to_string();
    let token_path = paths::token_file_path();

    std::fs::create_dir_all(data_dir)?;

    std::fs::write(&token_path, &token)?;
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;

    println!();
    println!("  Admin token generated and saved to {}", token_path.display());
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  Usage:");
    println!("    campusdock start --admin-token {}", token);
    println!("  Or:");
    println!(
        "    campusdock start --admin-token $(cat {})",
        token_path.display()
    );
    println!();

    Ok(())
}
