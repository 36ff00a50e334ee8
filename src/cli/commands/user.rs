//! User management command handlers

use anyhow::Context;
use std::io::BufRead;

use crate::config::Config;
use crate::db::Store;
use crate::domain::Role;
use crate::services::{NewUser, SeaOrmUserService, UserService};

async fn open_service(config: &Config) -> anyhow::Result<SeaOrmUserService> {
    let store = Store::new(&config.general.database_path).await?;
    Ok(SeaOrmUserService::new(store, config.security.clone()))
}

fn secret_or_stdin(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    eprintln!("Password (read from stdin):");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub async fn cmd_user_add(
    config: &Config,
    username: &str,
    role: &str,
    password: Option<String>,
) -> anyhow::Result<()> {
    let role: Role = role.parse()?;
    let secret = secret_or_stdin(password)?;
    let service = open_service(config).await?;

    let user = service
        .create(NewUser {
            username: username.to_string(),
            secret,
            role,
        })
        .await?;

    println!("✓ Created {} ({}) with id {}", user.username, user.role, user.id);
    Ok(())
}

pub async fn cmd_user_list(config: &Config) -> anyhow::Result<()> {
    let users = open_service(config).await?.list().await?;

    if users.is_empty() {
        println!("No users.");
        println!();
        println!("Add one with: vmcaptain user add <username> --role ADMIN");
        return Ok(());
    }

    println!("Users ({} total)", users.len());
    println!("{:-<70}", "");

    for user in users {
        let vms = if user.assigned_vms.is_empty() {
            "-".to_string()
        } else {
            user.assigned_vms.join(", ")
        };
        println!("{:<20} {:<6} {}", user.username, user.role, user.id);
        println!("  VMs: {vms}");
    }

    Ok(())
}

pub async fn cmd_user_reset_secret(
    config: &Config,
    username: &str,
    password: Option<String>,
) -> anyhow::Result<()> {
    let secret = secret_or_stdin(password)?;
    open_service(config)
        .await?
        .reset_secret(username, &secret)
        .await?;

    println!("✓ Password reset for {username}");
    Ok(())
}
