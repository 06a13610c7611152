//! Database and user provisioning commands.
//!
//! Tokens are printed once and stored only as hashes.

use anyhow::{Context, Result, bail};
use edocebiv::config::Config;
use edocebiv::server::app::open_database;
use edocebiv::server::auth::{generate_token, hash_token};

pub fn cmd_init_db(config: &Config) -> Result<()> {
    open_database(config)?;
    println!("Database initialized at {}", config.storage.db_path.display());
    Ok(())
}

pub fn cmd_create_user(config: &Config, username: &str) -> Result<()> {
    let username = username.trim();
    if username.is_empty() {
        bail!("Username must not be empty");
    }
    let handle = open_database(config)?;
    let db = handle.lock_sync()?;
    if db.get_user_by_username(username)?.is_some() {
        bail!("User '{}' already exists", username);
    }
    let token = generate_token();
    let user = db.create_user(username, &hash_token(&token))?;
    tracing::info!(user_id = user.id, username, "User created");

    println!("Created user '{}'", user.username);
    println!("API token: {}", token);
    println!("Store it now; it cannot be shown again.");
    Ok(())
}

pub fn cmd_rotate_token(config: &Config, username: &str) -> Result<()> {
    let handle = open_database(config)?;
    let db = handle.lock_sync()?;
    let user = db
        .get_user_by_username(username)?
        .with_context(|| format!("User '{}' not found", username))?;
    let token = generate_token();
    db.set_token_hash(user.id, &hash_token(&token))?;
    tracing::info!(user_id = user.id, username, "Token rotated");

    println!("New API token for '{}': {}", user.username, token);
    Ok(())
}
