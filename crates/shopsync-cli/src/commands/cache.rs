use std::time::Duration;

use serde_json::Value;

use crate::cli::CacheCommands;
use crate::commands::common::Session;
use crate::error::CliError;

pub fn run_cache(session: &Session, command: CacheCommands) -> Result<(), CliError> {
    match command {
        CacheCommands::Set { key, value, ttl } => {
            let value: Value = serde_json::from_str(&value)?;
            session
                .context
                .cache_set(&key, &value, ttl.map(Duration::from_secs))?;
            println!("Cached {key}");
        }
        CacheCommands::Get { key } => {
            let value = session
                .context
                .cache_get(&key)?
                .ok_or(CliError::CacheMiss(key))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        CacheCommands::Purge => {
            let purged = session.context.purge_expired_cache()?;
            println!("Purged {purged} expired entries");
        }
    }
    Ok(())
}
